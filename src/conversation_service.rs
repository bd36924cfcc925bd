//! Binds the llama-server supervisor to the conversation loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::wait_with_cancel;
use crate::conversation::{ConversationFsm, ConversationPhase};
use crate::led::LedService;
use crate::llama::LlamaServer;

/// Builds a fresh conversation FSM wired to the given stop token. Called
/// once per successful service start, after the server is ready.
pub type FsmFactory = Box<dyn FnMut(CancellationToken) -> ConversationFsm + Send>;

#[derive(Debug, Clone)]
pub struct ConversationServiceConfig {
    pub base_url: String,
    pub readiness_timeout: Duration,
    pub health_timeout: Duration,
    pub health_interval: Duration,
    pub health_max_retries: u32,
    pub health_backoff: f64,
    pub shutdown_timeout: Duration,
    pub auto_restart: bool,
    pub restart_delay: Duration,
}

struct Inner {
    token: Option<CancellationToken>,
    fsm_task: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

/// Supervises the LLM server process plus the conversation FSM as one unit.
/// Restartable: `start` after `stop` brings up a fresh child and loop.
pub struct ConversationService {
    server: Arc<LlamaServer>,
    led: Arc<LedService>,
    factory: std::sync::Mutex<FsmFactory>,
    cfg: ConversationServiceConfig,
    inner: tokio::sync::Mutex<Inner>,
    phase_rx: std::sync::Mutex<Option<watch::Receiver<ConversationPhase>>>,
    // Handed to the watchdog so a restart can reach back into the service.
    weak_self: Weak<ConversationService>,
}

impl ConversationService {
    pub fn new(
        server: Arc<LlamaServer>,
        led: Arc<LedService>,
        factory: FsmFactory,
        cfg: ConversationServiceConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            server,
            led,
            factory: std::sync::Mutex::new(factory),
            cfg,
            inner: tokio::sync::Mutex::new(Inner {
                token: None,
                fsm_task: None,
                watchdog: None,
            }),
            phase_rx: std::sync::Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn server(&self) -> &Arc<LlamaServer> {
        &self.server
    }

    /// Snapshot of the conversation phase, present once the FSM has been
    /// constructed at least once.
    pub fn phase_rx(&self) -> Option<watch::Receiver<ConversationPhase>> {
        self.phase_rx.lock().unwrap().clone()
    }

    /// Starts the server, waits for readiness and health, then launches the
    /// conversation loop. On any failure the server is torn down again and
    /// no FSM is constructed.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.fsm_task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("conversation service already running");
            return Ok(());
        }

        info!("starting conversation service");
        if !self.server.is_running().await {
            self.server.start().await?;
        }

        match self.server.wait_ready(self.cfg.readiness_timeout).await {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    timeout = ?self.cfg.readiness_timeout,
                    "llama-server readiness timeout"
                );
                self.teardown_server().await;
                bail!("llama-server did not become ready");
            }
            Err(e) => {
                error!(error = %e, "llama-server failed before readiness");
                self.teardown_server().await;
                return Err(e.into());
            }
        }

        if !self
            .server
            .poll_health(
                &self.cfg.base_url,
                "/health",
                self.cfg.health_timeout,
                self.cfg.health_interval,
                self.cfg.health_max_retries,
                self.cfg.health_backoff,
            )
            .await
        {
            error!(base_url = %self.cfg.base_url, "llama-server health check failed");
            self.teardown_server().await;
            bail!("llama-server health check failed");
        }

        let token = CancellationToken::new();
        let fsm = {
            let mut factory = self.factory.lock().unwrap();
            (*factory)(token.clone())
        };
        *self.phase_rx.lock().unwrap() = Some(fsm.phase_rx());
        inner.fsm_task = Some(tokio::spawn(fsm.run()));
        inner.token = Some(token.clone());
        inner.watchdog = Some(tokio::spawn(watchdog_loop(
            self.weak_self.clone(),
            token,
            self.cfg.health_interval,
        )));
        info!("conversation service running");
        Ok(())
    }

    /// Stops the FSM and, when asked, the child process and LED resources.
    /// Safe to call repeatedly and across start/stop cycles.
    pub async fn stop(&self, terminate_process: bool, shutdown_resources: bool) {
        let mut inner = self.inner.lock().await;
        info!(terminate_process, shutdown_resources, "stopping conversation service");

        if let Some(token) = inner.token.take() {
            token.cancel();
        }
        if let Some(task) = inner.fsm_task.take() {
            if tokio::time::timeout(self.cfg.shutdown_timeout, task)
                .await
                .is_err()
            {
                error!("conversation loop did not stop in time, abandoning");
            }
        }
        if let Some(watchdog) = inner.watchdog.take() {
            watchdog.abort();
        }
        drop(inner);

        if terminate_process {
            self.teardown_server().await;
        }
        if shutdown_resources {
            self.led.close().await;
        }
    }

    /// Reports whether the conversation loop has terminated, waiting up to
    /// `timeout` for it.
    pub async fn join(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.fsm_task.as_mut() {
            None => true,
            Some(task) => {
                if tokio::time::timeout(timeout, &mut *task).await.is_ok() {
                    inner.fsm_task = None;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn teardown_server(&self) {
        self.server
            .stop(self.cfg.shutdown_timeout, self.cfg.shutdown_timeout)
            .await;
    }
}

/// Watches the child process; on unexpected exit the FSM is stopped and,
/// when configured, the whole service is started again after a delay.
fn watchdog_loop(
    service: Weak<ConversationService>,
    token: CancellationToken,
    interval: Duration,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        loop {
            if wait_with_cancel(interval, &token).await {
                return;
            }
            let Some(service) = service.upgrade() else {
                return;
            };
            let Some(code) = service.server.poll().await else {
                continue;
            };
            if token.is_cancelled() {
                return;
            }
            warn!(code, "llama-server exited unexpectedly");
            token.cancel();
            if service.cfg.auto_restart {
                tokio::time::sleep(service.cfg.restart_delay).await;
                info!("restarting conversation service after unexpected exit");
                if let Err(e) = service.start().await {
                    error!(error = %e, "conversation restart failed");
                }
            }
            return;
        }
    })
}
