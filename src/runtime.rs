//! Builds services from config and supervises their lifecycle.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audio::{SoundPlayer, SpeechToText, TextToSpeech};
use crate::behavior::{BehaviorCoordinator, DEFAULT_POLL_INTERVAL};
use crate::config::AppConfig;
use crate::conversation::{ConversationFsm, ConversationTuning};
use crate::conversation_service::{ConversationService, ConversationServiceConfig};
use crate::detect::Detection;
use crate::led::{LedService, LedStrip};
use crate::llama::{LlamaServer, LlamaServerConfig};
use crate::llm::{LlamaHttpClient, LlmClient};
use crate::movement::Movement;
use crate::social::SocialFsm;
use crate::vision::{Camera, Pipeline, VisionLoop};
use crate::ws::{self, WsState};

/// Device backends injected by the binary (real drivers) or by tests
/// (scripted stubs). The config decides which of them are actually used.
pub struct Platform {
    pub camera_factory: Box<dyn Fn() -> Box<dyn Camera> + Send + Sync>,
    pub pipeline: Arc<dyn Pipeline>,
    pub movement: Arc<dyn Movement>,
    pub stt_factory: Box<dyn FnMut() -> Box<dyn SpeechToText> + Send>,
    pub tts: Arc<dyn TextToSpeech>,
    pub led_strip: Arc<dyn LedStrip>,
    pub sound: Arc<dyn SoundPlayer>,
    /// Overrides the HTTP client built from the config when set.
    pub llm: Option<Arc<dyn LlmClient>>,
}

impl Platform {
    /// Stand-in backends: synthetic camera, empty pipeline, log-only body.
    pub fn headless() -> Self {
        use crate::audio::{LoggingSoundPlayer, LoggingTextToSpeech, NullSpeechToText};
        use crate::led::LoggingLedStrip;
        use crate::movement::LoggingMovement;
        use crate::vision::{NullPipeline, SyntheticCamera};

        Self {
            camera_factory: Box::new(|| Box::new(SyntheticCamera)),
            pipeline: Arc::new(NullPipeline {
                frame_space: (640.0, 480.0),
            }),
            movement: Arc::new(LoggingMovement::default()),
            stt_factory: Box::new(|| Box::new(NullSpeechToText)),
            tts: Arc::new(LoggingTextToSpeech),
            led_strip: Arc::new(LoggingLedStrip),
            sound: Arc::new(LoggingSoundPlayer),
            llm: None,
        }
    }
}

/// The subset of subsystems the config enabled.
pub struct Services {
    pub cfg: AppConfig,
    pub vision: Option<Arc<VisionLoop>>,
    pub movement: Option<Arc<dyn Movement>>,
    pub fsm: Option<Arc<Mutex<SocialFsm>>>,
    pub conversation: Option<Arc<ConversationService>>,
    pub conversation_disabled_reason: Option<String>,
}

impl Services {
    /// Materializes services from config. Must run inside the tokio
    /// runtime. A broken conversation setup disables conversation with a
    /// recorded reason instead of failing the build.
    pub fn build(cfg: AppConfig, platform: Platform) -> Result<Self> {
        let Platform {
            camera_factory,
            pipeline,
            movement,
            mut stt_factory,
            tts,
            led_strip,
            sound,
            llm,
        } = platform;

        let movement = cfg.enable_movement.then_some(movement);

        let vision = cfg.enable_vision.then(|| {
            Arc::new(VisionLoop::new(
                camera_factory,
                pipeline,
                cfg.vision.camera_fps,
                cfg.vision.max_capture_failures,
            ))
        });

        let fsm = match (&vision, &movement) {
            (Some(vision), Some(movement)) => Some(Arc::new(Mutex::new(
                SocialFsm::new(
                    movement.clone(),
                    Some(vision.roi_handle()),
                    cfg.behavior.social_fsm.clone(),
                )
                .with_sound(sound),
            ))),
            _ => None,
        };

        let mut conversation = None;
        let mut conversation_disabled_reason = None;
        if cfg.conversation_requested() {
            match Self::build_conversation(&cfg, llm, &mut stt_factory, tts, led_strip) {
                Ok(service) => conversation = Some(service),
                Err(reason) => {
                    warn!(%reason, "conversation disabled");
                    conversation_disabled_reason = Some(reason);
                }
            }
        }

        Ok(Self {
            cfg,
            vision,
            movement,
            fsm,
            conversation,
            conversation_disabled_reason,
        })
    }

    fn build_conversation(
        cfg: &AppConfig,
        llm: Option<Arc<dyn LlmClient>>,
        stt_factory: &mut Box<dyn FnMut() -> Box<dyn SpeechToText> + Send>,
        tts: Arc<dyn TextToSpeech>,
        led_strip: Arc<dyn LedStrip>,
    ) -> std::result::Result<Arc<ConversationService>, String> {
        let conv = &cfg.conversation;
        let mut missing = Vec::new();
        for (name, path) in [
            ("llama_binary", &conv.llama_binary),
            ("model_path", &conv.model_path),
        ] {
            if path.as_os_str().is_empty() {
                missing.push(format!("{name} not configured"));
            } else if !path.exists() {
                missing.push(format!("{name} not found: {}", path.display()));
            }
        }
        if !missing.is_empty() {
            return Err(missing.join("; "));
        }

        let mut server_cfg = LlamaServerConfig::new(&conv.llama_binary, &conv.model_path);
        server_cfg.port = conv.port;
        server_cfg.threads = conv.threads;
        server_cfg.parallel = conv.max_parallel_inference;
        let server = LlamaServer::new(server_cfg).map_err(|e| e.to_string())?;

        let base_url = if conv.llm_base_url.is_empty() {
            format!("http://127.0.0.1:{}", conv.port)
        } else {
            conv.llm_base_url.clone()
        };

        let llm: Arc<dyn LlmClient> = match llm {
            Some(llm) => llm,
            None => Arc::new(
                LlamaHttpClient::new(
                    base_url.clone(),
                    Duration::from_secs_f64(conv.llm_request_timeout),
                )
                .map_err(|e| e.to_string())?,
            ),
        };

        let led = Arc::new(LedService::spawn(led_strip));
        let tuning = ConversationTuning {
            stt_poll_interval: conv.stt_poll_interval,
            llm_retry_max_attempts: conv.llm_retry_max_attempts,
            llm_retry_initial_delay: conv.llm_retry_initial_delay,
            llm_retry_backoff: conv.llm_retry_backoff,
            llm_retry_max_delay: conv.llm_retry_max_delay,
            ..ConversationTuning::default()
        };
        let wake_words = conv.wake_words.clone();
        let system_prompt = conv.system_prompt.clone();

        // Each (re)start builds a fresh FSM around a new recognizer stream.
        let mut stt_factory = std::mem::replace(
            stt_factory,
            Box::new(|| Box::new(crate::audio::NullSpeechToText)),
        );
        let led_for_factory = led.clone();
        let factory = Box::new(move |stop: CancellationToken| {
            ConversationFsm::new(
                stt_factory(),
                tts.clone(),
                llm.clone(),
                led_for_factory.clone(),
                wake_words.clone(),
                system_prompt.clone(),
                tuning.clone(),
                stop,
                Vec::new(),
            )
        });

        let service_cfg = ConversationServiceConfig {
            base_url,
            readiness_timeout: Duration::from_secs_f64(conv.health_timeout),
            health_timeout: Duration::from_secs_f64(conv.health_timeout),
            health_interval: Duration::from_secs_f64(conv.health_check_interval.max(0.05)),
            health_max_retries: conv.health_check_max_retries,
            health_backoff: conv.health_check_backoff.max(1.0),
            shutdown_timeout: Duration::from_secs_f64(conv.shutdown_timeout),
            auto_restart: conv.auto_restart,
            restart_delay: Duration::from_secs_f64(conv.restart_delay),
        };

        Ok(ConversationService::new(
            Arc::new(server),
            led,
            factory,
            service_cfg,
        ))
    }
}

struct RunState {
    started: bool,
    stopped: bool,
    coordinator: Option<JoinHandle<()>>,
    ws_task: Option<JoinHandle<()>>,
}

/// Owns every service and starts/stops them in dependency order.
pub struct Runtime {
    services: Services,
    latest_detection: Arc<Mutex<Option<Detection>>>,
    coordinator_token: CancellationToken,
    ws_token: CancellationToken,
    shutdown_token: CancellationToken,
    state: tokio::sync::Mutex<RunState>,
}

impl Runtime {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            latest_detection: Arc::new(Mutex::new(None)),
            coordinator_token: CancellationToken::new(),
            ws_token: CancellationToken::new(),
            shutdown_token: CancellationToken::new(),
            state: tokio::sync::Mutex::new(RunState {
                started: false,
                stopped: false,
                coordinator: None,
                ws_task: None,
            }),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Newest detection observed by the frame handler.
    pub fn latest_detection(&self) -> Option<Detection> {
        self.latest_detection.lock().unwrap().clone()
    }

    /// Ordered startup. Only a movement failure is fatal; everything else
    /// logs and the runtime carries on without that subsystem.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.started {
            return Ok(());
        }
        state.started = true;
        info!("runtime starting");

        if let Some(reason) = &self.services.conversation_disabled_reason {
            warn!(%reason, "conversation disabled");
        }

        if let Some(movement) = &self.services.movement {
            movement.start().context("movement start failed")?;
            movement.relax();
        }

        if let Some(vision) = &self.services.vision {
            let fsm = self.services.fsm.clone();
            let latest = self.latest_detection.clone();
            let mut prev = Instant::now();
            vision.set_frame_handler(Box::new(move |detection| {
                let now = Instant::now();
                let dt = (now - prev).as_secs_f32();
                prev = now;
                *latest.lock().unwrap() = Some(detection.clone());
                if let Some(fsm) = &fsm {
                    if let Ok(mut fsm) = fsm.lock() {
                        fsm.on_frame(detection, dt);
                    }
                }
            }));
            vision.start(self.services.cfg.vision.interval_sec, None);
        }

        if let Some(conversation) = &self.services.conversation {
            if let Err(e) = conversation.start().await {
                error!(error = %e, "conversation start failed, continuing without it");
            }
        }

        if let (Some(fsm), Some(movement)) = (&self.services.fsm, &self.services.movement) {
            let phase = self
                .services
                .conversation
                .as_ref()
                .and_then(|c| c.phase_rx());
            let poll = self
                .services
                .cfg
                .behavior
                .poll_interval
                .map(Duration::from_secs_f64)
                .unwrap_or(DEFAULT_POLL_INTERVAL);
            let coordinator =
                BehaviorCoordinator::new(fsm.clone(), movement.clone(), phase, poll);
            state.coordinator = Some(coordinator.spawn(self.coordinator_token.clone()));
        }

        if self.services.cfg.enable_ws {
            let ws_state = Arc::new(WsState {
                vision: self.services.vision.clone(),
                movement: self.services.movement.clone(),
            });
            let cfg = &self.services.cfg.ws;
            match ws::serve(ws_state, &cfg.host, cfg.port, self.ws_token.clone()).await {
                Ok(task) => state.ws_task = Some(task),
                Err(e) => error!(error = %e, "ws server failed to start"),
            }
        }

        info!("runtime started");
        Ok(())
    }

    /// Ordered shutdown with bounded waits. A second call is a no-op.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.stopped {
            return;
        }
        state.stopped = true;
        info!("runtime stopping");

        self.coordinator_token.cancel();
        if let Some(task) = state.coordinator.take() {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                error!("behavior coordinator did not stop in time, abandoning");
            }
        }

        if let Some(conversation) = &self.services.conversation {
            conversation.stop(true, true).await;
        }

        self.ws_token.cancel();
        if let Some(task) = state.ws_task.take() {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                error!("ws server did not stop in time, abandoning");
            }
        }

        if let Some(vision) = &self.services.vision {
            vision.stop().await;
        }

        if let Some(movement) = &self.services.movement {
            if let Err(e) = movement.shutdown() {
                error!(error = %e, "movement shutdown failed");
            }
        }

        info!("runtime stopped");
        self.shutdown_token.cancel();
    }

    /// Starts everything and blocks until an OS signal or an external
    /// `stop` call, then shuts down. Signals are routed into the runtime's
    /// shutdown token, the same cancellation path every service uses.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        Self::cancel_on_signal(self.shutdown_token.clone());
        self.shutdown_token.cancelled().await;
        self.stop().await;
        Ok(())
    }

    /// Cancels `token` when `Ctrl+C` (or `SIGTERM` on Unix) arrives.
    fn cancel_on_signal(token: CancellationToken) {
        let interrupt = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
                interrupt.cancel();
            }
        });
        #[cfg(unix)]
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    if term.recv().await.is_some() {
                        info!("terminate received");
                        token.cancel();
                    }
                }
                Err(e) => error!(error = ?e, "failed to install SIGTERM handler"),
            }
        });
        #[cfg(not(unix))]
        drop(token);
    }
}
