//! LED strip states driven through a single ordered worker task.
//!
//! Callers hand off a state change and never wait; the worker applies
//! commands strictly in submission order. `close` drains the queue before
//! shutting the strip down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Animation states of the strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    Wake,
    Listen,
    Processing,
    Speaking,
    Off,
}

/// Hardware seam for the strip itself.
#[async_trait]
pub trait LedStrip: Send + Sync {
    async fn apply(&self, state: LedState) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}

enum Command {
    Set(LedState),
    Close,
}

/// Fire-and-forget front end over a [`LedStrip`].
pub struct LedService {
    tx: mpsc::UnboundedSender<Command>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LedService {
    pub fn spawn(strip: Arc<dyn LedStrip>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Set(state) => {
                        debug!(?state, "led state");
                        if let Err(e) = strip.apply(state).await {
                            warn!(error = ?e, "led apply failed");
                        }
                    }
                    Command::Close => break,
                }
            }
            if let Err(e) = strip.apply(LedState::Off).await {
                warn!(error = ?e, "led off failed");
            }
            if let Err(e) = strip.close().await {
                warn!(error = ?e, "led close failed");
            }
        });
        Self {
            tx,
            worker: std::sync::Mutex::new(Some(worker)),
        }
    }

    /// Queues a state change without waiting for it to be applied.
    pub fn set_state(&self, state: LedState) {
        let _ = self.tx.send(Command::Set(state));
    }

    /// Drains pending commands, turns the strip off and releases it.
    /// Safe to call more than once.
    pub async fn close(&self) {
        let _ = self.tx.send(Command::Close);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                warn!("led worker did not drain in time");
            }
        }
    }
}

/// Log-only strip used when no LED hardware is attached.
#[derive(Debug, Default)]
pub struct LoggingLedStrip;

#[async_trait]
impl LedStrip for LoggingLedStrip {
    async fn apply(&self, state: LedState) -> anyhow::Result<()> {
        debug!(?state, "led");
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        debug!("led released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<LedState>>,
        closed: Mutex<bool>,
    }

    #[async_trait]
    impl LedStrip for Recorder {
        async fn apply(&self, state: LedState) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(state);
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn commands_apply_in_submission_order() {
        let strip = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        });
        let service = LedService::spawn(strip.clone());
        service.set_state(LedState::Wake);
        service.set_state(LedState::Listen);
        service.set_state(LedState::Processing);
        service.close().await;
        let seen = strip.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                LedState::Wake,
                LedState::Listen,
                LedState::Processing,
                LedState::Off
            ]
        );
        assert!(*strip.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn close_twice_is_harmless() {
        let strip = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        });
        let service = LedService::spawn(strip);
        service.close().await;
        service.close().await;
    }
}
