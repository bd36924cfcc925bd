//! Arbitration between the social FSM and the conversation loop.
//!
//! Only one of them may own the body at a time. The coordinator polls the
//! conversation phase snapshot and flips the social subsystem accordingly;
//! every action is guarded so repeating a decision is a no-op.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::wait_with_cancel;
use crate::conversation::ConversationPhase;
use crate::movement::Movement;
use crate::social::SocialFsm;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehaviorMode {
    Boot,
    Converse,
    Social,
    Idle,
}

pub struct BehaviorCoordinator {
    fsm: Arc<Mutex<SocialFsm>>,
    movement: Arc<dyn Movement>,
    phase: Option<watch::Receiver<ConversationPhase>>,
    poll_interval: Duration,
    mode: BehaviorMode,
    face_tracking_enabled: Option<bool>,
    movement_relaxed: bool,
}

impl BehaviorCoordinator {
    pub fn new(
        fsm: Arc<Mutex<SocialFsm>>,
        movement: Arc<dyn Movement>,
        phase: Option<watch::Receiver<ConversationPhase>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            fsm,
            movement,
            phase,
            poll_interval,
            mode: BehaviorMode::Boot,
            face_tracking_enabled: None,
            movement_relaxed: false,
        }
    }

    pub fn spawn(mut self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if wait_with_cancel(self.poll_interval, &token).await {
                    break;
                }
                self.coordinate();
            }
            debug!("behavior coordinator stopped");
        })
    }

    pub fn mode(&self) -> BehaviorMode {
        self.mode
    }

    /// One arbitration pass; public for tests.
    pub fn coordinate(&mut self) {
        let phase = self.phase.as_ref().map(|rx| *rx.borrow());
        match phase {
            Some(ConversationPhase::Think) | Some(ConversationPhase::Speak) => {
                let changed = self.set_mode(BehaviorMode::Converse);
                self.set_face_tracking(false);
                self.with_fsm(|fsm| fsm.pause());
                if changed {
                    self.movement.stop_motion();
                }
                self.movement_relaxed = false;
            }
            Some(ConversationPhase::AttentiveListen) | Some(ConversationPhase::Wake) => {
                self.set_mode(BehaviorMode::Social);
                self.set_face_tracking(true);
                self.with_fsm(|fsm| {
                    fsm.resume();
                    fsm.mute_social(true);
                });
                self.movement_relaxed = false;
            }
            None => {
                self.set_mode(BehaviorMode::Idle);
                self.set_face_tracking(true);
                self.with_fsm(|fsm| {
                    fsm.resume();
                    fsm.mute_social(false);
                });
                if !self.movement_relaxed {
                    self.movement.relax();
                    self.movement_relaxed = true;
                }
            }
        }
    }

    fn with_fsm(&self, f: impl FnOnce(&mut SocialFsm)) {
        match self.fsm.lock() {
            Ok(mut fsm) => f(&mut fsm),
            Err(e) => warn!(error = %e, "social fsm unavailable"),
        }
    }

    fn set_face_tracking(&mut self, enabled: bool) {
        if self.face_tracking_enabled == Some(enabled) {
            return;
        }
        self.with_fsm(|fsm| fsm.set_tracking(enabled));
        self.face_tracking_enabled = Some(enabled);
    }

    fn set_mode(&mut self, mode: BehaviorMode) -> bool {
        if mode == self.mode {
            return false;
        }
        info!(from = ?self.mode, to = ?mode, "behavior mode");
        self.mode = mode;
        true
    }
}
