//! Seam to the body: gait, turns and head pitch.
//!
//! The real servo driver lives outside this crate; the runtime only needs
//! non-blocking commands and the head travel limits.

use tracing::debug;

/// Head pitch travel in degrees.
#[derive(Debug, Clone, Copy)]
pub struct HeadLimits {
    pub min_deg: f32,
    pub max_deg: f32,
    pub center_deg: f32,
}

impl Default for HeadLimits {
    fn default() -> Self {
        Self {
            min_deg: -30.0,
            max_deg: 30.0,
            center_deg: 0.0,
        }
    }
}

/// Body and head command surface. Every command is fire-and-forget; the
/// driver queues and executes asynchronously.
pub trait Movement: Send + Sync {
    fn start(&self) -> anyhow::Result<()>;
    fn shutdown(&self) -> anyhow::Result<()>;
    /// Drops the body into its rest posture.
    fn relax(&self);
    /// Halts any in-flight gait or turn.
    fn stop_motion(&self);
    fn turn_left(&self, duration_ms: u64, speed: f32);
    fn turn_right(&self, duration_ms: u64, speed: f32);
    /// Moves the head pitch to `deg` over `duration_ms`.
    fn head_deg(&self, deg: f32, duration_ms: u64);
    fn walk(&self, vx: f32, vy: f32, omega: f32);
    fn head_limits(&self) -> HeadLimits;
}

/// Log-only stand-in used when no servo hardware is attached.
#[derive(Debug, Default)]
pub struct LoggingMovement {
    limits: HeadLimits,
}

impl Movement for LoggingMovement {
    fn start(&self) -> anyhow::Result<()> {
        debug!("movement start");
        Ok(())
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        debug!("movement shutdown");
        Ok(())
    }

    fn relax(&self) {
        debug!("relax");
    }

    fn stop_motion(&self) {
        debug!("stop motion");
    }

    fn turn_left(&self, duration_ms: u64, speed: f32) {
        debug!(duration_ms, speed, "turn left");
    }

    fn turn_right(&self, duration_ms: u64, speed: f32) {
        debug!(duration_ms, speed, "turn right");
    }

    fn head_deg(&self, deg: f32, duration_ms: u64) {
        debug!(deg, duration_ms, "head");
    }

    fn walk(&self, vx: f32, vy: f32, omega: f32) {
        debug!(vx, vy, omega, "walk");
    }

    fn head_limits(&self) -> HeadLimits {
        self.limits
    }
}
