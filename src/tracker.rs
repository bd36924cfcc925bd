//! Two-axis visual tracking: body turn pulses and head pitch control.

use std::sync::Arc;

use tracing::{debug, info};

use crate::detect::{Detection, TargetBox};
use crate::movement::Movement;
use crate::pid::IncrementalPid;
use crate::vision::RoiHandle;

fn clamp(value: f32, min: f32, max: f32) -> f32 {
    value.clamp(min, max)
}

/// Horizontal controller: fires short in-place turn pulses when the target
/// drifts out of the deadband, with a cooldown equal to the pulse length.
pub struct TurnController {
    pub deadband_x: f32,
    pub k_turn: f32,
    pub base_pulse_ms: f32,
    pub min_pulse_ms: f32,
    pub max_pulse_ms: f32,
    pub turn_speed: f32,
    pub enabled: bool,
    turn_cooldown: f32,
}

impl Default for TurnController {
    fn default() -> Self {
        Self {
            deadband_x: 0.12,
            k_turn: 0.8,
            base_pulse_ms: 120.0,
            min_pulse_ms: 60.0,
            max_pulse_ms: 180.0,
            turn_speed: 0.3,
            enabled: true,
            turn_cooldown: 0.0,
        }
    }
}

impl TurnController {
    /// Progresses the cooldown timer.
    pub fn tick(&mut self, dt: f32) {
        if self.turn_cooldown > 0.0 {
            self.turn_cooldown = (self.turn_cooldown - dt.max(0.0)).max(0.0);
        }
    }

    pub fn reset(&mut self) {
        self.turn_cooldown = 0.0;
    }

    pub fn cooldown(&self) -> f32 {
        self.turn_cooldown
    }

    /// Turns the body toward the target based on horizontal error `ex`
    /// (normalized to `[-1, 1]`).
    pub fn update(&mut self, movement: &dyn Movement, ex: f32, dt: f32) {
        self.tick(dt);
        if !self.enabled || self.turn_cooldown > 0.0 {
            return;
        }
        if ex.abs() <= self.deadband_x {
            return;
        }

        let scale = (ex.abs() * self.k_turn).min(1.0);
        let pulse = clamp(self.base_pulse_ms * scale, self.min_pulse_ms, self.max_pulse_ms) as u64;
        if pulse == 0 {
            return;
        }

        if ex > 0.0 {
            movement.turn_right(pulse, self.turn_speed);
        } else {
            movement.turn_left(pulse, self.turn_speed);
        }
        self.turn_cooldown = pulse as f32 / 1000.0;
    }
}

/// Vertical controller: EMA-smoothed target center fed through a PID that
/// nudges the head pitch in bounded steps.
pub struct HeadController {
    pid: IncrementalPid,
    pub pid_scale: f32,
    pub ema_alpha: f32,
    pub error_threshold: f32,
    pub delta_limit_deg: f32,
    pub head_duration_ms: u64,
    pub recenter_speed_deg: f32,
    pub recenter_duration_ms: u64,
    pub enabled: bool,
    ema_center: Option<f32>,
    current_head_deg: f32,
}

impl HeadController {
    pub fn new(movement: &dyn Movement) -> Self {
        Self {
            pid: IncrementalPid::new(20.0, 0.0, 5.0),
            pid_scale: 0.1,
            ema_alpha: 0.2,
            error_threshold: 0.05,
            delta_limit_deg: 3.0,
            head_duration_ms: 100,
            recenter_speed_deg: 5.0,
            recenter_duration_ms: 150,
            enabled: true,
            ema_center: None,
            current_head_deg: movement.head_limits().center_deg,
        }
    }

    /// Clears smoothing state after losing the target.
    pub fn reset(&mut self) {
        self.ema_center = None;
    }

    pub fn current_deg(&self) -> f32 {
        self.current_head_deg
    }

    /// Updates the pitch toward the target's vertical center. Returns the
    /// normalized error when the space is usable.
    pub fn update(
        &mut self,
        movement: &dyn Movement,
        target: &TargetBox,
        space: (f32, f32),
    ) -> Option<f32> {
        let space_h = space.1;
        if space_h <= 0.0 {
            return None;
        }

        let center_y = target.y + target.h / 2.0;
        self.ema_center = Some(match self.ema_center {
            None => center_y,
            Some(prev) => self.ema_alpha * center_y + (1.0 - self.ema_alpha) * prev,
        });

        let mid = space_h / 2.0;
        let error = (self.ema_center.unwrap() - mid) / mid;
        if error.abs() < self.error_threshold {
            return Some(error);
        }

        let delta = clamp(
            self.pid.compute(error) * self.pid_scale,
            -self.delta_limit_deg,
            self.delta_limit_deg,
        );
        if !self.enabled {
            return Some(error);
        }

        let limits = movement.head_limits();
        let next = clamp(self.current_head_deg + delta, limits.min_deg, limits.max_deg);
        if next != self.current_head_deg {
            self.current_head_deg = next;
            movement.head_deg(next, self.head_duration_ms);
            debug!(error, delta, target_deg = next, "head update");
        }
        Some(error)
    }

    /// Slews the head back toward center after a long target loss.
    pub fn recenter(&mut self, movement: &dyn Movement, dt: f32) {
        if !self.enabled {
            return;
        }
        let limits = movement.head_limits();
        let diff = limits.center_deg - self.current_head_deg;
        if diff == 0.0 {
            return;
        }
        let max_step = (self.recenter_speed_deg * dt).max(0.0);
        if max_step <= 0.0 {
            return;
        }
        let step = clamp(diff, -max_step, max_step);
        let next = clamp(
            self.current_head_deg + step,
            limits.min_deg,
            limits.max_deg,
        );
        if next != self.current_head_deg {
            self.current_head_deg = next;
            movement.head_deg(next, self.recenter_duration_ms);
        }
    }
}

/// Composes the two axis controllers with the hit/miss lock state machine
/// and the inference ROI feedback.
pub struct VisualTracker {
    movement: Arc<dyn Movement>,
    roi: Option<RoiHandle>,
    pub x: TurnController,
    pub y: HeadController,
    had_target: bool,
    locked: bool,
    face_count: u32,
    miss_count: u32,
    pub lock_frames_needed: u32,
    pub miss_release: u32,
    pub recenter_after: u32,
}

impl VisualTracker {
    pub fn new(movement: Arc<dyn Movement>, roi: Option<RoiHandle>) -> Self {
        let y = HeadController::new(movement.as_ref());
        Self {
            movement,
            roi,
            x: TurnController::default(),
            y,
            had_target: false,
            locked: false,
            face_count: 0,
            miss_count: 0,
            lock_frames_needed: 3,
            miss_release: 5,
            recenter_after: 40,
        }
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn set_enabled(&mut self, enable_x: Option<bool>, enable_y: Option<bool>) {
        if let Some(x) = enable_x {
            self.x.enabled = x;
        }
        if let Some(y) = enable_y {
            self.y.enabled = y;
        }
    }

    /// Advances the tracker with one detection and the elapsed time since
    /// the previous frame.
    pub fn update(&mut self, detection: &Detection, dt: f32) {
        let Some(target) = detection.largest_target().copied() else {
            self.on_miss(dt);
            return;
        };

        let space = detection.frame_space;
        if space.0 <= 0.0 || space.1 <= 0.0 {
            self.x.tick(dt);
            return;
        }

        self.miss_count = 0;
        self.face_count += 1;
        if !self.locked && self.face_count >= self.lock_frames_needed {
            self.locked = true;
            info!("target lock acquired");
        }
        if !self.had_target {
            info!("target detected");
            self.had_target = true;
        }

        let center_x = target.x + target.w / 2.0;
        let half_w = space.0 / 2.0;
        let ex = (center_x - half_w) / half_w;
        self.x.update(self.movement.as_ref(), ex, dt);
        self.y.update(self.movement.as_ref(), &target, space);

        if let Some(roi) = &self.roi {
            if self.locked {
                roi.set(Some(target.inflated(0.2, space)));
            } else {
                roi.set(None);
            }
        }
    }

    fn on_miss(&mut self, dt: f32) {
        if self.had_target {
            info!("target lost");
            self.had_target = false;
        }
        self.face_count = 0;
        self.miss_count += 1;
        self.y.reset();
        if self.locked && self.miss_count >= self.miss_release {
            self.locked = false;
            if let Some(roi) = &self.roi {
                roi.set(None);
            }
            info!("target lock released");
        }
        self.movement.stop_motion();
        self.x.tick(dt);
        if self.miss_count >= self.recenter_after {
            self.y.recenter(self.movement.as_ref(), dt);
        }
    }
}
