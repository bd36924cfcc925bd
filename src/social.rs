//! Social behavior: face-driven IDLE/ALIGNING/INTERACT state machine.

use std::sync::Arc;

use rand::Rng;
use tracing::{info, warn};

use crate::audio::SoundPlayer;
use crate::clock;
use crate::config::SocialFsmConfig;
use crate::detect::{Detection, TargetBox};
use crate::movement::Movement;
use crate::tracker::VisualTracker;
use crate::vision::RoiHandle;

/// Seconds of sustained drift before INTERACT degrades to ALIGNING.
const DRIFT_GRACE_SEC: f64 = 0.4;

const INTERACT_CUE: &str = "meow1.wav";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocialState {
    Idle,
    Aligning,
    Interact,
}

type StateCallback = Box<dyn Fn(SocialState) + Send>;

/// Face-alignment social state machine. Owns the visual tracker and drives
/// it every frame; transitions are decided from the same detection.
pub struct SocialFsm {
    cfg: SocialFsmConfig,
    movement: Arc<dyn Movement>,
    pub tracker: VisualTracker,
    sound: Option<Arc<dyn SoundPlayer>>,
    on_enter: Option<StateCallback>,
    on_exit: Option<StateCallback>,

    state: SocialState,
    miss_frames: u32,
    lock_frames: u32,
    interact_until: f64,
    last_active: f64,
    drift_until: Option<f64>,
    last_interact: Option<f64>,
    next_cue_at: f64,
    paused: bool,
    muted: bool,
    idle_stopped: bool,
}

impl SocialFsm {
    pub fn new(
        movement: Arc<dyn Movement>,
        roi: Option<RoiHandle>,
        cfg: SocialFsmConfig,
    ) -> Self {
        let mut tracker = VisualTracker::new(movement.clone(), roi);
        // Keep the tracker's deadband in sync so state decisions and turn
        // pulses agree on what "centered" means.
        tracker.x.deadband_x = cfg.deadband_x;
        tracker.lock_frames_needed = cfg.lock_frames_needed;
        tracker.miss_release = cfg.miss_release;
        Self {
            movement,
            tracker,
            sound: None,
            on_enter: None,
            on_exit: None,
            state: SocialState::Idle,
            miss_frames: 0,
            lock_frames: 0,
            interact_until: 0.0,
            last_active: clock::now(),
            drift_until: None,
            last_interact: None,
            next_cue_at: 0.0,
            paused: false,
            muted: false,
            idle_stopped: false,
            cfg,
        }
    }

    pub fn with_sound(mut self, sound: Arc<dyn SoundPlayer>) -> Self {
        self.sound = Some(sound);
        self
    }

    pub fn on_enter(mut self, callback: StateCallback) -> Self {
        self.on_enter = Some(callback);
        self
    }

    pub fn on_exit(mut self, callback: StateCallback) -> Self {
        self.on_exit = Some(callback);
        self
    }

    pub fn state(&self) -> SocialState {
        self.state
    }

    /// Freezes the FSM: frames are ignored and no transitions happen until
    /// `resume`.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Suppresses the audio cue only; tracking and transitions continue.
    pub fn mute_social(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Enables or disables both tracking axes at once.
    pub fn set_tracking(&mut self, enabled: bool) {
        self.tracker.set_enabled(Some(enabled), Some(enabled));
    }

    /// Advances the FSM with one detection frame.
    pub fn on_frame(&mut self, detection: &Detection, dt: f32) {
        if self.paused {
            return;
        }

        self.tracker.update(detection, dt);

        let face = self.select_face(detection);
        let ex = face.map_or(0.0, |f| Self::ex_for(f, detection.frame_space.0));
        let now = clock::now();

        if face.is_some() {
            self.miss_frames = 0;
            self.last_active = now;
        } else {
            self.miss_frames += 1;
            self.lock_frames = 0;
            if now - self.last_active > self.cfg.relax_timeout_s {
                self.movement.relax();
                self.last_active = now;
            }
        }

        if self.state == SocialState::Interact {
            if self.miss_frames >= self.cfg.miss_release || now >= self.interact_until {
                self.set_state(SocialState::Idle, now);
                return;
            }
            if ex.abs() > self.cfg.deadband_x {
                self.lock_frames = 0;
                let deadline = *self.drift_until.get_or_insert(now + DRIFT_GRACE_SEC);
                if now >= deadline {
                    self.set_state(SocialState::Aligning, now);
                }
            } else {
                self.drift_until = None;
            }
            return;
        }

        if face.is_none() {
            if self.miss_frames >= self.cfg.miss_release {
                self.set_state(SocialState::Idle, now);
            }
        } else {
            if self.state == SocialState::Idle {
                self.set_state(SocialState::Aligning, now);
            }
            if ex.abs() <= self.cfg.deadband_x {
                self.lock_frames += 1;
                if self.lock_frames >= self.cfg.lock_frames_needed
                    && self.interact_cooldown_over(now)
                {
                    self.set_state(SocialState::Interact, now);
                }
            } else {
                self.lock_frames = 0;
            }
        }

        if self.state == SocialState::Idle {
            if !self.idle_stopped {
                self.movement.stop_motion();
                self.idle_stopped = true;
            }
        } else {
            self.idle_stopped = false;
        }
    }

    fn interact_cooldown_over(&self, now: f64) -> bool {
        let cooldown = self.cfg.cooldown_ms as f64 / 1000.0;
        self.last_interact
            .map_or(true, |last| now - last >= cooldown)
    }

    fn select_face<'a>(&self, detection: &'a Detection) -> Option<&'a TargetBox> {
        detection
            .targets
            .iter()
            .filter(|t| t.score >= self.cfg.min_score)
            .max_by(|a, b| a.area().total_cmp(&b.area()))
    }

    fn ex_for(face: &TargetBox, space_w: f32) -> f32 {
        if space_w <= 0.0 {
            return 0.0;
        }
        let half = space_w / 2.0;
        (face.x + face.w / 2.0 - half) / half
    }

    fn set_state(&mut self, new_state: SocialState, now: f64) {
        if new_state == self.state {
            return;
        }
        info!(from = ?self.state, to = ?new_state, "social state");
        if let Some(cb) = &self.on_exit {
            cb(self.state);
        }
        self.state = new_state;
        if let Some(cb) = &self.on_enter {
            cb(new_state);
        }

        if new_state == SocialState::Interact {
            self.interact_until = now + self.cfg.interact_ms as f64 / 1000.0;
            self.last_interact = Some(now);
            self.last_active = now;
            self.play_cue(now);
        } else {
            self.lock_frames = 0;
            self.drift_until = None;
        }
    }

    fn play_cue(&mut self, now: f64) {
        if self.muted || now < self.next_cue_at {
            return;
        }
        let (min, max) = (
            self.cfg.meow_cooldown_min_s,
            self.cfg.meow_cooldown_max_s.max(self.cfg.meow_cooldown_min_s),
        );
        self.next_cue_at = now + rand::thread_rng().gen_range(min..=max);
        match &self.sound {
            Some(player) => {
                if let Err(e) = player.play(INTERACT_CUE) {
                    warn!(error = ?e, "interact cue failed");
                }
            }
            None => info!("meow"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::HeadLimits;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct QuietMovement {
        relaxes: AtomicU32,
    }

    impl Movement for QuietMovement {
        fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn shutdown(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn relax(&self) {
            self.relaxes.fetch_add(1, Ordering::SeqCst);
        }
        fn stop_motion(&self) {}
        fn turn_left(&self, _d: u64, _s: f32) {}
        fn turn_right(&self, _d: u64, _s: f32) {}
        fn head_deg(&self, _deg: f32, _d: u64) {}
        fn walk(&self, _vx: f32, _vy: f32, _o: f32) {}
        fn head_limits(&self) -> HeadLimits {
            HeadLimits::default()
        }
    }

    #[derive(Default)]
    struct CountingPlayer {
        plays: AtomicU32,
    }

    impl SoundPlayer for CountingPlayer {
        fn play(&self, _clip: &str) -> anyhow::Result<()> {
            self.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn centered_detection(cx_norm: f32, score: f32) -> Detection {
        let space = (640.0, 480.0);
        let w = 80.0;
        let center = space.0 / 2.0 + cx_norm * space.0 / 2.0;
        let mut det = Detection::miss(space);
        det.ok = true;
        det.targets = vec![TargetBox {
            x: center - w / 2.0,
            y: 200.0,
            w,
            h: 80.0,
            score,
        }];
        det
    }

    fn fsm_with(cfg: SocialFsmConfig, player: Arc<CountingPlayer>) -> SocialFsm {
        SocialFsm::new(Arc::new(QuietMovement::default()), None, cfg).with_sound(player)
    }

    fn test_cfg() -> SocialFsmConfig {
        SocialFsmConfig {
            deadband_x: 0.12,
            lock_frames_needed: 3,
            miss_release: 5,
            ..SocialFsmConfig::default()
        }
    }

    #[test]
    fn locks_into_interact_after_centered_frames() {
        let player = Arc::new(CountingPlayer::default());
        let states = Arc::new(Mutex::new(Vec::new()));
        let trace = states.clone();
        let mut fsm = fsm_with(test_cfg(), player.clone())
            .on_enter(Box::new(move |s| trace.lock().unwrap().push(s)));

        for cx in [0.0, 0.05, 0.10] {
            fsm.on_frame(&centered_detection(cx, 1.0), 0.1);
        }
        assert_eq!(fsm.state(), SocialState::Interact);
        assert_eq!(
            states.lock().unwrap().clone(),
            vec![SocialState::Aligning, SocialState::Interact]
        );
        assert_eq!(player.plays.load(Ordering::SeqCst), 1);

        // Losing the face for miss_release frames falls back to IDLE.
        let miss = Detection::miss((640.0, 480.0));
        for _ in 0..5 {
            fsm.on_frame(&miss, 0.1);
        }
        assert_eq!(fsm.state(), SocialState::Idle);
    }

    #[test]
    fn off_center_face_never_locks() {
        let player = Arc::new(CountingPlayer::default());
        let mut fsm = fsm_with(test_cfg(), player);
        for _ in 0..20 {
            fsm.on_frame(&centered_detection(0.5, 1.0), 0.1);
        }
        assert_eq!(fsm.state(), SocialState::Aligning);
    }

    #[test]
    fn sustained_drift_degrades_interact() {
        let player = Arc::new(CountingPlayer::default());
        let mut cfg = test_cfg();
        cfg.interact_ms = 60_000;
        let mut fsm = fsm_with(cfg, player);
        for cx in [0.0, 0.0, 0.0] {
            fsm.on_frame(&centered_detection(cx, 1.0), 0.05);
        }
        assert_eq!(fsm.state(), SocialState::Interact);
        // 0.5 s of drift exceeds the 0.4 s grace.
        let start = clock::now();
        while clock::now() - start < 0.5 {
            fsm.on_frame(&centered_detection(0.5, 1.0), 0.05);
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        fsm.on_frame(&centered_detection(0.5, 1.0), 0.05);
        assert_eq!(fsm.state(), SocialState::Aligning);
    }

    #[test]
    fn low_score_counts_as_miss() {
        let player = Arc::new(CountingPlayer::default());
        let mut cfg = test_cfg();
        cfg.min_score = 0.75;
        let mut fsm = fsm_with(cfg, player);
        for _ in 0..10 {
            fsm.on_frame(&centered_detection(0.0, 0.5), 0.1);
        }
        assert_eq!(fsm.state(), SocialState::Idle);
    }

    #[test]
    fn paused_fsm_holds_state() {
        let player = Arc::new(CountingPlayer::default());
        let mut fsm = fsm_with(test_cfg(), player);
        fsm.pause();
        for _ in 0..10 {
            fsm.on_frame(&centered_detection(0.0, 1.0), 0.1);
        }
        assert_eq!(fsm.state(), SocialState::Idle);
        fsm.resume();
        for _ in 0..3 {
            fsm.on_frame(&centered_detection(0.0, 1.0), 0.1);
        }
        assert_eq!(fsm.state(), SocialState::Interact);
    }

    #[test]
    fn cue_respects_its_cooldown() {
        let player = Arc::new(CountingPlayer::default());
        let mut cfg = test_cfg();
        cfg.meow_cooldown_min_s = 60.0;
        cfg.meow_cooldown_max_s = 60.0;
        let mut fsm = fsm_with(cfg, player.clone());

        for cx in [0.0, 0.0, 0.0] {
            fsm.on_frame(&centered_detection(cx, 1.0), 0.1);
        }
        assert_eq!(player.plays.load(Ordering::SeqCst), 1);

        // Leave and re-enter INTERACT immediately: no second cue.
        let miss = Detection::miss((640.0, 480.0));
        for _ in 0..5 {
            fsm.on_frame(&miss, 0.1);
        }
        for _ in 0..3 {
            fsm.on_frame(&centered_detection(0.0, 1.0), 0.1);
        }
        assert_eq!(fsm.state(), SocialState::Interact);
        assert_eq!(player.plays.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn muted_fsm_skips_cue_but_still_interacts() {
        let player = Arc::new(CountingPlayer::default());
        let mut fsm = fsm_with(test_cfg(), player.clone());
        fsm.mute_social(true);
        for _ in 0..3 {
            fsm.on_frame(&centered_detection(0.0, 1.0), 0.1);
        }
        assert_eq!(fsm.state(), SocialState::Interact);
        assert_eq!(player.plays.load(Ordering::SeqCst), 0);
    }
}
