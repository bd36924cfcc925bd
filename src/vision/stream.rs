//! Periodic capture → detect → publish loop.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::Bus;
use crate::clock::{self, Ticker};
use crate::detect::{Detection, Roi};
use crate::vision::camera::{Camera, CameraWorker};
use crate::vision::pipeline::{Pipeline, ProcessOptions};

/// Frames older than this are considered stale and skipped.
const STALE_FRAME_SEC: f64 = 0.2;
/// Minimum spacing between detection passes, however fast the loop runs.
const DETECT_MIN_SPACING: Duration = Duration::from_millis(200);
/// How often the rolling metrics are flushed to the log.
const METRICS_WINDOW: Duration = Duration::from_secs(5);

/// Callback invoked with every detection before it reaches the bus.
pub type FrameHandler = Box<dyn FnMut(&Detection) + Send>;

/// Thread-safe handle the tracker uses to crop inference.
#[derive(Clone, Default)]
pub struct RoiHandle {
    inner: Arc<Mutex<Option<Roi>>>,
}

impl RoiHandle {
    pub fn set(&self, roi: Option<Roi>) {
        *self.inner.lock().unwrap() = roi;
    }

    pub fn get(&self) -> Option<Roi> {
        *self.inner.lock().unwrap()
    }
}

struct LoopState {
    worker: Option<Arc<CameraWorker>>,
    task: Option<JoinHandle<()>>,
    token: CancellationToken,
}

/// Owns the camera worker and the detection task; fans results out through
/// the bus and keeps the latest encoded frame for the command surface.
pub struct VisionLoop {
    pipeline: Arc<dyn Pipeline>,
    camera_factory: Box<dyn Fn() -> Box<dyn Camera> + Send + Sync>,
    camera_fps: f64,
    max_capture_failures: u32,
    bus: Arc<Bus<Detection>>,
    roi: RoiHandle,
    frame_handler: Arc<Mutex<Option<FrameHandler>>>,
    last_encoded: Arc<Mutex<Option<String>>>,
    last_error: Arc<Mutex<Option<String>>>,
    state: Mutex<LoopState>,
}

impl VisionLoop {
    pub fn new(
        camera_factory: Box<dyn Fn() -> Box<dyn Camera> + Send + Sync>,
        pipeline: Arc<dyn Pipeline>,
        camera_fps: f64,
        max_capture_failures: u32,
    ) -> Self {
        Self {
            pipeline,
            camera_factory,
            camera_fps,
            max_capture_failures,
            bus: Arc::new(Bus::new()),
            roi: RoiHandle::default(),
            frame_handler: Arc::new(Mutex::new(None)),
            last_encoded: Arc::new(Mutex::new(None)),
            last_error: Arc::new(Mutex::new(None)),
            state: Mutex::new(LoopState {
                worker: None,
                task: None,
                token: CancellationToken::new(),
            }),
        }
    }

    /// Detection fan-out; subscribers always observe the newest result.
    pub fn bus(&self) -> &Arc<Bus<Detection>> {
        &self.bus
    }

    /// Handle the tracker uses to focus inference on the locked target.
    pub fn roi_handle(&self) -> RoiHandle {
        self.roi.clone()
    }

    /// Crops (or uncrops) inference. Thread-safe.
    pub fn set_roi(&self, roi: Option<Roi>) {
        self.roi.set(roi);
    }

    /// Installs (or replaces) the per-frame callback. The handler survives
    /// stop/start cycles.
    pub fn set_frame_handler(&self, handler: FrameHandler) {
        *self.frame_handler.lock().unwrap() = Some(handler);
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .task
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    /// Last processed frame as base64 JPEG.
    pub fn last_encoded(&self) -> Option<String> {
        self.last_encoded.lock().unwrap().clone()
    }

    /// Waits up to `timeout` for an encoded frame to become available.
    pub async fn snapshot_b64(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(img) = self.last_encoded() {
                return Some(img);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Starts the camera worker and the detection loop. Idempotent: calling
    /// `start` while running is a no-op, and calling it again after a
    /// capture failure opens a fresh camera.
    pub fn start(&self, interval_sec: f64, frame_handler: Option<FrameHandler>) {
        if let Some(handler) = frame_handler {
            self.set_frame_handler(handler);
        }
        let mut state = self.state.lock().unwrap();
        if state.task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("vision loop already running");
            return;
        }

        let worker = match state.worker.take() {
            Some(existing) if existing.is_running() => existing,
            _ => Arc::new(CameraWorker::start(
                (self.camera_factory)(),
                self.camera_fps,
                self.max_capture_failures,
            )),
        };
        state.worker = Some(worker.clone());
        *self.last_error.lock().unwrap() = None;

        let token = CancellationToken::new();
        state.token = token.clone();
        let pipeline = self.pipeline.clone();
        let bus = self.bus.clone();
        let roi = self.roi.clone();
        let frame_handler = self.frame_handler.clone();
        let last_encoded = self.last_encoded.clone();
        let last_error = self.last_error.clone();
        let period = Duration::from_secs_f64(interval_sec.max(0.001));

        info!(interval_sec, "vision loop starting");
        state.task = Some(tokio::spawn(async move {
            run_loop(
                period,
                token,
                worker,
                pipeline,
                bus,
                roi,
                frame_handler,
                last_encoded,
                last_error,
            )
            .await;
        }));
    }

    /// Cancels the loop, joins it and releases the camera. Idempotent.
    pub async fn stop(&self) {
        let (task, worker, token) = {
            let mut state = self.state.lock().unwrap();
            (
                state.task.take(),
                state.worker.take(),
                state.token.clone(),
            )
        };
        token.cancel();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                error!("vision loop did not stop within 1s, abandoning");
            }
        }
        if let Some(worker) = worker {
            worker.stop().await;
        }
    }

    /// Forwards the allowed processing parameters to the pipeline.
    pub fn set_processing(&self, params: &serde_json::Value) {
        const ALLOWED: [&str; 4] = ["blur", "edges", "contours", "ref_size"];
        let mut filtered = serde_json::Map::new();
        if let Some(obj) = params.as_object() {
            for key in ALLOWED {
                if let Some(v) = obj.get(key) {
                    filtered.insert(key.to_string(), v.clone());
                }
            }
        }
        if !filtered.is_empty() {
            self.pipeline.set_processing(serde_json::Value::Object(filtered));
        }
    }

    pub fn load_profile(&self, which: &str, path: &str) -> anyhow::Result<()> {
        self.pipeline.load_profile(which, path)
    }

    pub fn set_dynamic(&self, which: &str, params: &serde_json::Value) -> anyhow::Result<()> {
        self.pipeline.set_dynamic(which, params)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    period: Duration,
    token: CancellationToken,
    worker: Arc<CameraWorker>,
    pipeline: Arc<dyn Pipeline>,
    bus: Arc<Bus<Detection>>,
    roi: RoiHandle,
    frame_handler: Arc<Mutex<Option<FrameHandler>>>,
    last_encoded: Arc<Mutex<Option<String>>>,
    last_error: Arc<Mutex<Option<String>>>,
) {
    let mut ticker = Ticker::new(period);
    let mut last_detect: Option<Instant> = None;
    let mut metrics = MetricsWindow::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !worker.is_running() {
            let err = worker
                .last_error()
                .unwrap_or_else(|| "camera worker stopped".into());
            error!(%err, "capture failed repeatedly, vision loop exiting");
            *last_error.lock().unwrap() = Some(err);
            break;
        }

        let Some(frame) = worker.get_latest() else {
            continue;
        };
        if clock::now() - frame.captured_at > STALE_FRAME_SEC {
            continue;
        }
        if last_detect.is_some_and(|t| t.elapsed() < DETECT_MIN_SPACING) {
            continue;
        }
        last_detect = Some(Instant::now());

        let opts = ProcessOptions {
            roi: roi.get(),
            return_overlay: true,
        };
        let started = Instant::now();
        if let Err(e) = pipeline.process(&frame, &opts) {
            warn!(error = ?e, "pipeline error, frame skipped");
            continue;
        }
        let detect_time = started.elapsed();

        let mut detection = match pipeline.last_result() {
            Some(d) => d,
            None => continue,
        };
        detection.timestamp = clock::now();
        if detection.ok && !detection.in_bounds() {
            warn!(space = ?detection.frame_space, "detection outside frame space, dropped");
            detection = Detection::miss(detection.frame_space);
        }

        if let Some(handler) = frame_handler.lock().unwrap().as_mut() {
            handler(&detection);
        }
        bus.publish(detection);

        let encode_started = Instant::now();
        let encoded = BASE64.encode(&frame.jpeg);
        *last_encoded.lock().unwrap() = Some(encoded);
        metrics.record(detect_time, encode_started.elapsed(), opts.roi.is_some());
        metrics.maybe_flush();
    }
    info!("vision loop stopped");
}

struct MetricsWindow {
    started: Instant,
    frames: u32,
    roi_frames: u32,
    detect_total: Duration,
    encode_total: Duration,
}

impl MetricsWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            frames: 0,
            roi_frames: 0,
            detect_total: Duration::ZERO,
            encode_total: Duration::ZERO,
        }
    }

    fn record(&mut self, detect: Duration, encode: Duration, roi: bool) {
        self.frames += 1;
        self.roi_frames += u32::from(roi);
        self.detect_total += detect;
        self.encode_total += encode;
    }

    fn maybe_flush(&mut self) {
        let elapsed = self.started.elapsed();
        if elapsed < METRICS_WINDOW || self.frames == 0 {
            return;
        }
        let frames = self.frames as f64;
        debug!(
            fps = frames / elapsed.as_secs_f64(),
            avg_detect_ms = self.detect_total.as_secs_f64() * 1000.0 / frames,
            avg_encode_ms = self.encode_total.as_secs_f64() * 1000.0 / frames,
            roi_coverage = f64::from(self.roi_frames) / frames,
            "vision window"
        );
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::TargetBox;
    use crate::vision::camera::SyntheticCamera;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingPipeline {
        calls: AtomicU32,
        result: Mutex<Detection>,
    }

    impl CountingPipeline {
        fn new(result: Detection) -> Self {
            Self {
                calls: AtomicU32::new(0),
                result: Mutex::new(result),
            }
        }
    }

    impl Pipeline for CountingPipeline {
        fn process(&self, _frame: &crate::vision::camera::Frame, _opts: &ProcessOptions) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn last_result(&self) -> Option<Detection> {
            Some(self.result.lock().unwrap().clone())
        }
    }

    fn vision_with(pipeline: Arc<dyn Pipeline>) -> VisionLoop {
        VisionLoop::new(
            Box::new(|| Box::new(SyntheticCamera)),
            pipeline,
            100.0,
            3,
        )
    }

    #[tokio::test]
    async fn publishes_detections_and_snapshot() {
        let pipeline = Arc::new(CountingPipeline::new(Detection::miss((320.0, 240.0))));
        let vision = vision_with(pipeline.clone());
        let mut rx = vision.bus().subscribe();
        vision.start(0.01, None);
        let det = tokio::time::timeout(Duration::from_secs(2), rx.next())
            .await
            .unwrap()
            .unwrap();
        assert!(!det.ok);
        assert_eq!(det.frame_space, (320.0, 240.0));
        let snap = vision.snapshot_b64(Duration::from_secs(2)).await;
        assert!(snap.is_some());
        vision.stop().await;
        assert!(!vision.is_running());
    }

    #[tokio::test]
    async fn detection_is_throttled() {
        let pipeline = Arc::new(CountingPipeline::new(Detection::miss((320.0, 240.0))));
        let vision = vision_with(pipeline.clone());
        vision.start(0.005, None);
        tokio::time::sleep(Duration::from_millis(500)).await;
        vision.stop().await;
        // 500 ms at a 200 ms floor allows at most ~4 passes.
        assert!(pipeline.calls.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn out_of_bounds_detection_is_demoted() {
        let mut det = Detection::miss((100.0, 100.0));
        det.ok = true;
        det.targets = vec![TargetBox {
            x: 90.0,
            y: 0.0,
            w: 50.0,
            h: 10.0,
            score: 1.0,
        }];
        let pipeline = Arc::new(CountingPipeline::new(det));
        let vision = vision_with(pipeline);
        let mut rx = vision.bus().subscribe();
        vision.start(0.01, None);
        let published = tokio::time::timeout(Duration::from_secs(2), rx.next())
            .await
            .unwrap()
            .unwrap();
        assert!(!published.ok);
        vision.stop().await;
    }

    #[tokio::test]
    async fn stop_twice_is_a_no_op() {
        let pipeline = Arc::new(CountingPipeline::new(Detection::miss((320.0, 240.0))));
        let vision = vision_with(pipeline);
        vision.start(0.01, None);
        vision.stop().await;
        vision.stop().await;
    }
}
