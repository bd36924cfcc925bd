//! Camera seam and the background worker that owns the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::clock;

/// One captured frame: encoded JPEG bytes plus its capture timestamp in
/// monotonic seconds.
#[derive(Debug, Clone)]
pub struct Frame {
    pub jpeg: Vec<u8>,
    pub captured_at: f64,
}

/// Capture device. The worker is the only component allowed to hold one.
pub trait Camera: Send {
    fn open(&mut self) -> anyhow::Result<()>;
    fn capture(&mut self) -> anyhow::Result<Frame>;
    fn close(&mut self);
}

struct Shared {
    latest: Mutex<Option<Frame>>,
    running: AtomicBool,
    stop: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Background task capturing frames at up to `max_fps` and keeping only the
/// newest one. After `max_failures` consecutive capture errors it records
/// the error and exits on its own.
pub struct CameraWorker {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CameraWorker {
    pub fn start(mut camera: Box<dyn Camera>, max_fps: f64, max_failures: u32) -> Self {
        let shared = Arc::new(Shared {
            latest: Mutex::new(None),
            running: AtomicBool::new(true),
            stop: AtomicBool::new(false),
            last_error: Mutex::new(None),
        });
        let worker_shared = shared.clone();
        let interval = if max_fps > 0.0 {
            Duration::from_secs_f64(1.0 / max_fps)
        } else {
            Duration::ZERO
        };
        let handle = tokio::task::spawn_blocking(move || {
            if let Err(e) = camera.open() {
                error!(error = ?e, "camera open failed");
                *worker_shared.last_error.lock().unwrap() = Some(e.to_string());
                worker_shared.running.store(false, Ordering::SeqCst);
                return;
            }
            let mut failures = 0u32;
            while !worker_shared.stop.load(Ordering::SeqCst) {
                let started = std::time::Instant::now();
                match camera.capture() {
                    Ok(frame) => {
                        failures = 0;
                        *worker_shared.latest.lock().unwrap() = Some(frame);
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(error = ?e, failures, "capture failed");
                        if failures >= max_failures {
                            *worker_shared.last_error.lock().unwrap() = Some(e.to_string());
                            break;
                        }
                    }
                }
                let elapsed = started.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                }
            }
            camera.close();
            worker_shared.running.store(false, Ordering::SeqCst);
            debug!("camera worker exited");
        });
        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Newest frame, if any has been captured yet.
    pub fn get_latest(&self) -> Option<Frame> {
        self.shared.latest.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().unwrap().clone()
    }

    /// Stops the worker and releases the device. Idempotent.
    pub async fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                warn!("camera worker did not stop in time");
            }
        }
    }
}

/// Camera producing a tiny synthetic JPEG; used when no device is attached.
pub struct SyntheticCamera;

// Smallest well-formed JPEG skeleton: SOI + EOI.
const BLANK_JPEG: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xD9];

impl Camera for SyntheticCamera {
    fn open(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn capture(&mut self) -> anyhow::Result<Frame> {
        Ok(Frame {
            jpeg: BLANK_JPEG.to_vec(),
            captured_at: clock::now(),
        })
    }

    fn close(&mut self) {}
}
