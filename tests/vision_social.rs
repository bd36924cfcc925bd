//! Detections flowing from the vision loop into the social FSM.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use humo::detect::{Detection, TargetBox};
use humo::runtime::{Platform, Runtime, Services};
use humo::social::SocialState;
use humo::vision::{Frame, Pipeline, ProcessOptions};
use humo::AppConfig;

/// Pipeline that always reports one centered face.
struct CenteredFacePipeline;

impl Pipeline for CenteredFacePipeline {
    fn process(&self, _frame: &Frame, _opts: &ProcessOptions) -> anyhow::Result<()> {
        Ok(())
    }

    fn last_result(&self) -> Option<Detection> {
        let space = (640.0, 480.0);
        let mut det = Detection::miss(space);
        det.ok = true;
        det.targets = vec![TargetBox {
            x: 290.0,
            y: 210.0,
            w: 60.0,
            h: 60.0,
            score: 0.95,
        }];
        det.bbox = det.targets.first().copied();
        det.center = det.targets.first().map(|t| t.center());
        Some(det)
    }
}

#[tokio::test]
async fn centered_face_reaches_interact_through_the_runtime() {
    let cfg = AppConfig::from_value(json!({
        "enable_ws": false,
        "vision": {"interval_sec": 0.05, "camera_fps": 60.0},
        "behavior": {
            "poll_interval": 0.05,
            "social_fsm": {"lock_frames_needed": 2, "interact_ms": 60000}
        }
    }))
    .unwrap();

    let platform = Platform {
        pipeline: Arc::new(CenteredFacePipeline),
        ..Platform::headless()
    };
    let services = Services::build(cfg, platform).unwrap();
    let fsm = services.fsm.clone().expect("social fsm built");
    let runtime = Runtime::new(services);

    let mut bus_rx = runtime.services().vision.as_ref().unwrap().bus().subscribe();
    runtime.start().await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if fsm.lock().unwrap().state() == SocialState::Interact {
            break;
        }
        assert!(Instant::now() < deadline, "fsm never reached INTERACT");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Bus consumers observe the same stream the FSM consumed.
    let published = tokio::time::timeout(Duration::from_secs(2), bus_rx.next())
        .await
        .unwrap()
        .unwrap();
    assert!(published.ok);
    assert!(published.in_bounds());
    assert!(runtime.latest_detection().is_some());

    runtime.stop().await;
}
