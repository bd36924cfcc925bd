//! Cold-start and shutdown behavior of the full runtime.

use std::time::{Duration, Instant};

use serde_json::json;

use humo::runtime::{Platform, Runtime, Services};
use humo::AppConfig;

fn cold_start_config() -> AppConfig {
    AppConfig::from_value(json!({
        "enable_conversation": false,
        "enable_vision": true,
        "enable_movement": true,
        "enable_ws": false,
        "vision": {"interval_sec": 0.05, "camera_fps": 30.0}
    }))
    .unwrap()
}

#[tokio::test]
async fn cold_start_without_conversation() {
    let services = Services::build(cold_start_config(), Platform::headless()).unwrap();
    assert!(services.conversation.is_none());
    assert!(services.conversation_disabled_reason.is_none());

    let runtime = Runtime::new(services);
    runtime.start().await.unwrap();

    // The vision loop publishes miss detections from the stub pipeline.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(det) = runtime.latest_detection() {
            assert!(!det.ok);
            break;
        }
        assert!(Instant::now() < deadline, "no detection observed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stop_started = Instant::now();
    runtime.stop().await;
    assert!(stop_started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let services = Services::build(cold_start_config(), Platform::headless()).unwrap();
    let runtime = Runtime::new(services);
    runtime.start().await.unwrap();

    runtime.stop().await;
    let second = Instant::now();
    runtime.stop().await;
    runtime.stop().await;
    assert!(second.elapsed() < Duration::from_millis(200));
}

#[tokio::test]
async fn start_is_idempotent() {
    let services = Services::build(cold_start_config(), Platform::headless()).unwrap();
    let runtime = Runtime::new(services);
    runtime.start().await.unwrap();
    runtime.start().await.unwrap();
    runtime.stop().await;
}
