//! Supervision of the llama-server child process, driven by fake binaries.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use humo::audio::{LoggingTextToSpeech, NullSpeechToText};
use humo::conversation::{ConversationFsm, ConversationTuning};
use humo::conversation_service::{ConversationService, ConversationServiceConfig};
use humo::led::{LedService, LoggingLedStrip};
use humo::llama::{LlamaServer, LlamaServerConfig, LlamaServerError};
use humo::llm::{ChatMessage, LlmClient};

fn write_fake_binary(dir: &Path, name: &str, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn server_for(dir: &Path, script: &str) -> LlamaServer {
    let binary = write_fake_binary(dir, "llama-server", script);
    let model = dir.join("model.gguf");
    std::fs::write(&model, "stub-weights").unwrap();
    LlamaServer::new(LlamaServerConfig::new(binary, model)).unwrap()
}

const SILENT_SERVER: &str = "#!/bin/sh\n\
i=0\n\
while [ $i -lt 200 ]; do sleep 0.1; i=$((i+1)); done\n";

const POLITE_SERVER: &str = "#!/bin/sh\n\
trap 'exit 0' INT TERM\n\
echo 'server is listening'\n\
i=0\n\
while [ $i -lt 200 ]; do sleep 0.1; i=$((i+1)); done\n";

#[tokio::test]
async fn wait_ready_sees_the_marker() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_for(dir.path(), POLITE_SERVER);
    server.start().await.unwrap();
    let ready = server.wait_ready(Duration::from_secs(5)).await.unwrap();
    assert!(ready);
    assert!(server.is_running().await);
    server.stop(Duration::from_secs(1), Duration::from_secs(1)).await;
}

#[tokio::test]
async fn wait_ready_times_out_on_a_silent_server() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_for(dir.path(), SILENT_SERVER);
    server.start().await.unwrap();
    let ready = server.wait_ready(Duration::from_millis(200)).await.unwrap();
    assert!(!ready);
    server.stop(Duration::from_millis(500), Duration::from_millis(500)).await;
}

#[tokio::test]
async fn graceful_stop_captures_the_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_for(dir.path(), POLITE_SERVER);
    server.start().await.unwrap();
    assert!(server.wait_ready(Duration::from_secs(5)).await.unwrap());

    let started = Instant::now();
    server.stop(Duration::from_secs(1), Duration::from_secs(1)).await;
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert!(server.poll().await.is_some());
    assert!(!server.is_running().await);

    // Ready state is cleared: a readiness wait now reports the dead child.
    match server.wait_ready(Duration::from_millis(100)).await {
        Err(LlamaServerError::ProcessExited(_)) => {}
        other => panic!("expected ProcessExited, got {other:?}"),
    }

    let second = Instant::now();
    server.stop(Duration::from_secs(1), Duration::from_secs(1)).await;
    assert!(second.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn stubborn_server_is_escalated() {
    // Ignores INT and TERM; only SIGKILL can end it.
    let script = "#!/bin/sh\n\
trap '' INT TERM\n\
echo 'listening on 0.0.0.0'\n\
i=0\n\
while [ $i -lt 200 ]; do sleep 0.1; i=$((i+1)); done\n";
    let dir = tempfile::tempdir().unwrap();
    let server = server_for(dir.path(), script);
    server.start().await.unwrap();
    assert!(server.wait_ready(Duration::from_secs(5)).await.unwrap());
    server
        .stop(Duration::from_millis(200), Duration::from_millis(200))
        .await;
    assert!(server.poll().await.is_some());
}

#[tokio::test]
async fn health_poll_honors_the_mock_endpoint() {
    let mock = httpmock::MockServer::start_async().await;
    mock.mock_async(|when, then| {
        when.method(httpmock::Method::GET).path("/health");
        then.status(200);
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let server = server_for(dir.path(), POLITE_SERVER);
    server.start().await.unwrap();
    let healthy = server
        .poll_health(
            &mock.base_url(),
            "/health",
            Duration::from_secs(2),
            Duration::from_millis(100),
            3,
            2.0,
        )
        .await;
    assert!(healthy);
    server.stop(Duration::from_secs(1), Duration::from_secs(1)).await;
}

struct UnusedLlm;

#[async_trait::async_trait]
impl LlmClient for UnusedLlm {
    async fn query(&self, _m: &[ChatMessage], _c: usize) -> anyhow::Result<String> {
        unreachable!("llm must not be queried when readiness fails")
    }
}

#[tokio::test]
async fn readiness_timeout_aborts_service_start() {
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(server_for(dir.path(), SILENT_SERVER));
    let led = Arc::new(LedService::spawn(Arc::new(LoggingLedStrip)));

    let factory_called = Arc::new(AtomicBool::new(false));
    let called = factory_called.clone();
    let led_for_factory = led.clone();
    let factory = Box::new(move |stop: CancellationToken| {
        called.store(true, Ordering::SeqCst);
        ConversationFsm::new(
            Box::new(NullSpeechToText),
            Arc::new(LoggingTextToSpeech),
            Arc::new(UnusedLlm),
            led_for_factory.clone(),
            vec!["humo".into()],
            String::new(),
            ConversationTuning::default(),
            stop,
            Vec::new(),
        )
    });

    let service = ConversationService::new(
        server.clone(),
        led,
        factory,
        ConversationServiceConfig {
            base_url: "http://127.0.0.1:1".into(),
            readiness_timeout: Duration::from_millis(200),
            health_timeout: Duration::from_millis(200),
            health_interval: Duration::from_millis(50),
            health_max_retries: 1,
            health_backoff: 2.0,
            shutdown_timeout: Duration::from_secs(1),
            auto_restart: false,
            restart_delay: Duration::from_millis(100),
        },
    );

    assert!(service.start().await.is_err());
    assert!(!factory_called.load(Ordering::SeqCst), "no FSM may be built");
    assert!(service.join(Duration::from_millis(100)).await);
    assert!(server.poll().await.is_some(), "child must be terminated");
    service.stop(true, true).await;
}
