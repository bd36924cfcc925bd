//! JSON command surface for remote clients.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::movement::Movement;
use crate::vision::VisionLoop;

/// Subsystems reachable from the command surface.
pub struct WsState {
    pub vision: Option<Arc<VisionLoop>>,
    pub movement: Option<Arc<dyn Movement>>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct WsResponse {
    status: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    data: String,
}

impl WsResponse {
    fn ok(data: impl Into<String>) -> Self {
        Self {
            status: "ok",
            kind: "text",
            data: data.into(),
        }
    }

    fn image(data: String) -> Self {
        Self {
            status: "ok",
            kind: "image",
            data,
        }
    }

    fn wait(data: impl Into<String>) -> Self {
        Self {
            status: "wait",
            kind: "text",
            data: data.into(),
        }
    }

    fn error(data: impl Into<String>) -> Self {
        Self {
            status: "error",
            kind: "text",
            data: data.into(),
        }
    }
}

pub fn router(state: Arc<WsState>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

/// Binds the listener and serves until the token fires.
pub async fn serve(
    state: Arc<WsState>,
    host: &str,
    port: u16,
    token: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding ws listener on {addr}"))?;
    info!(%addr, "ws listening");
    let app = router(state);
    Ok(tokio::spawn(async move {
        let shutdown = async move { token.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = ?e, "ws server failed");
        }
        info!("ws server stopped");
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WsState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<WsState>) {
    info!("ws client connected");
    while let Some(Ok(message)) = socket.recv().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let response = dispatch(&state, &text).await;
        let payload = match serde_json::to_string(&response) {
            Ok(p) => p,
            Err(e) => {
                error!(error = ?e, "ws response serialization failed");
                continue;
            }
        };
        if socket.send(Message::Text(payload)).await.is_err() {
            break;
        }
    }
    info!("ws client disconnected");
}

async fn dispatch(state: &WsState, text: &str) -> WsResponse {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return WsResponse::error(format!("invalid json: {e}")),
    };
    let cmd = value.get("cmd").and_then(|v| v.as_str()).unwrap_or_default();

    match cmd {
        "ping" => WsResponse::ok("pong"),
        "start" => {
            let Some(vision) = &state.vision else {
                return WsResponse::error("vision disabled");
            };
            let interval = value
                .get("interval")
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0);
            vision.start(interval, None);
            WsResponse::ok(format!("capture started (interval={interval}s)"))
        }
        "stop" => {
            let Some(vision) = &state.vision else {
                return WsResponse::error("vision disabled");
            };
            vision.stop().await;
            WsResponse::ok("capture stopped")
        }
        "capture" => {
            let Some(vision) = &state.vision else {
                return WsResponse::error("vision disabled");
            };
            let timeout = value
                .get("timeout")
                .and_then(|v| v.as_f64())
                .unwrap_or(2.0)
                .max(0.0);
            match vision.snapshot_b64(Duration::from_secs_f64(timeout)).await {
                Some(img) => WsResponse::image(img),
                None => WsResponse::wait("no frame yet"),
            }
        }
        "process" => {
            let Some(vision) = &state.vision else {
                return WsResponse::error("vision disabled");
            };
            vision.set_processing(&value);
            WsResponse::ok("processing updated")
        }
        "walk" => {
            let Some(movement) = &state.movement else {
                return WsResponse::error("movement disabled");
            };
            let axis = |key| value.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0) as f32;
            movement.walk(axis("vx"), axis("vy"), axis("omega"));
            WsResponse::ok("walking")
        }
        "movement_stop" => {
            let Some(movement) = &state.movement else {
                return WsResponse::error("movement disabled");
            };
            movement.stop_motion();
            WsResponse::ok("movement stopped")
        }
        "load_profile" => {
            let Some(vision) = &state.vision else {
                return WsResponse::error("vision disabled");
            };
            let which = value.get("which").and_then(|v| v.as_str()).unwrap_or_default();
            let path = value.get("path").and_then(|v| v.as_str()).unwrap_or_default();
            match vision.load_profile(which, path) {
                Ok(()) => WsResponse::ok(format!("profile {which} loaded")),
                Err(e) => WsResponse::error(e.to_string()),
            }
        }
        "dynamic" => {
            let Some(vision) = &state.vision else {
                return WsResponse::error("vision disabled");
            };
            let which = value.get("which").and_then(|v| v.as_str()).unwrap_or_default();
            let params = value.get("params").cloned().unwrap_or(serde_json::Value::Null);
            match vision.set_dynamic(which, &params) {
                Ok(()) => WsResponse::ok(format!("dynamic {which} updated")),
                Err(e) => WsResponse::error(e.to_string()),
            }
        }
        other => WsResponse::error(format!("unknown command: {other}")),
    }
}
