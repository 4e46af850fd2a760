//! Dashboard and operator HTTP surface
//!
//! - `GET  /ws/:line/:kind` - live events (`kind` is `insert` or `select`)
//! - `GET  /lines/:line/status` - cursor, latest reading, gate state
//! - `GET  /lines/:line/trend?limit=N` - recent trend rows with predictions
//! - `GET  /control/status` - gate snapshot
//! - `POST /control/pause` - `{"line": "...", "reason": "..."}`
//! - `POST /control/resume` - optional `{"line": "..."}`
//! - `GET  /health`

use crate::pipeline::broadcast::{Broadcaster, DashboardEvent, StreamKind};
use crate::pipeline::context::{LineContext, LineStatus};
use crate::pipeline::db::{TrendRow, TrendStore};
use crate::pipeline::error::StoreError;
use crate::pipeline::gate::{ControlGate, GateSnapshot, GateState};
use crate::pipeline::types::Line;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

const DEFAULT_TREND_LIMIT: usize = 50;
const MAX_TREND_LIMIT: usize = 500;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unknown line '{0}'")]
    UnknownLine(String),

    #[error("Unknown stream '{0}'")]
    UnknownStream(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::UnknownLine(_) | ApiError::UnknownStream(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            log::error!("❌ API error: {}", self);
        }

        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    contexts: Arc<HashMap<Line, Arc<LineContext>>>,
    gate: Arc<ControlGate>,
    bus: Broadcaster,
    store: Arc<dyn TrendStore>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        contexts: Vec<Arc<LineContext>>,
        gate: Arc<ControlGate>,
        bus: Broadcaster,
        store: Arc<dyn TrendStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            contexts: Arc::new(contexts.into_iter().map(|c| (c.line(), c)).collect()),
            gate,
            bus,
            store,
            shutdown,
        }
    }

    /// Resolve a path segment to an enabled line
    fn context(&self, raw: &str) -> Result<&Arc<LineContext>, ApiError> {
        raw.parse::<Line>()
            .ok()
            .and_then(|line| self.contexts.get(&line))
            .ok_or_else(|| ApiError::UnknownLine(raw.to_string()))
    }

    fn enabled_lines(&self) -> Vec<Line> {
        Line::ALL
            .into_iter()
            .filter(|l| self.contexts.contains_key(l))
            .collect()
    }

    fn publish_gate(&self, lines: &[Line]) {
        for line in lines {
            self.bus.publish(DashboardEvent::Gate {
                line: *line,
                gate: self.gate.state(*line),
            });
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/:line/:kind", get(ws_handler))
        .route("/lines/:line/status", get(line_status))
        .route("/lines/:line/trend", get(line_trend))
        .route("/control/status", get(control_status))
        .route("/control/pause", post(control_pause))
        .route("/control/resume", post(control_resume))
        .with_state(state)
}

/// Serve until the shutdown token fires
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "lines": state.enabled_lines(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((line, kind)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let line = state.context(&line)?.line();
    let kind: StreamKind = kind.parse().map_err(|_| ApiError::UnknownStream(kind.clone()))?;

    // Subscribe before the upgrade so nothing published after the handshake is missed
    let rx = state.bus.subscribe(line, kind);
    let shutdown = state.shutdown.clone();

    Ok(ws.on_upgrade(move |socket| forward_events(socket, rx, line, kind, shutdown)))
}

async fn forward_events(
    socket: WebSocket,
    mut rx: broadcast::Receiver<DashboardEvent>,
    line: Line,
    kind: StreamKind,
    shutdown: CancellationToken,
) {
    log::info!("🔌 Dashboard connected to {}/{}", line, kind);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("⚠️  {}/{} subscriber lagged, {} events dropped", line, kind, skipped);
                        DashboardEvent::Lagged { skipped }
                    }
                    Err(RecvError::Closed) => break,
                };

                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::error!("❌ Failed to encode dashboard event: {}", e);
                        continue;
                    }
                };

                if sender.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Client messages carry no meaning
                Some(Ok(_)) => {}
            },
            _ = shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    log::info!("🔌 Dashboard disconnected from {}/{}", line, kind);
}

#[derive(Serialize)]
struct SubscriberCounts {
    insert: usize,
    select: usize,
}

#[derive(Serialize)]
struct LineStatusResponse {
    #[serde(flatten)]
    status: LineStatus,
    gate: GateState,
    subscribers: SubscriberCounts,
}

async fn line_status(
    Path(line): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<LineStatusResponse>, ApiError> {
    let ctx = state.context(&line)?;
    let line = ctx.line();

    Ok(Json(LineStatusResponse {
        status: ctx.status().await,
        gate: state.gate.state(line),
        subscribers: SubscriberCounts {
            insert: state.bus.subscriber_count(line, StreamKind::Insert),
            select: state.bus.subscriber_count(line, StreamKind::Select),
        },
    }))
}

#[derive(Deserialize)]
struct TrendQuery {
    limit: Option<usize>,
}

async fn line_trend(
    Path(line): Path<String>,
    Query(query): Query<TrendQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<TrendRow>>, ApiError> {
    let line = state.context(&line)?.line();
    let limit = match query.limit {
        Some(0) => return Err(ApiError::BadRequest("limit must be positive".to_string())),
        Some(n) => n.min(MAX_TREND_LIMIT),
        None => DEFAULT_TREND_LIMIT,
    };

    Ok(Json(state.store.recent_trend(line, limit).await?))
}

async fn control_status(State(state): State<AppState>) -> Json<GateSnapshot> {
    Json(state.gate.snapshot())
}

#[derive(Deserialize)]
struct PauseRequest {
    line: Line,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct ResumeRequest {
    #[serde(default)]
    line: Option<Line>,
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

async fn control_pause(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<GateSnapshot>, ApiError> {
    let request: PauseRequest = parse_body(&body)?;
    let reason = request
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "operator pause".to_string());

    if state.gate.pause(request.line, &reason) {
        state.publish_gate(&[request.line]);
    }

    Ok(Json(state.gate.snapshot()))
}

async fn control_resume(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<GateSnapshot>, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ResumeRequest { line: None }
    } else {
        parse_body::<ResumeRequest>(&body)?
    };

    let resumed = state.gate.resume(request.line);
    state.publish_gate(&resumed);

    Ok(Json(state.gate.snapshot()))
}
