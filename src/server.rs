// ABOUTME: HTTP surface over the orchestrator: session CRUD, SSE turn streams, stream cancellation.
// ABOUTME: Also serves /health and, when a recorder is installed, Prometheus /metrics.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use futures_util::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use parley_core::metrics;
use parley_core::{
    ActiveStream, Attachment, ChatMessage, ChatSession, ContentStore, NewSession, Orchestrator,
    TurnError, TurnOverrides, TurnRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    keep_alive: Duration,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, keep_alive: Duration) -> Self {
        Self {
            orchestrator,
            keep_alive,
        }
    }
}

/// Body of `POST /api/sessions/{id}/turns`
#[derive(Debug, Default, Deserialize)]
pub struct TurnBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentBody>,
    #[serde(flatten)]
    pub overrides: TurnOverrides,
}

/// Attachment as sent over HTTP, bytes base64-encoded
#[derive(Debug, Deserialize)]
pub struct AttachmentBody {
    pub file_name: String,
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

impl AttachmentBody {
    fn decode(self) -> Result<Attachment, ApiError> {
        let data = BASE64_STANDARD.decode(self.data.as_bytes()).map_err(|e| {
            ApiError::bad_request(format!("attachment '{}' is not valid base64: {}", self.file_name, e))
        })?;
        Ok(Attachment {
            file_name: self.file_name,
            mime_type: self.mime_type,
            data,
        })
    }
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    stream_id: String,
    cancelled: bool,
}

/// JSON error body with the status it maps to
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(error: anyhow::Error) -> Self {
        metrics::record_error("http_internal");
        tracing::error!(error = %format!("{:#}", error), "Request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl From<TurnError> for ApiError {
    fn from(error: TurnError) -> Self {
        let status = match &error {
            TurnError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            TurnError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            TurnError::Engine(_) => StatusCode::BAD_GATEWAY,
            TurnError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if let TurnError::Store(source) = error {
            return ApiError::internal(source);
        }
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let api = Router::new()
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/{session_id}", get(get_session))
        .route("/api/sessions/{session_id}/messages", get(list_messages))
        .route("/api/sessions/{session_id}/turns", post(start_turn))
        .route("/api/streams", get(list_streams))
        .route("/api/streams/{stream_id}/cancel", post(cancel_stream))
        .route("/health", get(health))
        .with_state(state);

    let app = match metrics_handle {
        Some(handle) => api.merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(Arc::new(handle)),
        ),
        None => api,
    };
    app.layer(TraceLayer::new_for_http())
}

/// Bind, serve until Ctrl-C, then cancel live turns and wait for them to wind down
pub async fn serve(
    orchestrator: Arc<Orchestrator>,
    host: &str,
    port: u16,
    keep_alive: Duration,
    metrics_handle: Option<PrometheusHandle>,
) -> Result<()> {
    let app = router(
        AppState::new(Arc::clone(&orchestrator), keep_alive),
        metrics_handle,
    );

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(addr = %addr, engine = orchestrator.engine_name(), "Starting parley server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&orchestrator)))
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(orchestrator: Arc<Orchestrator>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    // Live SSE responses only end once their turns emit a terminal event
    let cancelled = orchestrator.shutdown().await;
    tracing::info!(cancelled, "Shutdown signal received, live turns finished");
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "engine": state.orchestrator.engine_name(),
        "active_streams": state.orchestrator.list_active_streams().len(),
    }))
}

async fn create_session(
    State(state): State<AppState>,
    Json(new): Json<NewSession>,
) -> Result<(StatusCode, Json<ChatSession>), ApiError> {
    let session = state
        .orchestrator
        .store()
        .create_session(new)
        .await
        .map_err(ApiError::internal)?;
    tracing::info!(session_id = %session.id, "Session created");
    Ok((StatusCode::CREATED, Json(session)))
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<ChatSession>>, ApiError> {
    let sessions = state
        .orchestrator
        .store()
        .list_sessions()
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(sessions))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ChatSession>, ApiError> {
    state
        .orchestrator
        .store()
        .get_session(&session_id)
        .await
        .map_err(ApiError::internal)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("session not found: {}", session_id)))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let store = state.orchestrator.store();
    if store
        .get_session(&session_id)
        .await
        .map_err(ApiError::internal)?
        .is_none()
    {
        return Err(ApiError::not_found(format!("session not found: {}", session_id)));
    }
    let messages = store
        .list_messages(&session_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(messages))
}

async fn start_turn(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<TurnBody>,
) -> Result<impl IntoResponse, ApiError> {
    let attachments = body
        .attachments
        .into_iter()
        .map(AttachmentBody::decode)
        .collect::<Result<Vec<_>, _>>()?;

    let request = TurnRequest {
        session_id,
        message: body.message,
        attachments,
        overrides: body.overrides,
    };
    let turn = state.orchestrator.start_turn(request).await?;
    tracing::debug!(stream_id = %turn.stream_id(), "Streaming turn over SSE");

    let events = turn
        .into_stream()
        .map(|event| Event::default().event(event.name()).json_data(&event));
    let keep_alive = KeepAlive::new().interval(state.keep_alive).text("keep-alive");

    Ok(Sse::new(events).keep_alive(keep_alive))
}

async fn list_streams(State(state): State<AppState>) -> Json<Vec<ActiveStream>> {
    Json(state.orchestrator.active_streams())
}

async fn cancel_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    if !state.orchestrator.cancel(&stream_id) {
        return Err(ApiError::not_found(format!(
            "no live stream to cancel: {}",
            stream_id
        )));
    }
    tracing::info!(stream_id = %stream_id, "Cancellation requested over HTTP");
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            stream_id,
            cancelled: true,
        }),
    ))
}

/// Handle GET /metrics - returns Prometheus text format
async fn metrics_handler(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
