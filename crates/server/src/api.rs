use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use devstream_ingest::PipelineState;

use crate::auth::{bearer_token, AuthError, Identity};
use crate::metrics::{self, ADMISSIONS_REJECTED};
use crate::notifier::snapshot_frame;
use crate::query::{QueryError, DEFAULT_LIMIT};
use crate::registry::{SessionId, SESSION_BUFFER};
use crate::AppState;

/// Upper bound on any page size a caller can request
pub const MAX_LIMIT: usize = 1000;

/// Build the axum router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/device-data", get(latest_device_data))
        .route("/device-data/filter", post(filtered_device_data))
        .route("/ws/device-data", get(ws_handler))
        .route("/api/v1/verify-token", get(verify_token))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(serde_json::json!({"detail": "Could not validate credentials"})),
    )
        .into_response()
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, Response> {
    let token = bearer_token(headers).ok_or_else(unauthorized)?;
    state.authorizer.authorize(token).await.map_err(|e| {
        debug!(error = %e, "Rejected bearer token");
        unauthorized()
    })
}

fn query_failed(e: QueryError) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({
            "error": "Could not retrieve device data from database, retry shortly",
            "detail": e.to_string(),
        })),
    )
        .into_response()
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
}

/// GET /device-data
#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub limit: Option<usize>,
}

async fn latest_device_data(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LatestQuery>,
) -> Response {
    if let Err(rejection) = authenticate(&state, &headers).await {
        return rejection;
    }

    match state.queries.latest(clamp_limit(query.limit)).await {
        Ok(documents) => (StatusCode::OK, Json(documents)).into_response(),
        Err(e) => query_failed(e),
    }
}

/// POST /device-data/filter
#[derive(Debug, Deserialize)]
pub struct FilterRequest {
    pub device_ids: Vec<String>,
    pub limit: Option<usize>,
}

async fn filtered_device_data(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<FilterRequest>,
) -> Response {
    if let Err(rejection) = authenticate(&state, &headers).await {
        return rejection;
    }

    match state
        .queries
        .latest_filtered(&req.device_ids, clamp_limit(req.limit))
        .await
    {
        Ok(documents) => (StatusCode::OK, Json(documents)).into_response(),
        Err(e) => query_failed(e),
    }
}

/// GET /api/v1/verify-token
async fn verify_token(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    match authenticate(&state, &headers).await {
        Ok(_) => (StatusCode::OK, Json(serde_json::json!({"status": "valid"}))).into_response(),
        Err(rejection) => rejection,
    }
}

/// GET /ws/device-data?token=...
#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
) -> Response {
    // Authorization happens after the upgrade so a refusal can be reported
    // with a policy-violation close frame.
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.token))
}

async fn reject(mut socket: WebSocket, reason: &'static str) {
    ADMISSIONS_REJECTED.with_label_values(&[reason]).inc();
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Cow::Borrowed("Could not validate credentials"),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send policy-violation close frame");
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let identity = match token.as_deref() {
        None | Some("") => {
            warn!("WebSocket connect missing token");
            return reject(socket, "missing_token").await;
        }
        Some(token) => match state.authorizer.authorize(token).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "WebSocket auth failed");
                let reason = match e {
                    AuthError::MissingToken => "missing_token",
                    _ => "invalid_token",
                };
                return reject(socket, reason).await;
            }
        },
    };

    let (session_id, mut rx) = admit(&state, &identity).await;
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let recv_session = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        // Inbound traffic is keep-alive only
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Close(_) => break,
                Message::Text(text) => debug!(session = %recv_session, len = text.len(), "Keep-alive"),
                _ => {}
            }
        }
    });

    // Whichever side ends first (client gone, or the registry dropped our
    // channel) tears down the other.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.registry.unregister(&session_id).await;
    info!(session = %session_id, "WebSocket session closed");
}

/// Queue the admission snapshot, then register the session, so every live
/// update lands behind the snapshot in the buffer.
async fn admit(state: &AppState, identity: &Identity) -> (SessionId, mpsc::Receiver<String>) {
    let session_id = SessionId::generate(&identity.subject);

    // Bounded so a slow client cannot grow memory without limit; a client
    // that falls this far behind is pruned by the registry.
    let (tx, rx) = mpsc::channel::<String>(SESSION_BUFFER);

    match state.queries.latest(DEFAULT_LIMIT).await {
        Ok(documents) => {
            if let Err(e) = tx.try_send(snapshot_frame(documents)) {
                warn!(session = %session_id, error = %e, "Failed to queue admission snapshot");
            }
        }
        Err(e) => warn!(session = %session_id, error = %e, "Skipping admission snapshot"),
    }

    state
        .registry
        .register(session_id.clone(), Box::new(tx))
        .await;
    info!(session = %session_id, subject = %identity.subject, "WebSocket session admitted");
    (session_id, rx)
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Response {
    let pipeline = *state.pipeline_status.borrow();
    let sessions = state.registry.len().await;
    let crashed = pipeline == PipelineState::Crashed;

    let status_code = if crashed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status_code,
        Json(serde_json::json!({
            "status": if crashed { "unhealthy" } else { "ok" },
            "pipeline": pipeline.as_str(),
            "sessions": sessions,
        })),
    )
        .into_response()
}

/// GET /metrics
async fn metrics_handler() -> Response {
    match metrics::encode() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}
