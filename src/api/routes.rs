//! Messaging control API

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::ws::websocket_handler;
use crate::messaging::{
    ConnectionPhase, InitOutcome, MessagingError, OutboundMessage, SendResult, SessionSupervisor,
    SupervisorStatus,
};
use crate::middleware::request_logging;
use crate::storage::{SqliteDeliveryStore, StoredDeliveryStatus};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<SessionSupervisor>,
    pub store: Arc<SqliteDeliveryStore>,
}

pub fn router(state: AppState) -> Router {
    let messaging = Router::new()
        .route("/status", get(get_status))
        .route("/initialize", post(initialize))
        .route("/restart", post(restart))
        .route("/destroy", post(destroy))
        .route("/logout", post(logout))
        .route("/circuit/reset", post(reset_circuit))
        .route("/send", post(send_batch))
        .route("/reminders/:date", post(send_reminders))
        .route("/deliveries/:request_id", get(get_delivery));

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .nest("/api/messaging", messaging)
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Handlers =====

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        messaging: state.supervisor.phase(),
    })
}

async fn get_status(State(state): State<AppState>) -> Json<SupervisorStatus> {
    Json(state.supervisor.status())
}

async fn initialize(
    State(state): State<AppState>,
    Query(params): Query<InitializeQuery>,
) -> Result<Json<InitOutcome>, ApiError> {
    let outcome = state.supervisor.initialize(params.force).await?;
    Ok(Json(outcome))
}

async fn restart(State(state): State<AppState>) -> Result<Json<InitOutcome>, ApiError> {
    let outcome = state.supervisor.restart().await?;
    Ok(Json(outcome))
}

async fn destroy(State(state): State<AppState>) -> Json<ActionResponse> {
    state.supervisor.destroy().await;
    Json(ActionResponse::new(&state))
}

async fn logout(State(state): State<AppState>) -> Json<ActionResponse> {
    state.supervisor.logout().await;
    Json(ActionResponse::new(&state))
}

async fn reset_circuit(State(state): State<AppState>) -> Json<ActionResponse> {
    state.supervisor.reset_circuit();
    Json(ActionResponse::new(&state))
}

async fn send_batch(
    State(state): State<AppState>,
    Json(request): Json<SendBatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    if request.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".to_string()));
    }
    let results = state.supervisor.send(request.messages).await?;
    Ok(Json(BatchResponse::from_results(results)))
}

async fn send_reminders(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<BatchResponse>, ApiError> {
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("invalid date '{}', expected YYYY-MM-DD", date)))?;
    let results = state.supervisor.send_reminders_for_date(date).await?;
    Ok(Json(BatchResponse::from_results(results)))
}

async fn get_delivery(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<StoredDeliveryStatus>, ApiError> {
    state
        .store
        .delivery_status(&request_id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no delivery recorded for {}", request_id)))
}

// ===== Request/Response Types =====

#[derive(Debug, Default, Deserialize)]
struct InitializeQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct SendBatchRequest {
    messages: Vec<OutboundMessage>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    messaging: ConnectionPhase,
}

#[derive(Serialize)]
struct ActionResponse {
    ok: bool,
    phase: ConnectionPhase,
}

impl ActionResponse {
    fn new(state: &AppState) -> Self {
        Self {
            ok: true,
            phase: state.supervisor.phase(),
        }
    }
}

#[derive(Debug, Serialize)]
struct BatchItemResponse {
    request_id: String,
    address: String,
    sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    total: usize,
    sent: usize,
    failed: usize,
    results: Vec<BatchItemResponse>,
}

impl BatchResponse {
    fn from_results(results: Vec<SendResult>) -> Self {
        let total = results.len();
        let results: Vec<BatchItemResponse> = results
            .into_iter()
            .map(|r| {
                let (message_id, error, kind) = match r.outcome {
                    Ok(id) => (Some(id), None, None),
                    Err(e) => (None, Some(e.to_string()), Some(e.kind())),
                };
                BatchItemResponse {
                    request_id: r.request_id,
                    address: r.address,
                    sent: message_id.is_some(),
                    message_id,
                    error,
                    kind,
                }
            })
            .collect();
        let sent = results.iter().filter(|r| r.sent).count();

        Self {
            total,
            sent,
            failed: total - sent,
            results,
        }
    }
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Messaging(MessagingError),
    Storage(anyhow::Error),
    NotFound(String),
    BadRequest(String),
}

impl From<MessagingError> for ApiError {
    fn from(err: MessagingError) -> Self {
        ApiError::Messaging(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Storage(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message, retry_after) = match &self {
            ApiError::Messaging(err) => {
                let status = match err {
                    MessagingError::CircuitOpen { .. } | MessagingError::CircuitBusy => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    MessagingError::LockTimeout { .. }
                    | MessagingError::LockCancelled
                    | MessagingError::NotReady { .. } => StatusCode::CONFLICT,
                    MessagingError::InitTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    MessagingError::AuthFailure(_) => StatusCode::UNAUTHORIZED,
                    MessagingError::SessionLost(_) | MessagingError::Transport(_) => {
                        StatusCode::BAD_GATEWAY
                    }
                    MessagingError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                // Whole seconds, rounded up
                let retry_after = err
                    .retry_after()
                    .map(|d| d.as_millis().div_ceil(1000).max(1) as u64);
                (status, err.kind(), err.to_string(), retry_after)
            }
            ApiError::Storage(err) => {
                tracing::error!(error = %err, "storage_error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage",
                    "Internal server error".to_string(),
                    None,
                )
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
        };

        let body = Json(json!({
            "error": message,
            "kind": kind,
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
