//! HTTP surface: incoming webhooks, system events, inbound messages.
//!
//! Every route except `/health` requires an API key. The `/api/*` routes act
//! only on records owned by the key's owner.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth::{KeyValidator, Owner, api_key_from_headers, require_api_key};
use crate::automation::AutomationEngine;
use crate::error::DatabaseError;
use crate::store::Database;
use crate::types::InboundMessage;
use crate::webhooks::ingest::WebhookIngestor;

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Database>,
    pub engine: Arc<AutomationEngine>,
    pub ingestor: Arc<WebhookIngestor>,
    pub keys: Arc<dyn KeyValidator>,
}

/// Errors from the JSON API routes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] DatabaseError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// POST /webhooks/incoming/{webhook_id}
async fn incoming_webhook(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    // Malformed ids fall through to the normal "not found" path after the key check.
    let webhook_id = Uuid::parse_str(&webhook_id).unwrap_or(Uuid::nil());
    let api_key = api_key_from_headers(&headers);
    state
        .ingestor
        .ingest(webhook_id, api_key.as_deref(), &body)
        .await
}

#[derive(Debug, Deserialize)]
struct EventRequest {
    event_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    connection_id: Option<Uuid>,
}

/// POST /api/events
///
/// Accepted immediately; rules run on a background task.
async fn system_event(
    State(state): State<AppState>,
    Extension(Owner(owner_id)): Extension<Owner>,
    Json(request): Json<EventRequest>,
) -> impl IntoResponse {
    let engine = Arc::clone(&state.engine);
    let event_type = request.event_type.clone();
    tokio::spawn(async move {
        let ran = engine
            .process_raw_event(&owner_id, &request.event_type, request.payload, request.connection_id)
            .await;
        tracing::debug!(event_type = %request.event_type, rules_run = ran, "System event processed");
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "event_type": event_type })),
    )
}

#[derive(Debug, Deserialize)]
struct InboundRequest {
    message: InboundMessage,
    connection_id: Uuid,
    contact_id: Uuid,
}

/// POST /api/messages/inbound
async fn inbound_message(
    State(state): State<AppState>,
    Extension(Owner(owner_id)): Extension<Owner>,
    Json(request): Json<InboundRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Records of other owners are reported as missing.
    let connection = state
        .store
        .get_connection(request.connection_id)
        .await?
        .filter(|c| c.owner_id == owner_id)
        .ok_or_else(|| ApiError::NotFound(format!("connection {}", request.connection_id)))?;
    let contact = state
        .store
        .get_contact(request.contact_id)
        .await?
        .filter(|c| c.owner_id == owner_id)
        .ok_or_else(|| ApiError::NotFound(format!("contact {}", request.contact_id)))?;

    let outcome = state
        .engine
        .process_message(&request.message, &connection, &contact)
        .await;
    Ok(Json(outcome))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/events", post(system_event))
        .route("/api/messages/inbound", post(inbound_message))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.keys),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/incoming/{webhook_id}", post(incoming_webhook))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
