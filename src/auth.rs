//! API key validation for the webhook endpoint and the `/api/*` routes.
//!
//! Keys are accepted from `x-api-key` first, then `Authorization: Bearer <key>`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::DatabaseError;
use crate::store::Database;

/// Resolves an API key to the owner it belongs to.
#[async_trait]
pub trait KeyValidator: Send + Sync {
    /// `Ok(None)` means the key is unknown or revoked.
    async fn validate(&self, key: &str) -> Result<Option<String>, DatabaseError>;
}

/// Key validator backed by the `api_keys` table.
pub struct DbKeyValidator {
    store: Arc<dyn Database>,
}

impl DbKeyValidator {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl KeyValidator for DbKeyValidator {
    async fn validate(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        self.store.owner_for_api_key(key).await
    }
}

/// Pull the caller's API key out of the request headers.
pub fn api_key_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        return Some(key.to_string());
    }

    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
}

/// Owner resolved from the caller's API key, set by [`require_api_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

/// Route middleware that rejects requests without a valid key (fail-closed)
/// and hands the key's owner to handlers as an [`Owner`] extension.
pub async fn require_api_key(
    State(keys): State<Arc<dyn KeyValidator>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(key) = api_key_from_headers(request.headers()) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    match keys.validate(&key).await {
        Ok(Some(owner_id)) => {
            request.extensions_mut().insert(Owner(owner_id));
            Ok(next.run(request).await)
        }
        Ok(None) => {
            tracing::debug!("Rejected request with unknown API key");
            Err(StatusCode::UNAUTHORIZED)
        }
        Err(e) => {
            tracing::error!("API key lookup failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
