//! Error types for Autoflow.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Wrap a libsql error. Unique and primary-key violations (both reported
    /// by SQLite as "UNIQUE constraint failed") map to `Constraint`; other
    /// constraint failures are plain query errors.
    pub(crate) fn from_libsql(context: &str, err: libsql::Error) -> Self {
        let message = err.to_string();
        if message.contains("UNIQUE constraint failed") {
            DatabaseError::Constraint(format!("{context}: {message}"))
        } else {
            DatabaseError::Query(format!("{context}: {message}"))
        }
    }
}

/// Outbound delivery errors (messaging gateway, relay endpoints).
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Failed to send message via {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("Endpoint {url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("Unsupported response type: {0}")]
    Unsupported(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Errors raised while decoding stored rule configuration.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("unknown rule kind: {0}")]
    UnknownKind(String),

    #[error("unknown trigger type: {0}")]
    UnknownTrigger(String),

    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    #[error("{trigger} trigger missing '{field}'")]
    MissingField { trigger: String, field: String },

    #[error("invalid {what}: {reason}")]
    Invalid { what: String, reason: String },
}
