//! Configuration types.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default reason recorded when an agent is switched off for a contact.
pub const DEFAULT_AGENT_DISABLED_REASON: &str = "disabled_by_webhook";

/// Engine configuration, read from `AUTOFLOW_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Address the HTTP server binds to.
    pub listen_addr: SocketAddr,
    /// Optional directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
    /// Messaging gateway settings.
    pub gateway: GatewayConfig,
    /// Webhook relay (outbox) settings.
    pub relay: RelayConfig,
    /// How often the response delivery worker polls for due sends.
    pub delivery_poll_interval: Duration,
    /// Max scheduled responses handled per delivery pass.
    pub delivery_batch_size: usize,
    /// Reason recorded when a webhook disables the agent for a contact.
    pub agent_disabled_reason: String,
}

/// Messaging gateway connection settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub token: SecretString,
    pub timeout: Duration,
}

/// Relay outbox delivery settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Per-request timeout for relay POSTs.
    pub timeout: Duration,
    /// Attempts before an entry is marked failed.
    pub max_attempts: u32,
    /// First retry delay; doubles on every further attempt.
    pub base_backoff: Duration,
    /// Upper bound for the retry delay.
    pub max_backoff: Duration,
    /// How often the outbox worker polls.
    pub poll_interval: Duration,
    /// Max outbox entries handled per pass.
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 5,
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
            batch_size: 50,
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables.
    ///
    /// Only `AUTOFLOW_GATEWAY_URL` is required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("AUTOFLOW_DB_PATH")
            .unwrap_or_else(|_| "./data/autoflow.db".to_string())
            .into();

        let port: u16 = parse_env("AUTOFLOW_PORT", 8080)?;
        let listen_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let log_dir = std::env::var("AUTOFLOW_LOG_DIR").ok().map(PathBuf::from);

        let base_url = std::env::var("AUTOFLOW_GATEWAY_URL")
            .map_err(|_| ConfigError::MissingEnvVar("AUTOFLOW_GATEWAY_URL".into()))?;
        let token = SecretString::from(std::env::var("AUTOFLOW_GATEWAY_TOKEN").unwrap_or_default());
        let gateway_timeout_secs: u64 = parse_env("AUTOFLOW_GATEWAY_TIMEOUT_SECS", 15)?;

        let defaults = RelayConfig::default();
        let relay = RelayConfig {
            timeout: Duration::from_secs(parse_env(
                "AUTOFLOW_RELAY_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
            max_attempts: parse_env("AUTOFLOW_RELAY_MAX_ATTEMPTS", defaults.max_attempts)?,
            poll_interval: Duration::from_millis(parse_env(
                "AUTOFLOW_OUTBOX_POLL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            ..defaults
        };
        if relay.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AUTOFLOW_RELAY_MAX_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }

        let delivery_poll_interval =
            Duration::from_millis(parse_env("AUTOFLOW_DELIVERY_POLL_MS", 500)?);

        let agent_disabled_reason = std::env::var("AUTOFLOW_AGENT_DISABLED_REASON")
            .unwrap_or_else(|_| DEFAULT_AGENT_DISABLED_REASON.to_string());

        Ok(Self {
            db_path,
            listen_addr,
            log_dir,
            gateway: GatewayConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                token,
                timeout: Duration::from_secs(gateway_timeout_secs),
            },
            relay,
            delivery_poll_interval,
            delivery_batch_size: 100,
            agent_disabled_reason,
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
