//! Webhook relay: the envelope a rule posts to its relay URL, the durable
//! outbox it is queued in, and the worker that delivers it.
//!
//! Delivery uses a bounded HTTP timeout and bounded retry with exponential
//! backoff plus jitter. Failures are logged and recorded on the outbox row;
//! they never reach the code that queued the call.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::automation::executor::SourceEvent;
use crate::automation::rule::Rule;
use crate::config::RelayConfig;
use crate::error::GatewayError;
use crate::store::Database;
use crate::types::{Connection, Contact, Deal, Origin, Tag};

/// Event name carried by every relay envelope.
pub const RELAY_EVENT: &str = "automation_triggered";

// ── Envelope ────────────────────────────────────────────────────────

/// Everything the relay envelope describes.
pub struct RelayContext<'a> {
    pub rule: &'a Rule,
    pub contact: &'a Contact,
    pub connection: Option<&'a Connection>,
    pub source: &'a SourceEvent,
    pub funnel: Option<&'a Deal>,
    pub tags: &'a [Tag],
    pub origin: Option<&'a Origin>,
    pub timestamp: DateTime<Utc>,
}

/// Assemble the JSON envelope posted to a rule's relay URL.
pub fn build_relay_payload(ctx: &RelayContext<'_>) -> Value {
    let custom_fields = ctx
        .rule
        .relay
        .as_ref()
        .map(|r| Value::Object(r.custom_fields.clone()))
        .unwrap_or_else(|| json!({}));

    let message = match ctx.source {
        SourceEvent::Message(message) => json!({
            "id": message.id,
            "content": message.content,
            "interpreted_text": message.interpreted_text,
            "type": message.message_type,
            "direction": message.direction,
            "received_at": message.received_at.to_rfc3339(),
        }),
        SourceEvent::Trigger(event_type) => json!({
            "id": null,
            "content": null,
            "type": "event",
            "event_type": event_type.as_str(),
        }),
    };

    json!({
        "event": RELAY_EVENT,
        "timestamp": ctx.timestamp.to_rfc3339(),
        "automation": {
            "id": ctx.rule.id,
            "name": ctx.rule.name,
        },
        "contact": {
            "id": ctx.contact.id,
            "name": ctx.contact.name,
            "phone": ctx.contact.phone,
            "email": ctx.contact.email,
            "metadata": ctx.contact.metadata,
            "origin_id": ctx.contact.origin_id,
            "profile_picture": ctx.contact.profile_picture,
            "created_at": ctx.contact.created_at.to_rfc3339(),
        },
        "funnel": ctx.funnel.map(|deal| json!({
            "deal_id": deal.id,
            "funnel": deal.funnel_name,
            "stage": deal.stage,
            "updated_at": deal.updated_at.to_rfc3339(),
        })),
        "tags": ctx.tags.iter().map(|t| json!({
            "id": t.id,
            "name": t.name,
            "color": t.color,
        })).collect::<Vec<_>>(),
        "origin": ctx.origin.map(|o| json!({ "id": o.id, "name": o.name })),
        "tags_to_add": ctx.rule.tags_to_add,
        "message": message,
        "connection": ctx.connection.map(|c| json!({
            "id": c.id,
            "name": c.name,
            "instance": c.instance,
        })),
        "custom_fields": custom_fields,
    })
}

// ── Outbox ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "delivered" => Ok(OutboxStatus::Delivered),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(format!("invalid outbox status: {other}")),
        }
    }
}

/// A queued relay POST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayOutboxEntry {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub url: String,
    pub payload: Value,
    pub attempts: u32,
    /// Unix millis of the next delivery attempt.
    pub next_attempt_ms: i64,
    pub status: OutboxStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl RelayOutboxEntry {
    /// A new entry, due immediately.
    pub fn new(rule_id: Uuid, url: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            rule_id,
            url: url.into(),
            payload,
            attempts: 0,
            next_attempt_ms: now.timestamp_millis(),
            status: OutboxStatus::Pending,
            last_error: None,
            created_at: now,
            delivered_at: None,
        }
    }
}

/// Retry delay before attempt `attempt + 1`: `base * 2^(attempt-1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Add up to 20% random jitter.
fn with_jitter(delay: Duration) -> Duration {
    let spread = (delay.as_millis() / 5) as u64;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

// ── Worker ──────────────────────────────────────────────────────────

/// Delivers due outbox entries.
pub struct RelayWorker {
    store: Arc<dyn Database>,
    client: reqwest::Client,
    config: RelayConfig,
}

impl RelayWorker {
    pub fn new(store: Arc<dyn Database>, config: RelayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        Ok(Self {
            store,
            client,
            config,
        })
    }

    /// Attempt every entry that is due. Returns the number delivered.
    pub async fn deliver_due(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let due = match self.store.due_relays(now_ms, self.config.batch_size).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!("Failed to load due relay entries: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        for entry in due {
            if self.attempt(&entry).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn attempt(&self, entry: &RelayOutboxEntry) -> bool {
        let attempts = entry.attempts + 1;
        let outcome = self.post(entry).await;

        let recorded = match &outcome {
            Ok(()) => {
                tracing::info!(relay_id = %entry.id, rule_id = %entry.rule_id, attempts, "Relay delivered");
                self.store.mark_relay_delivered(entry.id, attempts, Utc::now()).await
            }
            Err(e) if attempts >= self.config.max_attempts => {
                tracing::error!(
                    relay_id = %entry.id,
                    url = %entry.url,
                    attempts,
                    "Relay failed permanently: {}",
                    e
                );
                self.store.mark_relay_failed(entry.id, attempts, &e.to_string()).await
            }
            Err(e) => {
                let delay = with_jitter(backoff_delay(
                    self.config.base_backoff,
                    self.config.max_backoff,
                    attempts,
                ));
                tracing::warn!(
                    relay_id = %entry.id,
                    url = %entry.url,
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    "Relay attempt failed: {}",
                    e
                );
                let next = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                self.store
                    .reschedule_relay(entry.id, attempts, next, &e.to_string())
                    .await
            }
        };

        if let Err(e) = recorded {
            tracing::error!(relay_id = %entry.id, "Failed to record relay outcome: {}", e);
        }
        outcome.is_ok()
    }

    async fn post(&self, entry: &RelayOutboxEntry) -> Result<(), GatewayError> {
        let resp = self
            .client
            .post(&entry.url)
            .json(&entry.payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout {
                        url: entry.url.clone(),
                        timeout: self.config.timeout,
                    }
                } else {
                    GatewayError::Http(e.to_string())
                }
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::Status {
                url: entry.url.clone(),
                status: resp.status().as_u16(),
            })
        }
    }
}

pub fn spawn_relay_worker(worker: Arc<RelayWorker>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            worker.deliver_due().await;
        }
    })
}
