//! Durable response schedule and the worker that delivers it.
//!
//! The executor writes one row per response step and returns. Only the first
//! step is armed (`pending` with a due time); each later step stays `waiting`
//! until the worker finishes its predecessor, then gets `due = finished + delay`.
//! Steps of one execution are therefore strictly sequential and spaced by at
//! least their delay, and survive restarts.
//!
//! Every tick first repairs schedules a failed store write left behind: rows
//! held in `sending` past the claim lease go back to `pending`, and waiting
//! steps whose predecessor finished get armed. Delivery is at-least-once.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::automation::rule::{Response, ResponseKind};
use crate::error::{DatabaseError, GatewayError};
use crate::gateway::MessagingGateway;
use crate::store::Database;

/// Lifecycle of a scheduled response step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Not armed yet; waits for the previous step.
    Waiting,
    /// Armed with a due time.
    Pending,
    /// Claimed by a worker.
    Sending,
    Sent,
    Failed,
    /// Non-text step; recognised but not delivered.
    Skipped,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Waiting => "waiting",
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(DeliveryStatus::Waiting),
            "pending" => Ok(DeliveryStatus::Pending),
            "sending" => Ok(DeliveryStatus::Sending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            "skipped" => Ok(DeliveryStatus::Skipped),
            other => Err(format!("invalid delivery status: {other}")),
        }
    }
}

/// One step of an execution's response schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledResponse {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub rule_id: Uuid,
    pub contact_id: Uuid,
    pub phone: String,
    /// Gateway instance of the connection the execution ran for.
    pub instance: Option<String>,
    /// Position within the execution (0-based, unique per execution).
    pub step: u32,
    pub order_index: i32,
    pub kind: ResponseKind,
    pub content: String,
    pub delay_seconds: u32,
    /// Unix millis at which the step may be sent; `None` while waiting.
    pub due_at_ms: Option<i64>,
    pub status: DeliveryStatus,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Where a planned schedule is sent.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub contact_id: Uuid,
    pub phone: String,
    pub instance: Option<String>,
}

/// Build the rows for one execution. `responses` must already be in send order.
pub fn plan(
    execution_id: Uuid,
    rule_id: Uuid,
    recipient: &Recipient,
    responses: &[&Response],
    now: DateTime<Utc>,
) -> Vec<ScheduledResponse> {
    let now_ms = ceil_millis(now);
    responses
        .iter()
        .enumerate()
        .map(|(step, response)| {
            let armed = step == 0;
            ScheduledResponse {
                id: Uuid::new_v4(),
                execution_id,
                rule_id,
                contact_id: recipient.contact_id,
                phone: recipient.phone.clone(),
                instance: recipient.instance.clone(),
                step: step as u32,
                order_index: response.order_index,
                kind: response.kind,
                content: response.content.clone(),
                delay_seconds: response.delay_seconds,
                due_at_ms: armed.then(|| due_after(now_ms, response.delay_seconds)),
                status: if armed {
                    DeliveryStatus::Pending
                } else {
                    DeliveryStatus::Waiting
                },
                last_error: None,
                finished_at: None,
                created_at: now,
            }
        })
        .collect()
}

/// `from_ms + delay_seconds`, in unix millis.
pub fn due_after(from_ms: i64, delay_seconds: u32) -> i64 {
    from_ms + i64::from(delay_seconds) * 1000
}

/// Unix millis of `at`, rounded up so a due time derived from it never
/// precedes the real instant plus the delay.
pub fn ceil_millis(at: DateTime<Utc>) -> i64 {
    let ms = at.timestamp_millis();
    if at.timestamp_subsec_nanos() % 1_000_000 == 0 {
        ms
    } else {
        ms + 1
    }
}

// ── Worker ──────────────────────────────────────────────────────────

/// How long a claimed row may stay in `sending` before it is re-armed.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(60);

/// Attempts at recording a finished step before leaving it to the lease.
const FINISH_ATTEMPTS: u32 = 3;
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Sends due scheduled responses through the messaging gateway.
pub struct DeliveryWorker {
    store: Arc<dyn Database>,
    gateway: Arc<dyn MessagingGateway>,
    batch_size: usize,
    lease: Duration,
}

impl DeliveryWorker {
    pub fn new(store: Arc<dyn Database>, gateway: Arc<dyn MessagingGateway>, batch_size: usize) -> Self {
        Self {
            store,
            gateway,
            batch_size: batch_size.max(1),
            lease: DEFAULT_CLAIM_LEASE,
        }
    }

    /// Set the claim lease. Should comfortably exceed one gateway call.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Re-arm rows whose claim outlived the lease and waiting steps whose
    /// predecessor finished without arming them. Returns how many rows moved.
    pub async fn recover(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let lease_ms = i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX);
        let mut recovered = 0;

        match self
            .store
            .reset_stuck_scheduled_responses(now_ms.saturating_sub(lease_ms))
            .await
        {
            Ok(0) => {}
            Ok(n) => {
                tracing::warn!("Re-armed {} responses held past their claim lease", n);
                recovered += n;
            }
            Err(e) => tracing::error!("Failed to re-arm expired claims: {}", e),
        }

        match self.store.arm_stalled_scheduled_responses(ceil_millis(Utc::now())).await {
            Ok(0) => {}
            Ok(n) => {
                tracing::warn!("Armed {} stalled response steps", n);
                recovered += n;
            }
            Err(e) => tracing::error!("Failed to arm stalled response steps: {}", e),
        }
        recovered
    }

    /// Deliver every step that is due now. Returns the number of messages sent.
    pub async fn deliver_due(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let due = match self.store.due_scheduled_responses(now_ms, self.batch_size).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("Failed to load due responses: {}", e);
                return 0;
            }
        };

        let mut sent = 0;
        for row in due {
            match self
                .store
                .claim_scheduled_response(row.id, Utc::now().timestamp_millis())
                .await
            {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(response_id = %row.id, "Failed to claim response: {}", e);
                    continue;
                }
            }
            if self.deliver(&row).await {
                sent += 1;
            }
        }
        sent
    }

    async fn deliver(&self, row: &ScheduledResponse) -> bool {
        let (status, error) = if row.kind != ResponseKind::Text {
            let skipped = GatewayError::Unsupported(row.kind.to_string());
            tracing::warn!(
                execution_id = %row.execution_id,
                step = row.step,
                "Skipping response: {}",
                skipped
            );
            (DeliveryStatus::Skipped, Some(skipped.to_string()))
        } else {
            match self
                .gateway
                .send_text(row.instance.as_deref(), &row.phone, &row.content)
                .await
            {
                Ok(()) => {
                    tracing::debug!(
                        execution_id = %row.execution_id,
                        step = row.step,
                        gateway = self.gateway.name(),
                        "Response sent"
                    );
                    (DeliveryStatus::Sent, None)
                }
                Err(e) => {
                    tracing::warn!(
                        execution_id = %row.execution_id,
                        step = row.step,
                        contact_id = %row.contact_id,
                        "Response send failed: {}",
                        e
                    );
                    (DeliveryStatus::Failed, Some(e.to_string()))
                }
            }
        };

        let finished = Utc::now();
        let mut attempt = 1;
        loop {
            match self.finish_and_arm_next(row, status, error.as_deref(), finished).await {
                Ok(()) => break,
                Err(e) if attempt < FINISH_ATTEMPTS => {
                    tracing::warn!(
                        execution_id = %row.execution_id,
                        step = row.step,
                        attempt,
                        "Failed to advance response schedule, retrying: {}",
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(FINISH_RETRY_DELAY).await;
                }
                Err(e) => {
                    // Left to `recover`.
                    tracing::error!(
                        execution_id = %row.execution_id,
                        step = row.step,
                        "Failed to advance response schedule: {}",
                        e
                    );
                    break;
                }
            }
        }
        status == DeliveryStatus::Sent
    }

    async fn finish_and_arm_next(
        &self,
        row: &ScheduledResponse,
        status: DeliveryStatus,
        error: Option<&str>,
        finished: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.store
            .finish_scheduled_response(row.id, status, error, finished)
            .await?;
        let next = self
            .store
            .arm_next_scheduled_response(row.execution_id, row.step, ceil_millis(finished))
            .await?;
        if next.is_none() {
            tracing::debug!(execution_id = %row.execution_id, "Response schedule complete");
        }
        Ok(())
    }
}

/// Spawn the delivery loop. Rows a previous process left mid-send are re-armed
/// first; each tick then repairs stalled schedules before delivering.
pub fn spawn_delivery_worker(
    worker: Arc<DeliveryWorker>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match worker.store.reset_stuck_scheduled_responses(i64::MAX).await {
            Ok(0) => {}
            Ok(n) => tracing::warn!("Re-armed {} responses interrupted mid-send", n),
            Err(e) => tracing::error!("Failed to re-arm interrupted responses: {}", e),
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            worker.recover().await;
            worker.deliver_due().await;
        }
    })
}
