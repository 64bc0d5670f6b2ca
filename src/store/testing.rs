//! Store wrapper that fails selected writes a set number of times.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::automation::delivery::{DeliveryStatus, ScheduledResponse};
use crate::automation::relay::RelayOutboxEntry;
use crate::automation::rule::Rule;
use crate::automation::trigger::TriggerType;
use crate::error::DatabaseError;
use crate::store::Database;
use crate::types::{AgentSetting, Connection, Contact, Deal, Origin, Sequence, Tag};
use crate::webhooks::model::WebhookConfig;

/// Delegates to `inner`; `finish_scheduled_response` and
/// `arm_next_scheduled_response` fail while their budgets last.
pub struct FlakyStore {
    inner: Arc<dyn Database>,
    pub finish_failures: AtomicU32,
    pub arm_failures: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn Database>) -> Self {
        Self {
            inner,
            finish_failures: AtomicU32::new(0),
            arm_failures: AtomicU32::new(0),
        }
    }

    pub fn failing_finish(self, times: u32) -> Self {
        self.finish_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn failing_arm(self, times: u32) -> Self {
        self.arm_failures.store(times, Ordering::SeqCst);
        self
    }

    fn take(budget: &AtomicU32, context: &str) -> Result<(), DatabaseError> {
        let failed = budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(DatabaseError::Query(format!("{context}: database is locked")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Database for FlakyStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn create_connection(&self, connection: &Connection) -> Result<(), DatabaseError> {
        self.inner.create_connection(connection).await
    }

    async fn get_connection(&self, id: Uuid) -> Result<Option<Connection>, DatabaseError> {
        self.inner.get_connection(id).await
    }

    async fn create_contact(&self, contact: &Contact) -> Result<(Contact, bool), DatabaseError> {
        self.inner.create_contact(contact).await
    }

    async fn get_contact(&self, id: Uuid) -> Result<Option<Contact>, DatabaseError> {
        self.inner.get_contact(id).await
    }

    async fn find_contact_by_phone(
        &self,
        owner_id: &str,
        phone: &str,
    ) -> Result<Option<Contact>, DatabaseError> {
        self.inner.find_contact_by_phone(owner_id, phone).await
    }

    async fn update_contact(&self, contact: &Contact) -> Result<(), DatabaseError> {
        self.inner.update_contact(contact).await
    }

    async fn set_contact_origin(&self, contact_id: Uuid, origin_id: Uuid) -> Result<(), DatabaseError> {
        self.inner.set_contact_origin(contact_id, origin_id).await
    }

    async fn ensure_tag(&self, owner_id: &str, name: &str, color: &str) -> Result<Tag, DatabaseError> {
        self.inner.ensure_tag(owner_id, name, color).await
    }

    async fn assign_tag(&self, contact_id: Uuid, tag_id: Uuid) -> Result<bool, DatabaseError> {
        self.inner.assign_tag(contact_id, tag_id).await
    }

    async fn list_contact_tags(&self, contact_id: Uuid) -> Result<Vec<Tag>, DatabaseError> {
        self.inner.list_contact_tags(contact_id).await
    }

    async fn create_origin(&self, origin: &Origin) -> Result<(), DatabaseError> {
        self.inner.create_origin(origin).await
    }

    async fn get_origin(&self, id: Uuid) -> Result<Option<Origin>, DatabaseError> {
        self.inner.get_origin(id).await
    }

    async fn upsert_deal(&self, deal: &Deal) -> Result<(), DatabaseError> {
        self.inner.upsert_deal(deal).await
    }

    async fn latest_deal(&self, contact_id: Uuid) -> Result<Option<Deal>, DatabaseError> {
        self.inner.latest_deal(contact_id).await
    }

    async fn create_rule(&self, rule: &Rule) -> Result<(), DatabaseError> {
        self.inner.create_rule(rule).await
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>, DatabaseError> {
        self.inner.get_rule(id).await
    }

    async fn list_keyword_rules(&self, owner_id: &str) -> Result<Vec<Rule>, DatabaseError> {
        self.inner.list_keyword_rules(owner_id).await
    }

    async fn list_trigger_rules(
        &self,
        owner_id: &str,
        trigger_type: TriggerType,
    ) -> Result<Vec<Rule>, DatabaseError> {
        self.inner.list_trigger_rules(owner_id, trigger_type).await
    }

    async fn increment_rule_execution(&self, id: Uuid) -> Result<u64, DatabaseError> {
        self.inner.increment_rule_execution(id).await
    }

    async fn create_webhook(&self, webhook: &WebhookConfig) -> Result<(), DatabaseError> {
        self.inner.create_webhook(webhook).await
    }

    async fn get_webhook(&self, id: Uuid, owner_id: &str) -> Result<Option<WebhookConfig>, DatabaseError> {
        self.inner.get_webhook(id, owner_id).await
    }

    async fn record_webhook_receipt(
        &self,
        id: Uuid,
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.inner.record_webhook_receipt(id, payload, received_at).await
    }

    async fn upsert_agent_setting(&self, setting: &AgentSetting) -> Result<(), DatabaseError> {
        self.inner.upsert_agent_setting(setting).await
    }

    async fn get_agent_setting(&self, contact_id: Uuid) -> Result<Option<AgentSetting>, DatabaseError> {
        self.inner.get_agent_setting(contact_id).await
    }

    async fn create_sequence(&self, sequence: &Sequence) -> Result<(), DatabaseError> {
        self.inner.create_sequence(sequence).await
    }

    async fn get_sequence(&self, id: Uuid) -> Result<Option<Sequence>, DatabaseError> {
        self.inner.get_sequence(id).await
    }

    async fn enroll_in_sequence(&self, sequence_id: Uuid, contact_id: Uuid) -> Result<bool, DatabaseError> {
        self.inner.enroll_in_sequence(sequence_id, contact_id).await
    }

    async fn count_sequence_enrollments(&self, sequence_id: Uuid) -> Result<u64, DatabaseError> {
        self.inner.count_sequence_enrollments(sequence_id).await
    }

    async fn create_api_key(&self, key: &str, owner_id: &str) -> Result<(), DatabaseError> {
        self.inner.create_api_key(key, owner_id).await
    }

    async fn owner_for_api_key(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        self.inner.owner_for_api_key(key).await
    }

    async fn insert_scheduled_responses(&self, rows: &[ScheduledResponse]) -> Result<(), DatabaseError> {
        self.inner.insert_scheduled_responses(rows).await
    }

    async fn due_scheduled_responses(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<ScheduledResponse>, DatabaseError> {
        self.inner.due_scheduled_responses(now_ms, limit).await
    }

    async fn claim_scheduled_response(&self, id: Uuid, now_ms: i64) -> Result<bool, DatabaseError> {
        self.inner.claim_scheduled_response(id, now_ms).await
    }

    async fn finish_scheduled_response(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        Self::take(&self.finish_failures, "finish_scheduled_response")?;
        self.inner.finish_scheduled_response(id, status, error, at).await
    }

    async fn arm_next_scheduled_response(
        &self,
        execution_id: Uuid,
        after_step: u32,
        now_ms: i64,
    ) -> Result<Option<Uuid>, DatabaseError> {
        Self::take(&self.arm_failures, "arm_next_scheduled_response")?;
        self.inner
            .arm_next_scheduled_response(execution_id, after_step, now_ms)
            .await
    }

    async fn list_scheduled_responses(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ScheduledResponse>, DatabaseError> {
        self.inner.list_scheduled_responses(execution_id).await
    }

    async fn reset_stuck_scheduled_responses(&self, claimed_before_ms: i64) -> Result<usize, DatabaseError> {
        self.inner.reset_stuck_scheduled_responses(claimed_before_ms).await
    }

    async fn arm_stalled_scheduled_responses(&self, now_ms: i64) -> Result<usize, DatabaseError> {
        self.inner.arm_stalled_scheduled_responses(now_ms).await
    }

    async fn enqueue_relay(&self, entry: &RelayOutboxEntry) -> Result<(), DatabaseError> {
        self.inner.enqueue_relay(entry).await
    }

    async fn due_relays(&self, now_ms: i64, limit: usize) -> Result<Vec<RelayOutboxEntry>, DatabaseError> {
        self.inner.due_relays(now_ms, limit).await
    }

    async fn get_relay(&self, id: Uuid) -> Result<Option<RelayOutboxEntry>, DatabaseError> {
        self.inner.get_relay(id).await
    }

    async fn mark_relay_delivered(&self, id: Uuid, attempts: u32, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.inner.mark_relay_delivered(id, attempts, at).await
    }

    async fn reschedule_relay(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_ms: i64,
        error: &str,
    ) -> Result<(), DatabaseError> {
        self.inner.reschedule_relay(id, attempts, next_attempt_ms, error).await
    }

    async fn mark_relay_failed(&self, id: Uuid, attempts: u32, error: &str) -> Result<(), DatabaseError> {
        self.inner.mark_relay_failed(id, attempts, error).await
    }
}
