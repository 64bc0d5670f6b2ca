//! Unified `Database` trait: single async interface for all persistence.
//!
//! Every "create if absent" operation is an atomic upsert against a unique
//! index; callers never check-then-insert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::automation::delivery::{DeliveryStatus, ScheduledResponse};
use crate::automation::relay::RelayOutboxEntry;
use crate::automation::rule::Rule;
use crate::automation::trigger::TriggerType;
use crate::error::DatabaseError;
use crate::types::{AgentSetting, Connection, Contact, Deal, Origin, Sequence, Tag};
use crate::webhooks::model::WebhookConfig;

/// Backend-agnostic database trait covering contacts, rules, webhooks and job tables.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Connections ─────────────────────────────────────────────────

    async fn create_connection(&self, connection: &Connection) -> Result<(), DatabaseError>;

    async fn get_connection(&self, id: Uuid) -> Result<Option<Connection>, DatabaseError>;

    // ── Contacts ────────────────────────────────────────────────────

    /// Insert a contact unless one with the same (owner, phone) exists.
    /// Returns the stored row and whether this call created it.
    async fn create_contact(&self, contact: &Contact) -> Result<(Contact, bool), DatabaseError>;

    async fn get_contact(&self, id: Uuid) -> Result<Option<Contact>, DatabaseError>;

    async fn find_contact_by_phone(
        &self,
        owner_id: &str,
        phone: &str,
    ) -> Result<Option<Contact>, DatabaseError>;

    /// Overwrite name, email, metadata, origin and picture.
    async fn update_contact(&self, contact: &Contact) -> Result<(), DatabaseError>;

    async fn set_contact_origin(&self, contact_id: Uuid, origin_id: Uuid) -> Result<(), DatabaseError>;

    // ── Tags ────────────────────────────────────────────────────────

    /// Find-or-create the tag `name` for `owner_id`.
    async fn ensure_tag(&self, owner_id: &str, name: &str, color: &str) -> Result<Tag, DatabaseError>;

    /// Assign a tag to a contact. Returns `false` when it was already assigned.
    async fn assign_tag(&self, contact_id: Uuid, tag_id: Uuid) -> Result<bool, DatabaseError>;

    async fn list_contact_tags(&self, contact_id: Uuid) -> Result<Vec<Tag>, DatabaseError>;

    // ── Origins & deals ─────────────────────────────────────────────

    async fn create_origin(&self, origin: &Origin) -> Result<(), DatabaseError>;

    async fn get_origin(&self, id: Uuid) -> Result<Option<Origin>, DatabaseError>;

    async fn upsert_deal(&self, deal: &Deal) -> Result<(), DatabaseError>;

    /// Most recently updated deal of a contact.
    async fn latest_deal(&self, contact_id: Uuid) -> Result<Option<Deal>, DatabaseError>;

    // ── Rules ───────────────────────────────────────────────────────

    async fn create_rule(&self, rule: &Rule) -> Result<(), DatabaseError>;

    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>, DatabaseError>;

    /// Active keyword rules of an owner, ordered by name.
    async fn list_keyword_rules(&self, owner_id: &str) -> Result<Vec<Rule>, DatabaseError>;

    /// Active trigger rules of an owner for one trigger type, ordered by name.
    async fn list_trigger_rules(
        &self,
        owner_id: &str,
        trigger_type: TriggerType,
    ) -> Result<Vec<Rule>, DatabaseError>;

    /// Atomically bump the execution counter. Returns the new value.
    async fn increment_rule_execution(&self, id: Uuid) -> Result<u64, DatabaseError>;

    // ── Webhooks ────────────────────────────────────────────────────

    async fn create_webhook(&self, webhook: &WebhookConfig) -> Result<(), DatabaseError>;

    /// Load a webhook scoped to its owner.
    async fn get_webhook(&self, id: Uuid, owner_id: &str) -> Result<Option<WebhookConfig>, DatabaseError>;

    /// Bump the receipt counter and snapshot the payload.
    async fn record_webhook_receipt(
        &self,
        id: Uuid,
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Agent settings ──────────────────────────────────────────────

    async fn upsert_agent_setting(&self, setting: &AgentSetting) -> Result<(), DatabaseError>;

    async fn get_agent_setting(&self, contact_id: Uuid) -> Result<Option<AgentSetting>, DatabaseError>;

    // ── Sequences ───────────────────────────────────────────────────

    async fn create_sequence(&self, sequence: &Sequence) -> Result<(), DatabaseError>;

    async fn get_sequence(&self, id: Uuid) -> Result<Option<Sequence>, DatabaseError>;

    /// Enroll a contact. Returns `false` when already enrolled.
    async fn enroll_in_sequence(&self, sequence_id: Uuid, contact_id: Uuid) -> Result<bool, DatabaseError>;

    async fn count_sequence_enrollments(&self, sequence_id: Uuid) -> Result<u64, DatabaseError>;

    // ── API keys ────────────────────────────────────────────────────

    async fn create_api_key(&self, key: &str, owner_id: &str) -> Result<(), DatabaseError>;

    /// Owner of an active key, if any.
    async fn owner_for_api_key(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    // ── Scheduled responses ─────────────────────────────────────────

    async fn insert_scheduled_responses(&self, rows: &[ScheduledResponse]) -> Result<(), DatabaseError>;

    /// Pending rows whose due time is at or before `now_ms`, oldest first.
    async fn due_scheduled_responses(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<ScheduledResponse>, DatabaseError>;

    /// Move a row from pending to sending, stamping the claim time.
    /// Returns `false` if another worker got it.
    async fn claim_scheduled_response(&self, id: Uuid, now_ms: i64) -> Result<bool, DatabaseError>;

    async fn finish_scheduled_response(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Arm the next waiting step of an execution with `due = now_ms + delay`.
    /// Returns the armed row id, or `None` when the execution is complete.
    async fn arm_next_scheduled_response(
        &self,
        execution_id: Uuid,
        after_step: u32,
        now_ms: i64,
    ) -> Result<Option<Uuid>, DatabaseError>;

    async fn list_scheduled_responses(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ScheduledResponse>, DatabaseError>;

    /// Return rows claimed at or before `claimed_before_ms` and still in
    /// `sending` to `pending`.
    async fn reset_stuck_scheduled_responses(&self, claimed_before_ms: i64) -> Result<usize, DatabaseError>;

    /// Arm waiting steps whose predecessor already finished, with
    /// `due = now_ms + delay`. Returns how many were armed.
    async fn arm_stalled_scheduled_responses(&self, now_ms: i64) -> Result<usize, DatabaseError>;

    // ── Relay outbox ────────────────────────────────────────────────

    async fn enqueue_relay(&self, entry: &RelayOutboxEntry) -> Result<(), DatabaseError>;

    async fn due_relays(&self, now_ms: i64, limit: usize) -> Result<Vec<RelayOutboxEntry>, DatabaseError>;

    async fn get_relay(&self, id: Uuid) -> Result<Option<RelayOutboxEntry>, DatabaseError>;

    async fn mark_relay_delivered(&self, id: Uuid, attempts: u32, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    async fn reschedule_relay(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_ms: i64,
        error: &str,
    ) -> Result<(), DatabaseError>;

    async fn mark_relay_failed(&self, id: Uuid, attempts: u32, error: &str) -> Result<(), DatabaseError>;
}
