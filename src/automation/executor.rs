//! Action executor: runs a matched rule for one contact.
//!
//! Responses are written to the durable schedule (see [`crate::automation::delivery`]),
//! then the rule's actions run: relay enqueue, tag assignment, origin update.
//! Finally the execution counter is bumped. Nothing here returns `Err`; every
//! failed step is logged and recorded on the [`ExecutionResult`].

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::automation::delivery::{self, Recipient};
use crate::automation::relay::{RelayContext, RelayOutboxEntry, build_relay_payload};
use crate::automation::rule::{RelayTarget, Rule};
use crate::automation::trigger::TriggerType;
use crate::error::DatabaseError;
use crate::store::Database;
use crate::types::{Connection, Contact, DEFAULT_TAG_COLOR, InboundMessage};

/// What caused an execution.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Message(InboundMessage),
    Trigger(TriggerType),
}

/// Outcome of one rule execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub rule_id: Uuid,
    pub responses_scheduled: usize,
    pub relay_queued: bool,
    /// Tag names newly assigned by this execution.
    pub tags_added: Vec<String>,
    pub origin_set: bool,
    /// Counter value after this execution; `None` if the increment failed.
    pub execution_count: Option<u64>,
    pub errors: Vec<String>,
}

impl ExecutionResult {
    fn new(execution_id: Uuid, rule_id: Uuid) -> Self {
        Self {
            execution_id,
            rule_id,
            responses_scheduled: 0,
            relay_queued: false,
            tags_added: Vec::new(),
            origin_set: false,
            execution_count: None,
            errors: Vec::new(),
        }
    }

    fn record(&mut self, step: &str, err: impl fmt::Display) {
        tracing::warn!(
            rule_id = %self.rule_id,
            execution_id = %self.execution_id,
            step,
            "Automation step failed: {}",
            err
        );
        self.errors.push(format!("{step}: {err}"));
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct ActionExecutor {
    store: Arc<dyn Database>,
}

impl ActionExecutor {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    pub async fn execute(
        &self,
        rule: &Rule,
        connection: Option<&Connection>,
        contact: &Contact,
        source: &SourceEvent,
    ) -> ExecutionResult {
        let mut result = ExecutionResult::new(Uuid::new_v4(), rule.id);
        tracing::info!(
            rule = %rule.name,
            contact_id = %contact.id,
            execution_id = %result.execution_id,
            "Executing automation"
        );

        // Responses
        let responses = rule.ordered_responses();
        if !responses.is_empty() {
            let recipient = Recipient {
                contact_id: contact.id,
                phone: contact.phone.clone(),
                instance: connection.map(|c| c.instance.clone()),
            };
            let rows = delivery::plan(result.execution_id, rule.id, &recipient, &responses, Utc::now());
            match self.store.insert_scheduled_responses(&rows).await {
                Ok(()) => result.responses_scheduled = rows.len(),
                Err(e) => result.record("responses", e),
            }
        }

        // Relay
        if let Some(target) = &rule.relay {
            match self.queue_relay(rule, target, connection, contact, source).await {
                Ok(()) => result.relay_queued = true,
                Err(e) => result.record("relay", e),
            }
        }

        // Tags
        for name in rule.tags_to_add.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
            match self.add_tag(&contact.owner_id, contact.id, name).await {
                Ok(true) => result.tags_added.push(name.to_string()),
                Ok(false) => {}
                Err(e) => result.record("add_tag", e),
            }
        }

        // Origin
        if let Some(origin_id) = rule.origin_id {
            match self.store.set_contact_origin(contact.id, origin_id).await {
                Ok(()) => result.origin_set = true,
                Err(e) => result.record("set_origin", e),
            }
        }

        match self.store.increment_rule_execution(rule.id).await {
            Ok(count) => result.execution_count = Some(count),
            Err(e) => result.record("execution_count", e),
        }

        result
    }

    async fn add_tag(&self, owner_id: &str, contact_id: Uuid, name: &str) -> Result<bool, DatabaseError> {
        let tag = self.store.ensure_tag(owner_id, name, DEFAULT_TAG_COLOR).await?;
        self.store.assign_tag(contact_id, tag.id).await
    }

    async fn queue_relay(
        &self,
        rule: &Rule,
        target: &RelayTarget,
        connection: Option<&Connection>,
        contact: &Contact,
        source: &SourceEvent,
    ) -> Result<(), DatabaseError> {
        // Snapshot lookups degrade to empty values; the relay still goes out.
        let funnel = self.store.latest_deal(contact.id).await.unwrap_or_else(|e| {
            tracing::warn!(contact_id = %contact.id, "Relay funnel lookup failed: {}", e);
            None
        });
        let tags = self.store.list_contact_tags(contact.id).await.unwrap_or_else(|e| {
            tracing::warn!(contact_id = %contact.id, "Relay tag lookup failed: {}", e);
            Vec::new()
        });
        let origin = match contact.origin_id {
            Some(id) => self.store.get_origin(id).await.unwrap_or_else(|e| {
                tracing::warn!(origin_id = %id, "Relay origin lookup failed: {}", e);
                None
            }),
            None => None,
        };

        let payload = build_relay_payload(&RelayContext {
            rule,
            contact,
            connection,
            source,
            funnel: funnel.as_ref(),
            tags: &tags,
            origin: origin.as_ref(),
            timestamp: Utc::now(),
        });

        let entry = RelayOutboxEntry::new(rule.id, target.url.clone(), payload);
        self.store.enqueue_relay(&entry).await?;
        tracing::debug!(rule = %rule.name, relay_id = %entry.id, url = %target.url, "Relay queued");
        Ok(())
    }
}
