//! Automation engine.
//!
//! Two entry points feed the same [`ActionExecutor`]:
//! - **keyword path** (`process_message`): an inbound chat message is matched
//!   against the owner's active keyword rules; the first match (by name) runs.
//! - **trigger path** (`process_event`): a system event is matched against the
//!   owner's active trigger rules of that type; every match runs.
//!
//! Neither path returns errors; failures are logged and summarised in the outcome.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::automation::executor::{ActionExecutor, SourceEvent};
use crate::automation::rule::{Rule, RuleKind};
use crate::automation::trigger::{self, TriggerEvent};
use crate::automation::keyword;
use crate::store::Database;
use crate::types::{Connection, Contact, InboundMessage, MessageDirection};

/// Why `process_message` did not run a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    OutboundMessage,
    NoContent,
    DbError,
    NoAutomations,
    NoMatch,
    Error,
}

/// Result of the keyword path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutcome {
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automation_name: Option<String>,
}

impl ProcessOutcome {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            processed: false,
            reason: Some(reason),
            automation_id: None,
            automation_name: None,
        }
    }

    fn ran(rule: &Rule, reason: Option<SkipReason>) -> Self {
        Self {
            processed: reason.is_none(),
            reason,
            automation_id: Some(rule.id),
            automation_name: Some(rule.name.clone()),
        }
    }
}

pub struct AutomationEngine {
    store: Arc<dyn Database>,
    executor: ActionExecutor,
}

impl AutomationEngine {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self {
            executor: ActionExecutor::new(Arc::clone(&store)),
            store,
        }
    }

    // ── Keyword path ────────────────────────────────────────────────

    /// Match an inbound message against the connection owner's keyword rules.
    pub async fn process_message(
        &self,
        message: &InboundMessage,
        connection: &Connection,
        contact: &Contact,
    ) -> ProcessOutcome {
        if message.direction == MessageDirection::Outbound {
            return ProcessOutcome::skipped(SkipReason::OutboundMessage);
        }
        let Some(text) = message.match_text() else {
            return ProcessOutcome::skipped(SkipReason::NoContent);
        };

        let rules = match self.store.list_keyword_rules(&connection.owner_id).await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!(owner_id = %connection.owner_id, "Failed to load keyword rules: {}", e);
                return ProcessOutcome::skipped(SkipReason::DbError);
            }
        };
        if rules.is_empty() {
            return ProcessOutcome::skipped(SkipReason::NoAutomations);
        }

        let Some(rule) = rules.iter().find(|rule| keyword::matches(text, rule)) else {
            tracing::debug!(connection_id = %connection.id, "No keyword rule matched");
            return ProcessOutcome::skipped(SkipReason::NoMatch);
        };

        let source = SourceEvent::Message(message.clone());
        let result = self
            .executor
            .execute(rule, Some(connection), contact, &source)
            .await;

        if !result.is_clean() && result.execution_count.is_none() {
            tracing::error!(
                rule = %rule.name,
                errors = ?result.errors,
                "Keyword automation did not complete"
            );
            return ProcessOutcome::ran(rule, Some(SkipReason::Error));
        }
        ProcessOutcome::ran(rule, None)
    }

    // ── Trigger path ────────────────────────────────────────────────

    /// Run every active trigger rule matching `event`. Returns how many ran.
    ///
    /// Rules are scoped to the stored contact's owner. Events for contacts
    /// that are not in the store are dropped.
    pub async fn process_event(&self, event: TriggerEvent, connection_id: Option<Uuid>) -> usize {
        self.dispatch(event, connection_id, None).await
    }

    /// Like [`process_event`](Self::process_event), for a caller authenticated
    /// as `owner_id`. Events about another owner's contact are dropped.
    pub async fn process_event_for(
        &self,
        owner_id: &str,
        event: TriggerEvent,
        connection_id: Option<Uuid>,
    ) -> usize {
        self.dispatch(event, connection_id, Some(owner_id)).await
    }

    async fn dispatch(
        &self,
        event: TriggerEvent,
        connection_id: Option<Uuid>,
        caller: Option<&str>,
    ) -> usize {
        let contact_id = event.contact().id;
        let contact = match self.store.get_contact(contact_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                tracing::warn!(contact_id = %contact_id, "Event references unknown contact; dropped");
                return 0;
            }
            Err(e) => {
                tracing::error!(contact_id = %contact_id, "Failed to load contact: {}", e);
                return 0;
            }
        };
        if let Some(caller) = caller.filter(|caller| *caller != contact.owner_id) {
            tracing::warn!(contact_id = %contact_id, caller, "Event for another owner's contact; dropped");
            return 0;
        }

        let connection = match connection_id {
            Some(id) => match self.store.get_connection(id).await {
                Ok(found) => {
                    if found.is_none() {
                        tracing::warn!(connection_id = %id, "Event references unknown connection");
                    }
                    found
                }
                Err(e) => {
                    tracing::warn!(connection_id = %id, "Failed to load connection: {}", e);
                    None
                }
            },
            None => None,
        };
        if let Some(connection) = connection
            .as_ref()
            .filter(|connection| connection.owner_id != contact.owner_id)
        {
            tracing::warn!(
                connection_id = %connection.id,
                contact_id = %contact_id,
                "Connection and contact belong to different owners; dropped"
            );
            return 0;
        }

        let owner_id = contact.owner_id.clone();
        let trigger_type = event.trigger_type();

        let rules = match self.store.list_trigger_rules(&owner_id, trigger_type).await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!(owner_id = %owner_id, trigger = %trigger_type, "Failed to load trigger rules: {}", e);
                return 0;
            }
        };

        let matching: Vec<&Rule> = rules
            .iter()
            .filter(|rule| match &rule.kind {
                RuleKind::Trigger { condition } => trigger::matches(condition, &event),
                RuleKind::Keyword { .. } => false,
            })
            .collect();
        if matching.is_empty() {
            tracing::debug!(trigger = %trigger_type, owner_id = %owner_id, "No trigger rule matched");
            return 0;
        }

        let source = SourceEvent::Trigger(trigger_type);
        let results = join_all(
            matching
                .iter()
                .map(|rule| self.executor.execute(rule, connection.as_ref(), &contact, &source)),
        )
        .await;

        for (rule, result) in matching.iter().zip(&results) {
            if result.is_clean() {
                tracing::info!(rule = %rule.name, trigger = %trigger_type, "Trigger automation executed");
            } else {
                tracing::warn!(rule = %rule.name, errors = ?result.errors, "Trigger automation finished with errors");
            }
        }
        results.len()
    }

    /// Parse the loose `(event_type, payload)` form and dispatch it for `owner_id`.
    pub async fn process_raw_event(
        &self,
        owner_id: &str,
        event_type: &str,
        payload: Value,
        connection_id: Option<Uuid>,
    ) -> usize {
        match TriggerEvent::from_parts(event_type, payload) {
            Ok(event) => self.process_event_for(owner_id, event, connection_id).await,
            Err(e) => {
                tracing::warn!(event_type, "Rejected system event: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::automation::condition::Operator;
    use crate::automation::rule::{Keyword, MatchType, Response};
    use crate::automation::trigger::TriggerCondition;
    use crate::store::LibSqlBackend;

    struct Fixture {
        db: Arc<dyn Database>,
        engine: AutomationEngine,
        connection: Connection,
        contact: Contact,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let connection = Connection {
            id: Uuid::new_v4(),
            owner_id: "acct".into(),
            name: "Main".into(),
            instance: "main".into(),
        };
        db.create_connection(&connection).await.unwrap();
        let (contact, _) = db
            .create_contact(&Contact::new("acct", "5511999998888"))
            .await
            .unwrap();
        Fixture {
            engine: AutomationEngine::new(Arc::clone(&db)),
            db,
            connection,
            contact,
        }
    }

    fn greeting(name: &str) -> Rule {
        Rule::keyword("acct", name, vec![Keyword::new("oi", MatchType::Word)])
            .with_response(Response::text("Olá!", 0, 0))
    }

    #[tokio::test]
    async fn outbound_and_empty_messages_are_skipped() {
        let f = fixture().await;
        let mut outbound = InboundMessage::inbound_text("oi");
        outbound.direction = MessageDirection::Outbound;
        let outcome = f.engine.process_message(&outbound, &f.connection, &f.contact).await;
        assert_eq!(outcome.reason, Some(SkipReason::OutboundMessage));

        let empty = InboundMessage::inbound_text("   ");
        let outcome = f.engine.process_message(&empty, &f.connection, &f.contact).await;
        assert_eq!(outcome.reason, Some(SkipReason::NoContent));
    }

    #[tokio::test]
    async fn no_rules_and_no_match() {
        let f = fixture().await;
        let msg = InboundMessage::inbound_text("oi");
        let outcome = f.engine.process_message(&msg, &f.connection, &f.contact).await;
        assert_eq!(outcome.reason, Some(SkipReason::NoAutomations));

        f.db.create_rule(&greeting("greeting")).await.unwrap();
        let other = InboundMessage::inbound_text("boa tarde");
        let outcome = f.engine.process_message(&other, &f.connection, &f.contact).await;
        assert!(!outcome.processed);
        assert_eq!(outcome.reason, Some(SkipReason::NoMatch));
    }

    #[tokio::test]
    async fn first_matching_rule_by_name_runs() {
        let f = fixture().await;
        let b = greeting("b-greeting");
        let a = greeting("a-greeting");
        let mut inactive = greeting("0-disabled");
        inactive.active = false;
        for rule in [&b, &a, &inactive] {
            f.db.create_rule(rule).await.unwrap();
        }

        let msg = InboundMessage::inbound_text("Oi, tudo bem?");
        let outcome = f.engine.process_message(&msg, &f.connection, &f.contact).await;
        assert!(outcome.processed);
        assert_eq!(outcome.reason, None);
        assert_eq!(outcome.automation_id, Some(a.id));
        assert_eq!(outcome.automation_name.as_deref(), Some("a-greeting"));

        assert_eq!(f.db.get_rule(a.id).await.unwrap().unwrap().execution_count, 1);
        assert_eq!(f.db.get_rule(b.id).await.unwrap().unwrap().execution_count, 0);
    }

    #[tokio::test]
    async fn interpreted_text_is_matched_when_body_is_blank() {
        let f = fixture().await;
        f.db.create_rule(&greeting("greeting")).await.unwrap();
        let mut audio = InboundMessage::inbound_text("");
        audio.message_type = "audio".into();
        audio.interpreted_text = Some("oi quero saber o preço".into());
        let outcome = f.engine.process_message(&audio, &f.connection, &f.contact).await;
        assert!(outcome.processed);
    }

    #[tokio::test]
    async fn rules_of_other_owners_are_ignored() {
        let f = fixture().await;
        f.db
            .create_rule(&Rule::keyword("someone-else", "g", vec![Keyword::new("oi", MatchType::Is)]))
            .await
            .unwrap();
        let msg = InboundMessage::inbound_text("oi");
        let outcome = f.engine.process_message(&msg, &f.connection, &f.contact).await;
        assert_eq!(outcome.reason, Some(SkipReason::NoAutomations));
    }

    #[tokio::test]
    async fn every_matching_trigger_rule_runs() {
        let f = fixture().await;
        let won_a = Rule::trigger("acct", "won-a", TriggerCondition::DealWon);
        let won_b = Rule::trigger("acct", "won-b", TriggerCondition::DealWon);
        let lost = Rule::trigger("acct", "lost", TriggerCondition::DealLost);
        for rule in [&won_a, &won_b, &lost] {
            f.db.create_rule(rule).await.unwrap();
        }

        let event = TriggerEvent::DealWon {
            contact: f.contact.clone(),
            deal_id: None,
            from_stage: Some("proposta".into()),
            to_stage: "ganho".into(),
        };
        assert_eq!(f.engine.process_event(event, Some(f.connection.id)).await, 2);
        assert_eq!(f.db.get_rule(won_a.id).await.unwrap().unwrap().execution_count, 1);
        assert_eq!(f.db.get_rule(lost.id).await.unwrap().unwrap().execution_count, 0);

        let not_won = TriggerEvent::DealWon {
            contact: f.contact.clone(),
            deal_id: None,
            from_stage: None,
            to_stage: "negociação".into(),
        };
        assert_eq!(f.engine.process_event(not_won, None).await, 0);
    }

    #[tokio::test]
    async fn raw_custom_field_event_is_dispatched() {
        let f = fixture().await;
        let vip = Rule::trigger(
            "acct",
            "vip",
            TriggerCondition::CustomFieldChanged {
                field_key: "plano".into(),
                operator: Operator::Contains,
                value: json!("vip"),
            },
        )
        .with_tags(["vip"]);
        f.db.create_rule(&vip).await.unwrap();

        let ran = f
            .engine
            .process_raw_event(
                "acct",
                "custom_field_changed",
                json!({
                    "contact": f.contact,
                    "field_key": "plano",
                    "old_value": null,
                    "new_value": "Plano VIP Gold",
                }),
                None,
            )
            .await;
        assert_eq!(ran, 1);
        let tags = f.db.list_contact_tags(f.contact.id).await.unwrap();
        assert_eq!(tags[0].name, "vip");

        let other_field = f
            .engine
            .process_raw_event(
                "acct",
                "custom_field_changed",
                json!({ "contact": f.contact, "field_key": "cidade", "new_value": "vip" }),
                None,
            )
            .await;
        assert_eq!(other_field, 0);
    }

    #[tokio::test]
    async fn unknown_event_type_is_rejected_quietly() {
        let f = fixture().await;
        let ran = f
            .engine
            .process_raw_event("acct", "invoice_paid", json!({ "contact": f.contact }), None)
            .await;
        assert_eq!(ran, 0);
    }

    #[tokio::test]
    async fn events_for_unstored_contacts_run_nothing() {
        let f = fixture().await;
        let welcome = Rule::trigger("acct", "welcome", TriggerCondition::ContactCreated)
            .with_response(Response::text("Promo!", 0, 0));
        f.db.create_rule(&welcome).await.unwrap();

        let made_up = Contact::new("acct", "5599000000000");
        let ran = f
            .engine
            .process_event(TriggerEvent::ContactCreated { contact: made_up }, None)
            .await;
        assert_eq!(ran, 0);
        assert_eq!(f.db.get_rule(welcome.id).await.unwrap().unwrap().execution_count, 0);
    }

    #[tokio::test]
    async fn events_are_scoped_to_the_contacts_owner() {
        let f = fixture().await;
        let welcome = Rule::trigger("acct", "welcome", TriggerCondition::ContactCreated);
        f.db.create_rule(&welcome).await.unwrap();
        let event = || TriggerEvent::ContactCreated { contact: f.contact.clone() };

        assert_eq!(f.engine.process_event_for("intruder", event(), None).await, 0);

        let foreign = Connection {
            id: Uuid::new_v4(),
            owner_id: "intruder".into(),
            name: "Other".into(),
            instance: "other".into(),
        };
        f.db.create_connection(&foreign).await.unwrap();
        assert_eq!(f.engine.process_event(event(), Some(foreign.id)).await, 0);
        assert_eq!(f.db.get_rule(welcome.id).await.unwrap().unwrap().execution_count, 0);

        assert_eq!(f.engine.process_event_for("acct", event(), Some(f.connection.id)).await, 1);
        assert_eq!(f.db.get_rule(welcome.id).await.unwrap().unwrap().execution_count, 1);
    }
}
