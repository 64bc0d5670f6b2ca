//! Incoming webhook ingestion.
//!
//! A request moves through: key check → webhook lookup → JSON parse → receipt
//! stats → field extraction → phone validation → contact resolution →
//! actions. Anything rejected before the stats write leaves no trace; anything
//! after it is a 200-level soft outcome with `payload_saved = true`.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::auth::KeyValidator;
use crate::automation::AutomationEngine;
use crate::automation::condition::stringify;
use crate::automation::path;
use crate::automation::trigger::TriggerEvent;
use crate::config::DEFAULT_AGENT_DISABLED_REASON;
use crate::error::DatabaseError;
use crate::sequences::SequenceService;
use crate::store::Database;
use crate::types::{AgentSetting, Contact, DEFAULT_TAG_COLOR};
use crate::webhooks::model::{FieldMapping, IngestResponse, WebhookAction, WebhookConfig};

/// Phones shorter than this (after normalization) are rejected.
pub const MIN_PHONE_DIGITS: usize = 10;

/// Why an ingestion stopped early.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Invalid or missing API key")]
    Unauthorized,

    #[error("Webhook not found")]
    WebhookNotFound,

    #[error("Webhook is inactive")]
    WebhookInactive,

    #[error("Invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("Phone number missing or invalid")]
    InvalidPhone,

    #[error("Contact not found and webhook does not create contacts")]
    ContactNotFound,

    /// Store failure after the payload was saved.
    #[error("Processing failed: {0}")]
    Processing(String),

    /// Store failure before the payload was saved.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::Unauthorized => StatusCode::UNAUTHORIZED,
            IngestError::WebhookNotFound | IngestError::ContactNotFound => StatusCode::NOT_FOUND,
            IngestError::WebhookInactive | IngestError::InvalidJson(_) => StatusCode::BAD_REQUEST,
            IngestError::InvalidPhone | IngestError::Processing(_) => StatusCode::OK,
            IngestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the receipt stats were already written when this error occurred.
    pub fn payload_saved(&self) -> bool {
        matches!(
            self,
            IngestError::InvalidPhone | IngestError::ContactNotFound | IngestError::Processing(_)
        )
    }
}

impl From<DatabaseError> for IngestError {
    fn from(e: DatabaseError) -> Self {
        IngestError::Processing(e.to_string())
    }
}

/// Status plus body, ready to hand to axum.
#[derive(Debug)]
pub struct IngestReply {
    pub status: StatusCode,
    pub body: IngestResponse,
}

impl IngestReply {
    fn from_error(error: IngestError) -> Self {
        let payload_saved = error.payload_saved();
        Self {
            status: error.status_code(),
            body: IngestResponse {
                success: false,
                error: Some(error.to_string()),
                payload_saved: payload_saved.then_some(true),
                ..Default::default()
            },
        }
    }
}

impl IntoResponse for IngestReply {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Strip everything but ASCII digits.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Normalized phone, or `None` when it has fewer than [`MIN_PHONE_DIGITS`] digits.
pub fn valid_phone(raw: &str) -> Option<String> {
    let phone = normalize_phone(raw);
    (phone.len() >= MIN_PHONE_DIGITS).then_some(phone)
}

/// Values pulled out of a payload by the webhook's field mappings.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExtractedFields {
    pub phone: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub origin_id: Option<Uuid>,
    /// Everything that is not a reserved field, keyed by mapping field.
    pub custom: Map<String, Value>,
}

/// Run every mapping against `payload`; null or missing values are dropped.
pub fn extract_fields(mappings: &[FieldMapping], payload: &Value) -> ExtractedFields {
    let mut fields = ExtractedFields::default();
    for mapping in mappings {
        let Some(value) = path::extract(payload, &mapping.path) else {
            continue;
        };
        let text = || Some(stringify(value).trim().to_string()).filter(|s| !s.is_empty());
        match mapping.field.as_str() {
            "phone" => fields.phone = text(),
            "name" => fields.name = text(),
            "email" => fields.email = text(),
            "origin_id" | "originId" => {
                fields.origin_id = text().and_then(|s| match Uuid::parse_str(&s) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        tracing::warn!(value = %s, "Ignoring mapped origin id: {}", e);
                        None
                    }
                })
            }
            custom => {
                fields.custom.insert(custom.to_string(), value.clone());
            }
        }
    }
    fields
}

/// Collaborators used by the ingestor.
pub struct IngestDeps {
    pub store: Arc<dyn Database>,
    pub keys: Arc<dyn KeyValidator>,
    pub sequences: Arc<dyn SequenceService>,
    pub engine: Arc<AutomationEngine>,
}

pub struct WebhookIngestor {
    deps: IngestDeps,
    agent_disabled_reason: String,
}

impl WebhookIngestor {
    pub fn new(deps: IngestDeps) -> Self {
        Self {
            deps,
            agent_disabled_reason: DEFAULT_AGENT_DISABLED_REASON.to_string(),
        }
    }

    pub fn with_agent_disabled_reason(mut self, reason: impl Into<String>) -> Self {
        self.agent_disabled_reason = reason.into();
        self
    }

    /// Handle one webhook call. Never fails; errors become the reply status.
    pub async fn ingest(&self, webhook_id: Uuid, api_key: Option<&str>, body: &[u8]) -> IngestReply {
        let started = Instant::now();
        let mut reply = match self.run(webhook_id, api_key, body).await {
            Ok(body) => IngestReply {
                status: StatusCode::OK,
                body,
            },
            Err(e) => {
                if matches!(e, IngestError::Internal(_)) {
                    tracing::error!(webhook_id = %webhook_id, "Webhook ingestion failed: {}", e);
                } else {
                    tracing::info!(webhook_id = %webhook_id, "Webhook rejected: {}", e);
                }
                IngestReply::from_error(e)
            }
        };
        reply.body.processing_time = format!("{}ms", started.elapsed().as_millis());
        reply
    }

    async fn run(
        &self,
        webhook_id: Uuid,
        api_key: Option<&str>,
        body: &[u8],
    ) -> Result<IngestResponse, IngestError> {
        let key = api_key.ok_or(IngestError::Unauthorized)?;
        let owner_id = self
            .deps
            .keys
            .validate(key)
            .await
            .map_err(|e| IngestError::Internal(e.to_string()))?
            .ok_or(IngestError::Unauthorized)?;

        let webhook = self
            .deps
            .store
            .get_webhook(webhook_id, &owner_id)
            .await
            .map_err(|e| IngestError::Internal(e.to_string()))?
            .ok_or(IngestError::WebhookNotFound)?;
        if !webhook.active {
            return Err(IngestError::WebhookInactive);
        }

        let payload: Value =
            serde_json::from_slice(body).map_err(|e| IngestError::InvalidJson(e.to_string()))?;

        self.deps
            .store
            .record_webhook_receipt(webhook.id, &payload, Utc::now())
            .await
            .map_err(|e| IngestError::Internal(e.to_string()))?;

        let fields = extract_fields(&webhook.field_mappings, &payload);
        let phone = fields
            .phone
            .as_deref()
            .and_then(valid_phone)
            .ok_or(IngestError::InvalidPhone)?;

        let mut executed = Vec::new();
        let (contact, events) = self
            .resolve_contact(&webhook, &owner_id, &phone, fields, &mut executed)
            .await?;

        for event in events {
            self.deps.engine.process_event(event, webhook.connection_id).await;
        }

        self.run_actions(&webhook, &contact, &mut executed).await;

        tracing::info!(
            webhook = %webhook.name,
            contact_id = %contact.id,
            actions = ?executed,
            "Webhook processed"
        );
        Ok(IngestResponse {
            success: true,
            message: Some("Webhook processed".into()),
            contact: Some(contact),
            actions_executed: Some(executed),
            payload_saved: Some(true),
            ..Default::default()
        })
    }

    /// Find or create the contact and collect the events the change implies.
    async fn resolve_contact(
        &self,
        webhook: &WebhookConfig,
        owner_id: &str,
        phone: &str,
        fields: ExtractedFields,
        executed: &mut Vec<String>,
    ) -> Result<(Contact, Vec<TriggerEvent>), IngestError> {
        let action_origin = webhook.action_origin();
        let origin_id = fields.origin_id.or(action_origin);
        if fields.origin_id.is_none() && action_origin.is_some() {
            executed.push("set_origin".into());
        }

        if let Some(existing) = self.deps.store.find_contact_by_phone(owner_id, phone).await? {
            return self.apply_changes(existing, fields, origin_id).await;
        }
        if !webhook.creates_contacts() {
            return Err(IngestError::ContactNotFound);
        }

        let mut candidate = Contact::new(owner_id, phone);
        candidate.name = fields.name.clone();
        candidate.email = fields.email.clone();
        candidate.origin_id = origin_id;
        candidate.metadata = fields.custom.clone();

        let (stored, created) = self.deps.store.create_contact(&candidate).await?;
        if !created {
            // Lost a creation race; treat the winner as an existing contact.
            return self.apply_changes(stored, fields, origin_id).await;
        }
        executed.push("create_contact".into());
        tracing::info!(contact_id = %stored.id, webhook = %webhook.name, "Contact created from webhook");

        let mut events = vec![TriggerEvent::ContactCreated {
            contact: stored.clone(),
        }];
        events.extend(fields.custom.into_iter().map(|(field_key, new_value)| {
            TriggerEvent::CustomFieldChanged {
                contact: stored.clone(),
                field_key,
                old_value: Value::Null,
                new_value,
            }
        }));
        Ok((stored, events))
    }

    /// Merge extracted fields into an existing contact; write only on change.
    async fn apply_changes(
        &self,
        mut contact: Contact,
        fields: ExtractedFields,
        origin_id: Option<Uuid>,
    ) -> Result<(Contact, Vec<TriggerEvent>), IngestError> {
        let mut dirty = false;
        if fields.name.is_some() && fields.name != contact.name {
            contact.name = fields.name;
            dirty = true;
        }
        if fields.email.is_some() && fields.email != contact.email {
            contact.email = fields.email;
            dirty = true;
        }
        if origin_id.is_some() && origin_id != contact.origin_id {
            contact.origin_id = origin_id;
            dirty = true;
        }

        let mut changed = Vec::new();
        for (key, value) in fields.custom {
            if contact.metadata.get(&key) == Some(&value) {
                continue;
            }
            let old = contact.metadata.insert(key.clone(), value.clone());
            changed.push((key, old.unwrap_or(Value::Null), value));
        }

        if !dirty && changed.is_empty() {
            return Ok((contact, Vec::new()));
        }
        self.deps.store.update_contact(&contact).await?;
        tracing::debug!(contact_id = %contact.id, fields_changed = changed.len(), "Contact updated from webhook");

        let events = changed
            .into_iter()
            .map(|(field_key, old_value, new_value)| TriggerEvent::CustomFieldChanged {
                contact: contact.clone(),
                field_key,
                old_value,
                new_value,
            })
            .collect();
        Ok((contact, events))
    }

    /// Run the non-contact actions in configured order; failures don't stop siblings.
    async fn run_actions(&self, webhook: &WebhookConfig, contact: &Contact, executed: &mut Vec<String>) {
        for action in &webhook.actions {
            let outcome = match action {
                WebhookAction::CreateContact | WebhookAction::SetOrigin { .. } => continue,
                WebhookAction::AddTag { tag } => self.add_tag(contact, tag).await,
                WebhookAction::SubscribeSequence { sequence_id } => {
                    self.subscribe(contact, *sequence_id).await
                }
                WebhookAction::SetAgent { enabled } => self.set_agent(contact, *enabled).await,
            };
            match outcome {
                Ok(true) => executed.push(action.label().to_string()),
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    webhook = %webhook.name,
                    action = action.label(),
                    contact_id = %contact.id,
                    "Webhook action failed: {}",
                    e
                ),
            }
        }
    }

    async fn add_tag(&self, contact: &Contact, name: &str) -> Result<bool, DatabaseError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(false);
        }
        let tag = self
            .deps
            .store
            .ensure_tag(&contact.owner_id, name, DEFAULT_TAG_COLOR)
            .await?;
        self.deps.store.assign_tag(contact.id, tag.id).await?;
        Ok(true)
    }

    async fn subscribe(&self, contact: &Contact, sequence_id: Uuid) -> Result<bool, DatabaseError> {
        if !self
            .deps
            .sequences
            .is_active(&contact.owner_id, sequence_id)
            .await?
        {
            tracing::debug!(sequence_id = %sequence_id, "Skipping inactive or foreign sequence");
            return Ok(false);
        }
        self.deps.sequences.enroll(sequence_id, contact.id).await?;
        Ok(true)
    }

    async fn set_agent(&self, contact: &Contact, enabled: bool) -> Result<bool, DatabaseError> {
        let setting = AgentSetting {
            contact_id: contact.id,
            enabled,
            toggled_at: Utc::now(),
            disabled_reason: (!enabled).then(|| self.agent_disabled_reason.clone()),
        };
        self.deps.store.upsert_agent_setting(&setting).await?;
        Ok(true)
    }
}
