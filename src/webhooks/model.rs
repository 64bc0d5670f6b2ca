//! Webhook configuration and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::Contact;

/// Maps one target field to a path inside the incoming payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Target field: `phone`, `name`, `email`, `origin_id`, or a custom-field key.
    pub field: String,
    /// Path into the payload, e.g. `$.data.customer.phone`.
    pub path: String,
}

impl FieldMapping {
    pub fn new(field: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            path: path.into(),
        }
    }
}

/// An action a webhook performs for the resolved contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookAction {
    CreateContact,
    SetOrigin { origin_id: Uuid },
    AddTag { tag: String },
    SubscribeSequence { sequence_id: Uuid },
    SetAgent { enabled: bool },
}

impl WebhookAction {
    /// Label reported in `actions_executed`.
    pub fn label(&self) -> &'static str {
        match self {
            WebhookAction::CreateContact => "create_contact",
            WebhookAction::SetOrigin { .. } => "set_origin",
            WebhookAction::AddTag { .. } => "add_tag",
            WebhookAction::SubscribeSequence { .. } => "subscribe_sequence",
            WebhookAction::SetAgent { .. } => "set_agent",
        }
    }
}

/// A configured incoming webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub active: bool,
    /// Connection whose owner/instance scopes events fired by this webhook.
    pub connection_id: Option<Uuid>,
    pub field_mappings: Vec<FieldMapping>,
    pub actions: Vec<WebhookAction>,

    // Receipt stats (DB-managed)
    pub total_received: u64,
    pub last_payload: Option<Value>,
    pub last_received_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookConfig {
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            name: name.into(),
            active: true,
            connection_id: None,
            field_mappings: Vec::new(),
            actions: Vec::new(),
            total_received: 0,
            last_payload: None,
            last_received_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_mapping(mut self, field: &str, path: &str) -> Self {
        self.field_mappings.push(FieldMapping::new(field, path));
        self
    }

    pub fn with_action(mut self, action: WebhookAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn creates_contacts(&self) -> bool {
        self.actions.contains(&WebhookAction::CreateContact)
    }

    /// Origin configured through a `set_origin` action, if any.
    pub fn action_origin(&self) -> Option<Uuid> {
        self.actions.iter().find_map(|a| match a {
            WebhookAction::SetOrigin { origin_id } => Some(*origin_id),
            _ => None,
        })
    }
}

/// Body returned by the incoming-webhook endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Contact>,
    #[serde(rename = "actionsExecuted", skip_serializing_if = "Option::is_none")]
    pub actions_executed: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_saved: Option<bool>,
    /// Wall time spent handling the request, e.g. `"12ms"`.
    #[serde(rename = "processingTime")]
    pub processing_time: String,
}
