//! Shared domain records: contacts, tags, origins, connections, messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ── Contacts ────────────────────────────────────────────────────────

/// A contact, identified per owner by its normalized phone number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub owner_id: String,
    pub phone: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Open custom-field map, merged on every webhook that supplies fields.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub origin_id: Option<Uuid>,
    #[serde(default)]
    pub profile_picture: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// A fresh contact with no name, email, metadata or origin.
    pub fn new(owner_id: impl Into<String>, phone: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            phone: phone.into(),
            name: None,
            email: None,
            metadata: Map::new(),
            origin_id: None,
            profile_picture: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

// ── Tags & origins ──────────────────────────────────────────────────

/// An owner-scoped label. Unique per (owner, name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub color: String,
}

/// Default color for tags created implicitly by rules and webhooks.
pub const DEFAULT_TAG_COLOR: &str = "#6366f1";

/// Where a contact first came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
}

// ── Connections & messages ──────────────────────────────────────────

/// A messaging account (number/instance) that belongs to an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    /// Gateway-side instance identifier used when sending.
    pub instance: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

/// A chat message handed to the keyword path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub direction: MessageDirection,
    #[serde(default)]
    pub content: String,
    /// Transcription/interpretation attached upstream (audio, images).
    #[serde(default)]
    pub interpreted_text: Option<String>,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

fn default_message_type() -> String {
    "text".to_string()
}

impl InboundMessage {
    pub fn inbound_text(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            direction: MessageDirection::Inbound,
            content: content.into(),
            interpreted_text: None,
            message_type: default_message_type(),
            received_at: Utc::now(),
        }
    }

    /// Text used for matching: the body, or the interpreted text when the body is blank.
    pub fn match_text(&self) -> Option<&str> {
        let body = self.content.trim();
        if !body.is_empty() {
            return Some(body);
        }
        self.interpreted_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

// ── CRM side tables ─────────────────────────────────────────────────

/// A contact's deal in a sales funnel; the latest one is the funnel snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub funnel_name: String,
    pub stage: String,
    pub updated_at: DateTime<Utc>,
}

/// Whether the AI agent answers a given contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSetting {
    pub contact_id: Uuid,
    pub enabled: bool,
    pub toggled_at: DateTime<Utc>,
    pub disabled_reason: Option<String>,
}

/// A drip sequence contacts can be enrolled into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub active: bool,
}
