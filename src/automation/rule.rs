//! Core types for automation rules.
//!
//! A rule is a named, owner-scoped configuration that either matches inbound
//! message text (keyword kind) or system events (trigger kind), and carries
//! the responses and side-effect actions to run when it matches.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::automation::trigger::TriggerCondition;
use crate::error::RuleError;

/// A stored automation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub active: bool,
    pub kind: RuleKind,
    /// Outbound messages, sent in `order_index` order.
    pub responses: Vec<Response>,
    /// Webhook relay target; `None` when relay is disabled or has no URL.
    pub relay: Option<RelayTarget>,
    /// Tag names added to the contact on every execution.
    pub tags_to_add: Vec<String>,
    pub origin_id: Option<Uuid>,

    // Runtime state (DB-managed)
    pub execution_count: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// A keyword rule with no responses or actions.
    pub fn keyword(owner_id: impl Into<String>, name: impl Into<String>, keywords: Vec<Keyword>) -> Self {
        Self::with_kind(owner_id, name, RuleKind::Keyword { keywords })
    }

    /// A trigger rule with no responses or actions.
    pub fn trigger(
        owner_id: impl Into<String>,
        name: impl Into<String>,
        condition: TriggerCondition,
    ) -> Self {
        Self::with_kind(owner_id, name, RuleKind::Trigger { condition })
    }

    fn with_kind(owner_id: impl Into<String>, name: impl Into<String>, kind: RuleKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            name: name.into(),
            active: true,
            kind,
            responses: Vec::new(),
            relay: None,
            tags_to_add: Vec::new(),
            origin_id: None,
            execution_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_response(mut self, response: Response) -> Self {
        self.responses.push(response);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags_to_add.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_relay(mut self, relay: RelayTarget) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_origin(mut self, origin_id: Uuid) -> Self {
        self.origin_id = Some(origin_id);
        self
    }

    /// Responses sorted by `order_index` (stable for equal indexes).
    pub fn ordered_responses(&self) -> Vec<&Response> {
        let mut ordered: Vec<&Response> = self.responses.iter().collect();
        ordered.sort_by_key(|r| r.order_index);
        ordered
    }
}

/// What a rule matches against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    /// Free-text matching on inbound messages.
    Keyword { keywords: Vec<Keyword> },
    /// Structured system events.
    Trigger { condition: TriggerCondition },
}

impl RuleKind {
    /// The string tag stored in the DB kind column.
    pub fn type_tag(&self) -> &'static str {
        match self {
            RuleKind::Keyword { .. } => "keyword",
            RuleKind::Trigger { .. } => "trigger",
        }
    }
}

// ── Keywords ────────────────────────────────────────────────────────

/// How a keyword is compared against message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Is,
    Contains,
    StartsWith,
    Word,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Is => "is",
            MatchType::Contains => "contains",
            MatchType::StartsWith => "starts_with",
            MatchType::Word => "word",
        }
    }
}

impl FromStr for MatchType {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "is" => Ok(MatchType::Is),
            "contains" => Ok(MatchType::Contains),
            "starts_with" => Ok(MatchType::StartsWith),
            "word" => Ok(MatchType::Word),
            other => Err(RuleError::Invalid {
                what: "match type".into(),
                reason: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyword {
    pub text: String,
    pub match_type: MatchType,
    #[serde(default)]
    pub case_sensitive: bool,
}

impl Keyword {
    pub fn new(text: impl Into<String>, match_type: MatchType) -> Self {
        Self {
            text: text.into(),
            match_type,
            case_sensitive: false,
        }
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }
}

// ── Responses ───────────────────────────────────────────────────────

/// Content type of a response step. Only `Text` is delivered by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
}

impl ResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::Text => "text",
            ResponseKind::Image => "image",
            ResponseKind::Audio => "audio",
            ResponseKind::Video => "video",
            ResponseKind::Document => "document",
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseKind {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ResponseKind::Text),
            "image" => Ok(ResponseKind::Image),
            "audio" => Ok(ResponseKind::Audio),
            "video" => Ok(ResponseKind::Video),
            "document" => Ok(ResponseKind::Document),
            other => Err(RuleError::Invalid {
                what: "response type".into(),
                reason: other.to_string(),
            }),
        }
    }
}

/// One outbound message step of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub content: String,
    #[serde(default)]
    pub delay_seconds: u32,
    #[serde(default)]
    pub order_index: i32,
}

impl Response {
    pub fn text(content: impl Into<String>, delay_seconds: u32, order_index: i32) -> Self {
        Self {
            kind: ResponseKind::Text,
            content: content.into(),
            delay_seconds,
            order_index,
        }
    }
}

// ── Relay ───────────────────────────────────────────────────────────

/// Where a rule relays its execution envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayTarget {
    pub url: String,
    /// Static fields copied into the envelope's `custom_fields`.
    #[serde(default)]
    pub custom_fields: Map<String, Value>,
}

impl RelayTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            custom_fields: Map::new(),
        }
    }

    /// Build from the stored toggle + URL; disabled or blank URLs yield `None`.
    pub fn from_db(enabled: bool, url: Option<String>, custom_fields: Map<String, Value>) -> Option<Self> {
        let url = url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty())?;
        enabled.then_some(Self { url, custom_fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ordered_responses_sorts_by_index() {
        let rule = Rule::keyword("acct", "welcome", vec![])
            .with_response(Response::text("second", 2, 1))
            .with_response(Response::text("first", 0, 0))
            .with_response(Response::text("third", 0, 5));
        let contents: Vec<&str> = rule
            .ordered_responses()
            .iter()
            .map(|r| r.content.as_str())
            .collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[test]
    fn kind_type_tag() {
        assert_eq!(RuleKind::Keyword { keywords: vec![] }.type_tag(), "keyword");
        assert_eq!(
            RuleKind::Trigger {
                condition: TriggerCondition::DealWon
            }
            .type_tag(),
            "trigger"
        );
    }

    #[test]
    fn response_serializes_type_field() {
        let json = serde_json::to_value(Response::text("Olá!", 0, 0)).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["delay_seconds"], 0);
        let parsed: Response =
            serde_json::from_value(json!({ "type": "image", "content": "https://x/y.png" })).unwrap();
        assert_eq!(parsed.kind, ResponseKind::Image);
        assert_eq!(parsed.delay_seconds, 0);
    }

    #[test]
    fn keyword_defaults_to_case_insensitive() {
        let kw: Keyword = serde_json::from_value(json!({ "text": "oi", "match_type": "word" })).unwrap();
        assert!(!kw.case_sensitive);
        assert_eq!(kw.match_type, MatchType::Word);
    }

    #[test]
    fn relay_target_requires_toggle_and_url() {
        assert!(RelayTarget::from_db(true, Some("https://hook".into()), Map::new()).is_some());
        assert!(RelayTarget::from_db(false, Some("https://hook".into()), Map::new()).is_none());
        assert!(RelayTarget::from_db(true, Some("   ".into()), Map::new()).is_none());
        assert!(RelayTarget::from_db(true, None, Map::new()).is_none());
    }

    #[test]
    fn match_and_response_kinds_parse() {
        for m in [MatchType::Is, MatchType::Contains, MatchType::StartsWith, MatchType::Word] {
            assert_eq!(m.as_str().parse::<MatchType>().unwrap(), m);
        }
        assert!("regex".parse::<MatchType>().is_err());
        assert_eq!("audio".parse::<ResponseKind>().unwrap(), ResponseKind::Audio);
        assert!("sticker".parse::<ResponseKind>().is_err());
    }
}
