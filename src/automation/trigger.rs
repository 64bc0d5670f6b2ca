//! System-event triggers: the event union, the stored condition union, and
//! the matcher between them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::automation::condition::Operator;
use crate::error::RuleError;
use crate::types::Contact;

/// Stage identifiers that mean a deal was won.
pub const WON_STAGES: [&str; 2] = ["ganho", "won"];
/// Stage identifiers that mean a deal was lost.
pub const LOST_STAGES: [&str; 2] = ["perdido", "lost"];

/// Kind of system event. Doubles as the `trigger_type` DB column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    ContactCreated,
    TagAdded,
    CustomFieldChanged,
    FunnelStageChanged,
    DealWon,
    DealLost,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::ContactCreated => "contact_created",
            TriggerType::TagAdded => "tag_added",
            TriggerType::CustomFieldChanged => "custom_field_changed",
            TriggerType::FunnelStageChanged => "funnel_stage_changed",
            TriggerType::DealWon => "deal_won",
            TriggerType::DealLost => "deal_lost",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact_created" => Ok(TriggerType::ContactCreated),
            "tag_added" => Ok(TriggerType::TagAdded),
            "custom_field_changed" => Ok(TriggerType::CustomFieldChanged),
            "funnel_stage_changed" => Ok(TriggerType::FunnelStageChanged),
            "deal_won" => Ok(TriggerType::DealWon),
            "deal_lost" => Ok(TriggerType::DealLost),
            other => Err(RuleError::UnknownTrigger(other.to_string())),
        }
    }
}

// ── Events ──────────────────────────────────────────────────────────

/// A state change raised by the CRM or by webhook ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TriggerEvent {
    ContactCreated {
        contact: Contact,
    },
    TagAdded {
        contact: Contact,
        tag_id: Uuid,
    },
    CustomFieldChanged {
        contact: Contact,
        field_key: String,
        #[serde(default)]
        old_value: Value,
        #[serde(default)]
        new_value: Value,
    },
    FunnelStageChanged {
        contact: Contact,
        #[serde(default)]
        deal_id: Option<Uuid>,
        #[serde(default)]
        from_stage: Option<String>,
        to_stage: String,
    },
    DealWon {
        contact: Contact,
        #[serde(default)]
        deal_id: Option<Uuid>,
        #[serde(default)]
        from_stage: Option<String>,
        to_stage: String,
    },
    DealLost {
        contact: Contact,
        #[serde(default)]
        deal_id: Option<Uuid>,
        #[serde(default)]
        from_stage: Option<String>,
        to_stage: String,
    },
}

impl TriggerEvent {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerEvent::ContactCreated { .. } => TriggerType::ContactCreated,
            TriggerEvent::TagAdded { .. } => TriggerType::TagAdded,
            TriggerEvent::CustomFieldChanged { .. } => TriggerType::CustomFieldChanged,
            TriggerEvent::FunnelStageChanged { .. } => TriggerType::FunnelStageChanged,
            TriggerEvent::DealWon { .. } => TriggerType::DealWon,
            TriggerEvent::DealLost { .. } => TriggerType::DealLost,
        }
    }

    pub fn contact(&self) -> &Contact {
        match self {
            TriggerEvent::ContactCreated { contact }
            | TriggerEvent::TagAdded { contact, .. }
            | TriggerEvent::CustomFieldChanged { contact, .. }
            | TriggerEvent::FunnelStageChanged { contact, .. }
            | TriggerEvent::DealWon { contact, .. }
            | TriggerEvent::DealLost { contact, .. } => contact,
        }
    }

    /// Parse the loose `(event_type, payload)` form used by external callers.
    pub fn from_parts(event_type: &str, payload: Value) -> Result<Self, RuleError> {
        let trigger_type: TriggerType = event_type.parse()?;
        let mut map = match payload {
            Value::Object(map) => map,
            other => {
                return Err(RuleError::Invalid {
                    what: format!("{trigger_type} payload"),
                    reason: format!("expected an object, got {other}"),
                });
            }
        };
        map.insert("event_type".into(), Value::String(trigger_type.as_str().into()));
        serde_json::from_value(Value::Object(map)).map_err(|e| RuleError::Invalid {
            what: format!("{trigger_type} payload"),
            reason: e.to_string(),
        })
    }
}

// ── Conditions ──────────────────────────────────────────────────────

/// The filter a trigger-kind rule applies to events of its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Fires for every new contact; origin filters in stored config are not applied.
    ContactCreated,
    TagAdded {
        tag_id: Uuid,
    },
    CustomFieldChanged {
        field_key: String,
        #[serde(default)]
        operator: Operator,
        #[serde(default)]
        value: Value,
    },
    FunnelStageChanged {
        #[serde(default)]
        target_stage: Option<String>,
    },
    DealWon,
    DealLost,
}

impl TriggerCondition {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerCondition::ContactCreated => TriggerType::ContactCreated,
            TriggerCondition::TagAdded { .. } => TriggerType::TagAdded,
            TriggerCondition::CustomFieldChanged { .. } => TriggerType::CustomFieldChanged,
            TriggerCondition::FunnelStageChanged { .. } => TriggerType::FunnelStageChanged,
            TriggerCondition::DealWon => TriggerType::DealWon,
            TriggerCondition::DealLost => TriggerType::DealLost,
        }
    }

    /// Parse a condition from its DB representation.
    pub fn from_db(trigger_type: &str, config: &Value) -> Result<Self, RuleError> {
        let missing = |field: &str| RuleError::MissingField {
            trigger: trigger_type.to_string(),
            field: field.to_string(),
        };
        let str_field = |field: &str| {
            config
                .get(field)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };

        match trigger_type.parse::<TriggerType>()? {
            TriggerType::ContactCreated => Ok(TriggerCondition::ContactCreated),
            TriggerType::TagAdded => {
                let raw = str_field("tag_id").ok_or_else(|| missing("tag_id"))?;
                let tag_id = Uuid::parse_str(&raw).map_err(|e| RuleError::Invalid {
                    what: "tag_id".into(),
                    reason: e.to_string(),
                })?;
                Ok(TriggerCondition::TagAdded { tag_id })
            }
            TriggerType::CustomFieldChanged => {
                let field_key = str_field("field_key").ok_or_else(|| missing("field_key"))?;
                let operator = match str_field("operator") {
                    Some(op) => op.parse()?,
                    None => Operator::default(),
                };
                let value = config.get("value").cloned().unwrap_or(Value::Null);
                Ok(TriggerCondition::CustomFieldChanged {
                    field_key,
                    operator,
                    value,
                })
            }
            TriggerType::FunnelStageChanged => Ok(TriggerCondition::FunnelStageChanged {
                target_stage: str_field("target_stage"),
            }),
            TriggerType::DealWon => Ok(TriggerCondition::DealWon),
            TriggerType::DealLost => Ok(TriggerCondition::DealLost),
        }
    }

    /// Serialize condition-specific config to JSON for DB storage.
    pub fn to_config_json(&self) -> Value {
        match self {
            TriggerCondition::ContactCreated
            | TriggerCondition::DealWon
            | TriggerCondition::DealLost => serde_json::json!({}),
            TriggerCondition::TagAdded { tag_id } => serde_json::json!({ "tag_id": tag_id }),
            TriggerCondition::CustomFieldChanged {
                field_key,
                operator,
                value,
            } => serde_json::json!({
                "field_key": field_key,
                "operator": operator.as_str(),
                "value": value,
            }),
            TriggerCondition::FunnelStageChanged { target_stage } => {
                serde_json::json!({ "target_stage": target_stage })
            }
        }
    }
}

/// Does `event` satisfy `condition`?
pub fn matches(condition: &TriggerCondition, event: &TriggerEvent) -> bool {
    match (condition, event) {
        (TriggerCondition::ContactCreated, TriggerEvent::ContactCreated { .. }) => true,
        (TriggerCondition::TagAdded { tag_id }, TriggerEvent::TagAdded { tag_id: got, .. }) => {
            tag_id == got
        }
        (
            TriggerCondition::CustomFieldChanged {
                field_key,
                operator,
                value,
            },
            TriggerEvent::CustomFieldChanged {
                field_key: got_key,
                new_value,
                ..
            },
        ) => field_key == got_key && operator.evaluate(value, new_value),
        (
            TriggerCondition::FunnelStageChanged { target_stage },
            TriggerEvent::FunnelStageChanged { to_stage, .. },
        ) => target_stage.as_deref().is_none_or(|target| target == to_stage),
        (TriggerCondition::DealWon, TriggerEvent::DealWon { to_stage, .. }) => {
            WON_STAGES.contains(&to_stage.as_str())
        }
        (TriggerCondition::DealLost, TriggerEvent::DealLost { to_stage, .. }) => {
            LOST_STAGES.contains(&to_stage.as_str())
        }
        _ => false,
    }
}
