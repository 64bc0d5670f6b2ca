//! Condition evaluation shared by trigger rules.
//!
//! Comparisons are case-insensitive and operate on the string form of both
//! operands, so `42`, `"42"` and `true`/`"TRUE"` compare as text.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RuleError;

/// Comparison applied between a configured value and an observed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    Equals,
    Contains,
    StartsWith,
    NotEmpty,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::Contains => "contains",
            Operator::StartsWith => "starts_with",
            Operator::NotEmpty => "not_empty",
        }
    }

    /// Evaluate this operator. `expected` is ignored by `NotEmpty`.
    pub fn evaluate(&self, expected: &Value, actual: &Value) -> bool {
        let actual = stringify(actual).to_lowercase();
        match self {
            Operator::NotEmpty => !actual.trim().is_empty(),
            Operator::Equals => actual == stringify(expected).to_lowercase(),
            Operator::Contains => actual.contains(&stringify(expected).to_lowercase()),
            Operator::StartsWith => actual.starts_with(&stringify(expected).to_lowercase()),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equals" => Ok(Operator::Equals),
            "contains" => Ok(Operator::Contains),
            "starts_with" => Ok(Operator::StartsWith),
            "not_empty" => Ok(Operator::NotEmpty),
            other => Err(RuleError::UnknownOperator(other.to_string())),
        }
    }
}

/// String form of a JSON value: strings unquoted, null empty, the rest as JSON text.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Free-function form used by callers holding loose values.
pub fn evaluate(operator: Operator, expected: &Value, actual: &Value) -> bool {
    operator.evaluate(expected, actual)
}
