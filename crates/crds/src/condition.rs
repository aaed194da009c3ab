//! Condition types shared by every reconciled resource.
//!
//! A condition is a named, persisted marker recording how far a resource
//! got through its provisioning steps. Conditions live in the resource's
//! status and are written with the same resource version as the rest of it.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tri-state status of a condition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    /// Step has not completed (or is waiting on something external)
    #[default]
    Unknown,

    /// Step completed successfully
    True,

    /// Step ran and failed
    False,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
        }
    }
}

/// A single named condition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition name, e.g. "Provisioned"
    #[serde(rename = "type")]
    pub type_: String,

    /// Current status
    #[serde(default)]
    pub status: ConditionStatus,

    /// Short machine-readable reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time any field of the condition was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,

    /// Last time `status` changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Creates a condition of the given type in the `Unknown` state.
    #[must_use]
    pub fn unknown(type_: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            type_: type_.into(),
            status: ConditionStatus::Unknown,
            reason: String::new(),
            message: String::new(),
            last_update_time: Some(now),
            last_transition_time: Some(now),
        }
    }
}

/// Resources that carry a condition list in their status.
pub trait Conditioned {
    /// Conditions currently recorded on the resource.
    fn conditions(&self) -> &[Condition];

    /// Mutable access to the conditions, creating the status if absent.
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// Looks up a condition by type.
    fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }
}
