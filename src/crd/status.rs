//! # LokiRule Status
//!
//! Status types for tracking reconciliation state and conditions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of the LokiRule resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LokiRuleStatus {
    /// Last phase reached by reconciliation (Synced or Failed)
    #[serde(default)]
    pub phase: Option<String>,
    /// Human-readable description of the last outcome
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// RFC3339 timestamp of the last reconciliation
    #[serde(default)]
    pub last_reconcile_time: Option<String>,
    /// Key of the rules file this resource owns in the aggregated ConfigMap
    #[serde(default)]
    pub fragment_key: Option<String>,
}

/// Condition represents a status condition for the resource
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    /// True, False or Unknown
    pub status: String,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Steps a single reconciliation walks through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePhase {
    Observed,
    Compiled,
    Merged,
    Synced,
    Failed,
}

impl ReconcilePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Observed => "Observed",
            Self::Compiled => "Compiled",
            Self::Merged => "Merged",
            Self::Synced => "Synced",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
