//! # Status Updates
//!
//! Records the outcome of each Created/Updated reconciliation on the LokiRule.

use crate::controller::reconciler::reconcile::ReconcileOutcome;
use crate::controller::reconciler::types::{Reconciler, ReconcilerError};
use crate::crd::{Condition, LokiRule, LokiRuleStatus, ReconcilePhase};
use tracing::{debug, warn};

/// Status describing `result` for `rule`, with fresh timestamps
pub fn build_status(
    rule: &LokiRule,
    result: &Result<ReconcileOutcome, ReconcilerError>,
) -> LokiRuleStatus {
    let now = chrono::Utc::now().to_rfc3339();
    let (phase, ready, reason, message, fragment_key) = match result {
        Ok(outcome) => (
            ReconcilePhase::Synced,
            "True",
            "ReconciliationSucceeded",
            outcome.describe(),
            Some(outcome.fragment_key.clone()),
        ),
        Err(e) => (
            ReconcilePhase::Failed,
            "False",
            e.reason(),
            e.to_string(),
            rule.status.as_ref().and_then(|s| s.fragment_key.clone()),
        ),
    };

    LokiRuleStatus {
        phase: Some(phase.to_string()),
        message: Some(message.clone()),
        conditions: vec![Condition {
            r#type: "Ready".to_string(),
            status: ready.to_string(),
            last_transition_time: Some(now.clone()),
            reason: Some(reason.to_string()),
            message: Some(message),
        }],
        observed_generation: rule.metadata.generation,
        last_reconcile_time: Some(now),
        fragment_key,
    }
}

/// Whether `new` differs from `current` in anything but timestamps
fn status_changed(current: Option<&LokiRuleStatus>, new: &LokiRuleStatus) -> bool {
    let Some(current) = current else {
        return true;
    };
    let condition_summary = |status: &LokiRuleStatus| {
        status
            .conditions
            .iter()
            .map(|c| (c.r#type.clone(), c.status.clone(), c.reason.clone(), c.message.clone()))
            .collect::<Vec<_>>()
    };
    current.phase != new.phase
        || current.message != new.message
        || current.observed_generation != new.observed_generation
        || current.fragment_key != new.fragment_key
        || condition_summary(current) != condition_summary(new)
}

/// Patch the status subresource, skipping the write when nothing changed
///
/// A failed status write is logged and otherwise ignored.
pub async fn update_status(
    reconciler: &Reconciler,
    rule: &LokiRule,
    result: &Result<ReconcileOutcome, ReconcilerError>,
) {
    let status = build_status(rule, result);
    if !status_changed(rule.status.as_ref(), &status) {
        debug!(
            "Skipping status update for {}/{}: unchanged",
            rule.namespace_or_default(),
            rule.name_or_unknown()
        );
        return;
    }

    if let Err(e) = reconciler
        .store
        .patch_rule_status(rule.namespace_or_default(), rule.name_or_unknown(), &status)
        .await
    {
        warn!(
            "Failed to update status of LokiRule {}/{}: {}",
            rule.namespace_or_default(),
            rule.name_or_unknown(),
            e
        );
    }
}
