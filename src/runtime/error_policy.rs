//! # Error Policy
//!
//! Decides when a failed LokiRule is reconciled again.
//!
//! Transient failures are requeued with a per-resource Fibonacci backoff.
//! Failures that only an edit of the resource can fix (an invalid expression,
//! an unserializable spec) wait for the next change instead.

use crate::controller::reconciler::{BackoffState, Reconciler, ReconcilerError};
use crate::crd::LokiRule;
use crate::observability::metrics;
use crate::runtime::watch_loop::ControllerContext;
use kube_runtime::controller::Action;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) fn resource_key(rule: &LokiRule) -> String {
    format!("{}/{}", rule.namespace_or_default(), rule.name_or_unknown())
}

/// Whether the error can go away without the resource changing
fn should_requeue(error: &ReconcilerError) -> bool {
    !matches!(
        error,
        ReconcilerError::Validation { .. } | ReconcilerError::Serialization(_)
    )
}

/// Next requeue delay for `key`, advancing its backoff
pub fn next_backoff(reconciler: &Reconciler, key: &str) -> (u64, u32) {
    match reconciler.backoff_states.lock() {
        Ok(mut states) => {
            let state = states.entry(key.to_string()).or_default();
            state.increment_error();
            (state.backoff.next_backoff_seconds(), state.error_count)
        }
        Err(e) => {
            warn!("Failed to lock backoff_states: {}, using default backoff", e);
            (BackoffState::default().backoff.next_backoff_seconds(), 0)
        }
    }
}

/// Forget the backoff of `key` after a successful reconciliation
pub fn reset_backoff(reconciler: &Reconciler, key: &str) {
    if let Ok(mut states) = reconciler.backoff_states.lock() {
        if let Some(state) = states.get_mut(key) {
            state.reset();
            debug!("Reset backoff for {}", key);
        }
    }
}

pub fn handle_reconciliation_error(
    rule: Arc<LokiRule>,
    error: &ReconcilerError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = resource_key(&rule);

    if !should_requeue(error) {
        info!(
            "LokiRule {} will be reconciled again once it changes ({})",
            key,
            error.reason()
        );
        return Action::await_change();
    }

    let (backoff_seconds, error_count) = next_backoff(&ctx.reconciler, &key);
    info!(
        "Retrying LokiRule {} in {}s (error count: {}, reason: {})",
        key,
        backoff_seconds,
        error_count,
        error.reason()
    );
    metrics::increment_requeues();
    Action::requeue(std::time::Duration::from_secs(backoff_seconds))
}
