//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `loki_rule_operator_reconciliations_total{event}` - Reconciliations by event kind
//! - `loki_rule_operator_reconciliation_errors_total{reason}` - Failed reconciliations by reason
//! - `loki_rule_operator_reconciliation_duration_seconds` - Duration of reconciliations
//! - `loki_rule_operator_fragments` - Rules files currently held by the aggregated ConfigMap
//! - `loki_rule_operator_validation_failures_total` - LogQL expressions rejected by Loki
//! - `loki_rule_operator_requeues_total` - Requeues scheduled by the error policy

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "loki_rule_operator_reconciliations_total",
            "Total number of reconciliations by event kind",
        ),
        &["event"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "loki_rule_operator_reconciliation_errors_total",
            "Total number of reconciliation errors by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "loki_rule_operator_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static FRAGMENTS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "loki_rule_operator_fragments",
        "Current number of rules files in the aggregated ConfigMap",
    )
    .expect("Failed to create FRAGMENTS metric - this should never happen")
});

static VALIDATION_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "loki_rule_operator_validation_failures_total",
        "Total number of LogQL expressions rejected during validation",
    )
    .expect("Failed to create VALIDATION_FAILURES_TOTAL metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "loki_rule_operator_requeues_total",
        "Total number of requeues scheduled after a failed reconciliation",
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Fails only when a metric is registered twice"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(FRAGMENTS.clone()))?;
    REGISTRY.register(Box::new(VALIDATION_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_reconciliations(event: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[event]).inc();
}

pub fn increment_reconciliation_errors(reason: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn set_fragments(count: usize) {
    FRAGMENTS.set(i64::try_from(count).unwrap_or(i64::MAX));
}

pub fn increment_validation_failures() {
    VALIDATION_FAILURES_TOTAL.inc();
}

pub fn increment_requeues() {
    REQUEUES_TOTAL.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_by_label() {
        let before = RECONCILIATIONS_TOTAL.with_label_values(&["created"]).get();
        increment_reconciliations("created");
        assert_eq!(
            RECONCILIATIONS_TOTAL.with_label_values(&["created"]).get(),
            before + 1
        );

        set_fragments(3);
        assert_eq!(FRAGMENTS.get(), 3);
    }
}
