//! # Reconciliation Logic
//!
//! Drives one LokiRule event through the engine:
//!
//! - Created / Updated: compile, ensure the ConfigMap, merge, resolve, sync
//! - Deleted: ensure the ConfigMap, remove, resolve, sync
//!
//! Every step that fails aborts the remaining ones; nothing is rolled back and
//! nothing is retried here. Retries come from the controller requeueing the
//! resource.

use crate::controller::aggregator::{fragment_count, management_labels};
use crate::controller::fragment::fragment_key;
use crate::controller::reconciler::status::update_status;
use crate::controller::reconciler::types::{Reconciler, ReconcilerError, RuleEvent};
use crate::controller::target::TargetWorkload;
use crate::crd::{LokiRule, ReconcilePhase};
use crate::observability::metrics;
use k8s_openapi::api::core::v1::ConfigMap;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, error, info, Instrument};

/// Result of a successful reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// ConfigMap key owned by the resource
    pub fragment_key: String,
    /// Number of fragments in the ConfigMap after the change
    pub fragments: usize,
    /// Workload the ConfigMap was synchronized into, unless mounting is disabled
    pub target: Option<TargetWorkload>,
}

impl ReconcileOutcome {
    pub fn describe(&self) -> String {
        match &self.target {
            Some(target) => format!(
                "{} merged into {} fragment(s), mounted into {}",
                self.fragment_key, self.fragments, target
            ),
            None => format!(
                "{} merged into {} fragment(s)",
                self.fragment_key, self.fragments
            ),
        }
    }
}

/// Phase reached by a single reconciliation
#[derive(Debug)]
struct Progress {
    resource: String,
    phase: ReconcilePhase,
}

impl Progress {
    fn new(resource: String) -> Self {
        debug!("{}: {}", resource, ReconcilePhase::Observed);
        Self {
            resource,
            phase: ReconcilePhase::Observed,
        }
    }

    fn advance(&mut self, phase: ReconcilePhase) {
        debug!("{}: {} -> {}", self.resource, self.phase, phase);
        self.phase = phase;
    }
}

impl Reconciler {
    /// Handle one event; the caller decides whether and when to retry
    pub async fn reconcile(&self, event: RuleEvent) -> Result<ReconcileOutcome, ReconcilerError> {
        let rule = event.rule();
        let span = tracing::info_span!(
            "reconcile",
            resource.kind = "LokiRule",
            resource.namespace = rule.namespace_or_default(),
            resource.name = rule.name_or_unknown(),
            event = event.kind(),
        );

        async {
            let start = Instant::now();
            let resource = format!("{}/{}", rule.namespace_or_default(), rule.name_or_unknown());
            info!("Reconciling LokiRule {} ({})", resource, event.kind());
            metrics::increment_reconciliations(event.kind());

            let mut progress = Progress::new(resource);
            let result = match &event {
                RuleEvent::Created(rule) | RuleEvent::Updated(rule) => {
                    self.handle_applied(rule, &mut progress).await
                }
                RuleEvent::Deleted(rule) => self.handle_deleted(rule, &mut progress).await,
            };
            metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());

            match &result {
                Ok(outcome) => {
                    progress.advance(ReconcilePhase::Synced);
                    info!("LokiRule {} reconciled: {}", progress.resource, outcome.describe());
                }
                Err(e) => {
                    let reached = progress.phase;
                    progress.advance(ReconcilePhase::Failed);
                    error!(
                        "LokiRule {} failed after phase {}: {}",
                        progress.resource, reached, e
                    );
                    metrics::increment_reconciliation_errors(e.reason());
                }
            }

            if !matches!(event, RuleEvent::Deleted(_)) {
                update_status(self, rule, &result).await;
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn handle_applied(
        &self,
        rule: &LokiRule,
        progress: &mut Progress,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        let fragment = self.compiler.compile(rule).await?;
        progress.advance(ReconcilePhase::Compiled);

        self.aggregator.ensure_exists(&management_labels()).await?;
        let config_map = self
            .aggregator
            .merge(
                &BTreeMap::from([(fragment.key.clone(), fragment.content)]),
                &progress.resource,
            )
            .await?;
        progress.advance(ReconcilePhase::Merged);

        let target = self.mount(&config_map).await?;
        Ok(ReconcileOutcome {
            fragment_key: fragment.key,
            fragments: fragment_count(&config_map),
            target,
        })
    }

    async fn handle_deleted(
        &self,
        rule: &LokiRule,
        progress: &mut Progress,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        let key = fragment_key(rule.namespace_or_default(), rule.name_or_unknown());

        self.aggregator.ensure_exists(&management_labels()).await?;
        let config_map = self
            .aggregator
            .remove(&BTreeSet::from([key.clone()]), &progress.resource)
            .await?;
        progress.advance(ReconcilePhase::Merged);

        // The ConfigMap stays mounted even when empty; only its checksum changes
        let target = self.mount(&config_map).await?;
        Ok(ReconcileOutcome {
            fragment_key: key,
            fragments: fragment_count(&config_map),
            target,
        })
    }

    async fn mount(&self, config_map: &ConfigMap) -> Result<Option<TargetWorkload>, ReconcilerError> {
        metrics::set_fragments(fragment_count(config_map));
        if self.only_reconcile_rules {
            debug!("Only reconciling rules, leaving the Loki workload untouched");
            return Ok(None);
        }

        let target = self.resolver.resolve().await?;
        self.synchronizer
            .sync(&target, config_map, &self.mount_path)
            .await?;
        Ok(Some(target))
    }

    /// Unmount the aggregated ConfigMap from the target workload
    ///
    /// Returns the target and whether anything was removed.
    pub async fn teardown(&self) -> Result<(TargetWorkload, bool), ReconcilerError> {
        let target = self.resolver.resolve().await?;
        let removed = self
            .synchronizer
            .unsync(&target, self.aggregator.name())
            .await?
            .is_some();
        if removed {
            info!("Removed {} from {}", self.aggregator.name(), target);
        } else {
            info!("{} is not mounted in {}", self.aggregator.name(), target);
        }
        Ok((target, removed))
    }
}
