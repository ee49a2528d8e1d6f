//! # Watch Loop
//!
//! Runs the kube-runtime `Controller` over every LokiRule in the cluster.
//!
//! A finalizer is placed on each LokiRule so that its removal is observed
//! while the object still exists: `Apply` becomes a Created or Updated event,
//! `Cleanup` becomes a Deleted event.

use crate::constants::LOKI_RULE_FINALIZER;
use crate::controller::reconciler::{Reconciler, ReconcilerError, RuleEvent};
use crate::crd::LokiRule;
use crate::runtime::error_policy::{handle_reconciliation_error, reset_backoff, resource_key};
use crate::server::ServerState;
use futures::StreamExt;
use kube::{Api, Client};
use kube_runtime::controller::{self, Action};
use kube_runtime::finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent};
use kube_runtime::{watcher, Controller};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared state handed to every reconciliation by the controller
pub struct ControllerContext {
    pub client: Client,
    pub reconciler: Reconciler,
}

impl std::fmt::Debug for ControllerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerContext")
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

async fn handle_finalizer_event(
    reconciler: &Reconciler,
    event: FinalizerEvent<LokiRule>,
) -> Result<Action, ReconcilerError> {
    match event {
        FinalizerEvent::Apply(rule) => {
            reconciler.reconcile(RuleEvent::applied(rule)).await?;
        }
        FinalizerEvent::Cleanup(rule) => {
            // A failed cleanup must not keep the LokiRule from being deleted
            if let Err(e) = reconciler.reconcile(RuleEvent::Deleted(Arc::clone(&rule))).await {
                warn!(
                    "LokiRule {}/{} deleted but its removal was not fully applied: {}",
                    rule.namespace_or_default(),
                    rule.name_or_unknown(),
                    e
                );
            }
        }
    }
    Ok(Action::await_change())
}

/// Reconcile one LokiRule through its finalizer
pub async fn reconcile_rule(
    rule: Arc<LokiRule>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcilerError> {
    let key = resource_key(&rule);
    let api: Api<LokiRule> = Api::namespaced(ctx.client.clone(), rule.namespace_or_default());
    let reconciler = &ctx.reconciler;

    let action = finalizer(&api, LOKI_RULE_FINALIZER, rule, |event| {
        handle_finalizer_event(reconciler, event)
    })
    .await
    .map_err(|e| match e {
        FinalizerError::ApplyFailed(inner) | FinalizerError::CleanupFailed(inner) => inner,
        other => ReconcilerError::Finalizer(Box::new(other)),
    })?;

    reset_backoff(reconciler, &key);
    Ok(action)
}

/// Run the controller until a shutdown signal is received or `shutdown` resolves
pub async fn run_watch_loop(
    rules: Api<LokiRule>,
    ctx: Arc<ControllerContext>,
    server_state: Arc<ServerState>,
    max_concurrent_reconciliations: u16,
    shutdown: impl Future<Output = ()> + Send + Sync + 'static,
) -> anyhow::Result<()> {
    info!(
        "Starting controller watch loop (max {} concurrent reconciliations)...",
        max_concurrent_reconciliations
    );
    server_state.mark_ready();

    Controller::new(rules, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(max_concurrent_reconciliations))
        .shutdown_on_signal()
        .graceful_shutdown_on(shutdown)
        .run(reconcile_rule, handle_reconciliation_error, ctx)
        .for_each(|result| {
            match result {
                Ok((object, _action)) => debug!("Reconciled {}", object),
                Err(e) => warn!("Controller stream error: {}", e),
            }
            futures::future::ready(())
        })
        .await;

    server_state.is_ready.store(false, Ordering::Relaxed);
    info!("Controller stopped");
    Ok(())
}
