//! # Runtime
//!
//! Entry points for the two operating modes.
//!
//! - `run`: watch LokiRules and keep the Loki StatefulSet synchronized,
//!   optionally only while holding the leader election Lease
//! - `teardown`: unmount the aggregated ConfigMap from the Loki StatefulSet

pub mod error_policy;
pub mod initialization;
pub mod leader;
pub mod watch_loop;

use crate::config::OperatorSettings;
use crate::store::{ClusterStore, KubeStore};
use anyhow::{Context, Result};
use kube::Client;
use std::sync::Arc;
use tracing::info;

pub async fn run(settings: &OperatorSettings) -> Result<()> {
    let init = initialization::initialize(settings).await?;
    match &settings.leader_election {
        Some(election) => {
            let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(
                init.context.client.clone(),
                settings.request_timeout,
            ));
            leader::run_elected(
                election,
                store,
                init,
                settings.max_concurrent_reconciliations,
            )
            .await
        }
        None => {
            watch_loop::run_watch_loop(
                init.rules,
                init.context,
                init.server_state,
                settings.max_concurrent_reconciliations,
                futures::future::pending(),
            )
            .await
        }
    }
}

pub async fn teardown(settings: &OperatorSettings) -> Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let reconciler = initialization::build_reconciler(client, settings)?;

    let (target, removed) = reconciler
        .teardown()
        .await
        .context("Failed to unmount rules ConfigMap")?;
    if removed {
        info!("Teardown complete for {}", target);
    } else {
        info!("Nothing to tear down in {}", target);
    }
    Ok(())
}
