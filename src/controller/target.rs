//! # Target Resolver
//!
//! Finds the single Loki StatefulSet matching the configured label selector.
//!
//! The result is cached process-wide in a [`TargetCache`]. Only the identity
//! of the workload is cached; the mount synchronizer always fetches the live
//! object before writing to it. The cache is never invalidated automatically:
//! if the target is replaced, call [`TargetCache::clear`] (or restart).

use crate::config::LabelSelector;
use crate::controller::reconciler::ReconcilerError;
use crate::store::ClusterStore;
use k8s_openapi::api::apps::v1::StatefulSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Identity of the StatefulSet the aggregated ConfigMap is mounted into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetWorkload {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
}

impl TargetWorkload {
    fn from_stateful_set(stateful_set: &StatefulSet, namespace: &str) -> Self {
        Self {
            namespace: stateful_set
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| namespace.to_string()),
            name: stateful_set.metadata.name.clone().unwrap_or_default(),
            uid: stateful_set.metadata.uid.clone(),
        }
    }
}

impl std::fmt::Display for TargetWorkload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Single-slot cache shared by every reconciliation
#[derive(Debug, Default)]
pub struct TargetCache {
    slot: RwLock<Option<TargetWorkload>>,
}

impl TargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<TargetWorkload> {
        self.slot.read().await.clone()
    }

    pub async fn clear(&self) {
        if self.slot.write().await.take().is_some() {
            info!("Cleared cached target workload");
        }
    }

    /// Return the cached value, or run `init` once and cache its success
    ///
    /// The write lock is held while `init` runs, so concurrent first callers
    /// wait for a single initialization instead of racing.
    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> Result<TargetWorkload, ReconcilerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TargetWorkload, ReconcilerError>>,
    {
        if let Some(target) = self.get().await {
            return Ok(target);
        }

        let mut slot = self.slot.write().await;
        if let Some(target) = slot.as_ref() {
            return Ok(target.clone());
        }

        let target = init().await?;
        *slot = Some(target.clone());
        Ok(target)
    }
}

/// List StatefulSets matching `selector` and require exactly one
pub async fn find_target(
    store: &dyn ClusterStore,
    selector: &LabelSelector,
    namespace: &str,
) -> Result<TargetWorkload, ReconcilerError> {
    let mut matches = store.list_stateful_sets(namespace, selector).await?;
    match matches.len() {
        0 => Err(ReconcilerError::TargetNotFound {
            selector: selector.to_string(),
            namespace: namespace.to_string(),
        }),
        1 => {
            let stateful_set = matches.remove(0);
            Ok(TargetWorkload::from_stateful_set(&stateful_set, namespace))
        }
        count => Err(ReconcilerError::TargetAmbiguous {
            selector: selector.to_string(),
            namespace: namespace.to_string(),
            count,
        }),
    }
}

pub struct TargetResolver {
    store: Arc<dyn ClusterStore>,
    selector: LabelSelector,
    namespace: String,
    cache: Arc<TargetCache>,
}

impl std::fmt::Debug for TargetResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetResolver")
            .field("selector", &self.selector.to_string())
            .field("namespace", &self.namespace)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl TargetResolver {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        selector: LabelSelector,
        namespace: &str,
        cache: Arc<TargetCache>,
    ) -> Self {
        Self {
            store,
            selector,
            namespace: namespace.to_string(),
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<TargetCache> {
        &self.cache
    }

    /// Resolve the target, listing only when nothing is cached yet
    ///
    /// Failures are not cached; the next call lists again.
    pub async fn resolve(&self) -> Result<TargetWorkload, ReconcilerError> {
        self.cache
            .get_or_try_init(|| async {
                let target = find_target(self.store.as_ref(), &self.selector, &self.namespace).await?;
                info!(
                    "Resolved Loki target {} with selector '{}'",
                    target, self.selector
                );
                Ok(target)
            })
            .await
            .inspect(|target| debug!("Using Loki target {}", target))
    }
}
