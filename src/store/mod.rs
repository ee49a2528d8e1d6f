//! # Object Store
//!
//! Narrow facade over the Kubernetes API used by the reconciliation engine.
//!
//! The engine never talks to `kube::Api` directly; it goes through the
//! `ClusterStore` trait so the same code runs against the API server
//! (`KubeStore`) and against an in-memory cluster in tests (`InMemoryStore`).

pub mod kube;
pub mod memory;

pub use self::kube::KubeStore;
pub use self::memory::{InMemoryStore, InjectedFailure};

use crate::config::LabelSelector;
use crate::crd::LokiRuleStatus;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::ConfigMap;
use thiserror::Error;

/// Errors returned by store operations
///
/// Everything except `NotFound` and `AlreadyExists` is transient from the
/// engine's point of view: the request may succeed when the event is
/// redelivered.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("conflict writing {kind} {namespace}/{name}: {message}")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
        message: String,
    },
    #[error("request to the API server timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),
    #[error("object is missing metadata.name")]
    UnnamedObject,
    #[error("failed to encode or decode object: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("API request failed: {0}")]
    Api(#[from] ::kube::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Operations the engine needs from the cluster
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError>;

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError>;

    /// Full update; fails with `Conflict` when the resourceVersion is stale
    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError>;

    /// List StatefulSets in a namespace using server-side label filtering
    async fn list_stateful_sets(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<StatefulSet>, StoreError>;

    async fn get_stateful_set(&self, namespace: &str, name: &str)
        -> Result<StatefulSet, StoreError>;

    /// Apply a JSON merge patch (RFC 7386) to a StatefulSet
    ///
    /// A `metadata.resourceVersion` in the patch acts as a precondition and a
    /// stale one fails with `Conflict`.
    async fn patch_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<StatefulSet, StoreError>;

    /// Full update; fails with `Conflict` when the resourceVersion is stale
    async fn replace_stateful_set(
        &self,
        stateful_set: &StatefulSet,
    ) -> Result<StatefulSet, StoreError>;

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, StoreError>;

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, StoreError>;

    /// Full update; fails with `Conflict` when the resourceVersion is stale
    async fn replace_lease(&self, lease: &Lease) -> Result<Lease, StoreError>;

    async fn patch_rule_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LokiRuleStatus,
    ) -> Result<(), StoreError>;
}
