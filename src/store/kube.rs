//! # Kubernetes-backed Store
//!
//! `ClusterStore` implementation on top of `kube::Api`. Every request is
//! bounded by the configured timeout and API errors are classified into
//! `StoreError` variants.

use super::{ClusterStore, StoreError};
use crate::config::LabelSelector;
use crate::constants::FIELD_MANAGER;
use crate::crd::{LokiRule, LokiRuleStatus};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    timeout: Duration,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl KubeStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn bounded<T>(
        &self,
        request: impl Future<Output = Result<T, kube::Error>>,
    ) -> Result<T, StoreError> {
        Ok(tokio::time::timeout(self.timeout, request).await??)
    }
}

/// Map API status codes onto store errors so callers can branch on them
fn classify(
    error: StoreError,
    kind: &'static str,
    namespace: &str,
    name: &str,
    creating: bool,
) -> StoreError {
    match error {
        StoreError::Api(kube::Error::Api(response)) if response.code == 404 => {
            StoreError::NotFound {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        StoreError::Api(kube::Error::Api(response)) if response.code == 409 && creating => {
            StoreError::AlreadyExists {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        StoreError::Api(kube::Error::Api(response)) if response.code == 409 => {
            StoreError::Conflict {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: response.message.clone(),
            }
        }
        other => other,
    }
}

fn object_ref(meta: &ObjectMeta) -> Result<(String, String), StoreError> {
    let name = meta.name.clone().ok_or(StoreError::UnnamedObject)?;
    let namespace = meta.namespace.clone().unwrap_or_else(|| "default".to_string());
    Ok((namespace, name))
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(api.get(name))
            .await
            .map_err(|e| classify(e, "ConfigMap", namespace, name, false))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let (namespace, name) = object_ref(&config_map.metadata)?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        debug!("Creating ConfigMap {}/{}", namespace, name);
        self.bounded(api.create(&PostParams::default(), config_map))
            .await
            .map_err(|e| classify(e, "ConfigMap", &namespace, &name, true))
    }

    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let (namespace, name) = object_ref(&config_map.metadata)?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        debug!("Updating ConfigMap {}/{}", namespace, name);
        self.bounded(api.replace(&name, &PostParams::default(), config_map))
            .await
            .map_err(|e| classify(e, "ConfigMap", &namespace, &name, false))
    }

    async fn list_stateful_sets(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<StatefulSet>, StoreError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels_from(selector.selector());
        let list = self.bounded(api.list(&params)).await?;
        Ok(list.items)
    }

    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<StatefulSet, StoreError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(api.get(name))
            .await
            .map_err(|e| classify(e, "StatefulSet", namespace, name, false))
    }

    async fn patch_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<StatefulSet, StoreError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(api.patch(name, &PatchParams::default(), &Patch::Merge(patch)))
            .await
            .map_err(|e| classify(e, "StatefulSet", namespace, name, false))
    }

    async fn replace_stateful_set(
        &self,
        stateful_set: &StatefulSet,
    ) -> Result<StatefulSet, StoreError> {
        let (namespace, name) = object_ref(&stateful_set.metadata)?;
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
        self.bounded(api.replace(&name, &PostParams::default(), stateful_set))
            .await
            .map_err(|e| classify(e, "StatefulSet", &namespace, &name, false))
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, StoreError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(api.get(name))
            .await
            .map_err(|e| classify(e, "Lease", namespace, name, false))
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, StoreError> {
        let (namespace, name) = object_ref(&lease.metadata)?;
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &namespace);
        debug!("Creating Lease {}/{}", namespace, name);
        self.bounded(api.create(&PostParams::default(), lease))
            .await
            .map_err(|e| classify(e, "Lease", &namespace, &name, true))
    }

    async fn replace_lease(&self, lease: &Lease) -> Result<Lease, StoreError> {
        let (namespace, name) = object_ref(&lease.metadata)?;
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &namespace);
        self.bounded(api.replace(&name, &PostParams::default(), lease))
            .await
            .map_err(|e| classify(e, "Lease", &namespace, &name, false))
    }

    async fn patch_rule_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LokiRuleStatus,
    ) -> Result<(), StoreError> {
        let api: Api<LokiRule> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        self.bounded(api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        ))
        .await
        .map_err(|e| classify(e, "LokiRule", namespace, name, false))?;
        Ok(())
    }
}
