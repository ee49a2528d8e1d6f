//! # In-Memory Store
//!
//! A `ClusterStore` that keeps objects in process memory. It mimics the API
//! server behaviours the engine relies on: resourceVersion conflicts on
//! stale replaces, AlreadyExists on duplicate creates, label-filtered lists
//! and JSON merge patches (honouring a `metadata.resourceVersion`
//! precondition). Used by the test suites.

use super::{ClusterStore, StoreError};
use crate::config::LabelSelector;
use crate::crd::LokiRuleStatus;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type ObjectKey = (String, String);

/// Error returned by an operation armed with `InMemoryStore::fail_next`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Conflict,
    NotFound,
    AlreadyExists,
}

#[derive(Debug, Default)]
struct State {
    config_maps: BTreeMap<ObjectKey, ConfigMap>,
    stateful_sets: BTreeMap<ObjectKey, StatefulSet>,
    leases: BTreeMap<ObjectKey, Lease>,
    rule_statuses: BTreeMap<ObjectKey, LokiRuleStatus>,
    next_version: u64,
    failing_operations: HashMap<&'static str, InjectedFailure>,
}

impl State {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    /// Fail once if a failure was injected for this operation
    fn check_injected_failure(&mut self, operation: &'static str) -> Result<(), StoreError> {
        let (kind, namespace, name) = ("injected", String::new(), operation.to_string());
        match self.failing_operations.remove(operation) {
            None => Ok(()),
            Some(InjectedFailure::Conflict) => Err(StoreError::Conflict {
                kind,
                namespace,
                name,
                message: "injected failure".to_string(),
            }),
            Some(InjectedFailure::NotFound) => Err(StoreError::NotFound {
                kind,
                namespace,
                name,
            }),
            Some(InjectedFailure::AlreadyExists) => Err(StoreError::AlreadyExists {
                kind,
                namespace,
                name,
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    list_calls: AtomicUsize,
}

fn key_of(meta: &ObjectMeta) -> Result<ObjectKey, StoreError> {
    let name = meta.name.clone().ok_or(StoreError::UnnamedObject)?;
    let namespace = meta.namespace.clone().unwrap_or_else(|| "default".to_string());
    Ok((namespace, name))
}

fn not_found(kind: &'static str, (namespace, name): &ObjectKey) -> StoreError {
    StoreError::NotFound {
        kind,
        namespace: namespace.clone(),
        name: name.clone(),
    }
}

fn check_version(
    kind: &'static str,
    key: &ObjectKey,
    stored: Option<&String>,
    incoming: Option<&String>,
) -> Result<(), StoreError> {
    match incoming {
        Some(incoming) if stored != Some(incoming) => Err(StoreError::Conflict {
            kind,
            namespace: key.0.clone(),
            name: key.1.clone(),
            message: "the object has been modified; please apply your changes to the latest version"
                .to_string(),
        }),
        _ => Ok(()),
    }
}

/// Apply a JSON merge patch (RFC 7386) in place
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_fields) = target {
        for (key, value) in patch_fields {
            if value.is_null() {
                target_fields.remove(key);
            } else {
                apply_merge_patch(
                    target_fields.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test must not poison the store for the assertions that follow
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Seed a StatefulSet, assigning a uid and resourceVersion
    pub fn insert_stateful_set(&self, mut stateful_set: StatefulSet) -> StatefulSet {
        let mut state = self.lock();
        let key = key_of(&stateful_set.metadata).unwrap_or_default();
        stateful_set.metadata.namespace = Some(key.0.clone());
        stateful_set.metadata.resource_version = Some(state.bump_version());
        if stateful_set.metadata.uid.is_none() {
            stateful_set.metadata.uid = Some(format!("uid-{}-{}", key.0, key.1));
        }
        state.stateful_sets.insert(key, stateful_set.clone());
        stateful_set
    }

    pub fn stateful_set(&self, namespace: &str, name: &str) -> Option<StatefulSet> {
        self.lock()
            .stateful_sets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.lock()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn rule_status(&self, namespace: &str, name: &str) -> Option<LokiRuleStatus> {
        self.lock()
            .rule_statuses
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Number of StatefulSet list requests served so far
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        self.lock()
            .leases
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Make the next call of `operation` (a `ClusterStore` method name) fail with `failure`
    pub fn fail_next(&self, operation: &'static str, failure: InjectedFailure) {
        self.lock().failing_operations.insert(operation, failure);
    }
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError> {
        let mut state = self.lock();
        state.check_injected_failure("get_config_map")?;
        let key = (namespace.to_string(), name.to_string());
        state
            .config_maps
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found("ConfigMap", &key))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let mut state = self.lock();
        state.check_injected_failure("create_config_map")?;
        let key = key_of(&config_map.metadata)?;
        if state.config_maps.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: "ConfigMap",
                namespace: key.0,
                name: key.1,
            });
        }
        let mut created = config_map.clone();
        created.metadata.namespace = Some(key.0.clone());
        created.metadata.resource_version = Some(state.bump_version());
        state.config_maps.insert(key, created.clone());
        Ok(created)
    }

    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let mut state = self.lock();
        state.check_injected_failure("replace_config_map")?;
        let key = key_of(&config_map.metadata)?;
        let stored = state
            .config_maps
            .get(&key)
            .ok_or_else(|| not_found("ConfigMap", &key))?;
        check_version(
            "ConfigMap",
            &key,
            stored.metadata.resource_version.as_ref(),
            config_map.metadata.resource_version.as_ref(),
        )?;
        let mut replaced = config_map.clone();
        replaced.metadata.namespace = Some(key.0.clone());
        replaced.metadata.resource_version = Some(state.bump_version());
        state.config_maps.insert(key, replaced.clone());
        Ok(replaced)
    }

    async fn list_stateful_sets(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<StatefulSet>, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        state.check_injected_failure("list_stateful_sets")?;
        Ok(state
            .stateful_sets
            .iter()
            .filter(|((ns, _), sts)| ns == namespace && selector.matches(sts.metadata.labels.as_ref()))
            .map(|(_, sts)| sts.clone())
            .collect())
    }

    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<StatefulSet, StoreError> {
        let mut state = self.lock();
        state.check_injected_failure("get_stateful_set")?;
        let key = (namespace.to_string(), name.to_string());
        state
            .stateful_sets
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found("StatefulSet", &key))
    }

    async fn patch_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<StatefulSet, StoreError> {
        let mut state = self.lock();
        state.check_injected_failure("patch_stateful_set")?;
        let key = (namespace.to_string(), name.to_string());
        let stored = state
            .stateful_sets
            .get(&key)
            .ok_or_else(|| not_found("StatefulSet", &key))?;
        let precondition = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        check_version(
            "StatefulSet",
            &key,
            stored.metadata.resource_version.as_ref(),
            precondition.as_ref(),
        )?;
        let mut document = serde_json::to_value(stored)?;
        apply_merge_patch(&mut document, patch);
        let mut patched: StatefulSet = serde_json::from_value(document)?;
        patched.metadata.resource_version = Some(state.bump_version());
        state.stateful_sets.insert(key, patched.clone());
        Ok(patched)
    }

    async fn replace_stateful_set(
        &self,
        stateful_set: &StatefulSet,
    ) -> Result<StatefulSet, StoreError> {
        let mut state = self.lock();
        state.check_injected_failure("replace_stateful_set")?;
        let key = key_of(&stateful_set.metadata)?;
        let stored = state
            .stateful_sets
            .get(&key)
            .ok_or_else(|| not_found("StatefulSet", &key))?;
        check_version(
            "StatefulSet",
            &key,
            stored.metadata.resource_version.as_ref(),
            stateful_set.metadata.resource_version.as_ref(),
        )?;
        let mut replaced = stateful_set.clone();
        replaced.metadata.resource_version = Some(state.bump_version());
        state.stateful_sets.insert(key, replaced.clone());
        Ok(replaced)
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, StoreError> {
        let mut state = self.lock();
        state.check_injected_failure("get_lease")?;
        let key = (namespace.to_string(), name.to_string());
        state
            .leases
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found("Lease", &key))
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, StoreError> {
        let mut state = self.lock();
        state.check_injected_failure("create_lease")?;
        let key = key_of(&lease.metadata)?;
        if state.leases.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: "Lease",
                namespace: key.0,
                name: key.1,
            });
        }
        let mut created = lease.clone();
        created.metadata.namespace = Some(key.0.clone());
        created.metadata.resource_version = Some(state.bump_version());
        state.leases.insert(key, created.clone());
        Ok(created)
    }

    async fn replace_lease(&self, lease: &Lease) -> Result<Lease, StoreError> {
        let mut state = self.lock();
        state.check_injected_failure("replace_lease")?;
        let key = key_of(&lease.metadata)?;
        let stored = state
            .leases
            .get(&key)
            .ok_or_else(|| not_found("Lease", &key))?;
        check_version(
            "Lease",
            &key,
            stored.metadata.resource_version.as_ref(),
            lease.metadata.resource_version.as_ref(),
        )?;
        let mut replaced = lease.clone();
        replaced.metadata.namespace = Some(key.0.clone());
        replaced.metadata.resource_version = Some(state.bump_version());
        state.leases.insert(key, replaced.clone());
        Ok(replaced)
    }

    async fn patch_rule_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LokiRuleStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.check_injected_failure("patch_rule_status")?;
        state
            .rule_statuses
            .insert((namespace.to_string(), name.to_string()), status.clone());
        Ok(())
    }
}
