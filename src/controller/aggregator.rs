//! # Config Aggregator
//!
//! Maintains the single ConfigMap holding every LokiRule fragment.
//!
//! The aggregator is scoped to one namespace and one ConfigMap name. Reads are
//! never cached: every mutation re-fetches the object and writes it back with
//! the fetched `resourceVersion`, so a concurrent writer surfaces as a conflict
//! instead of a lost update.
//!
//! Fragment keys are `<namespace>-<name>.yaml`, so distinct resources can map
//! to the same key (`a-b/c` and `a/b-c`). The resource that last wrote each
//! key is recorded in the `loki.quero.com/fragment-owners` annotation and a
//! write on behalf of a different resource is logged as a collision.

use crate::constants::{
    COMPONENT_LABEL, COMPONENT_LABEL_VALUE, FRAGMENT_OWNERS_ANNOTATION, MANAGED_BY_LABEL,
    MANAGED_BY_LABEL_VALUE,
};
use crate::controller::reconciler::ReconcilerError;
use crate::store::ClusterStore;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Labels identifying the ConfigMap as owned by this operator
pub fn management_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (COMPONENT_LABEL.to_string(), COMPONENT_LABEL_VALUE.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_LABEL_VALUE.to_string()),
    ])
}

/// Union of two label sets; values from `new` win on key collisions
pub fn merge_labels(
    existing: Option<&BTreeMap<String, String>>,
    new: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = existing.cloned().unwrap_or_default();
    merged.extend(new.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Number of fragments held by a ConfigMap
pub fn fragment_count(config_map: &ConfigMap) -> usize {
    config_map.data.as_ref().map_or(0, BTreeMap::len)
}

/// Fragment key to `<namespace>/<name>` of the resource that last wrote it
///
/// A missing or unreadable annotation yields an empty map.
pub fn fragment_owners(config_map: &ConfigMap) -> BTreeMap<String, String> {
    config_map
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(FRAGMENT_OWNERS_ANNOTATION))
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

fn set_fragment_owners(
    config_map: &mut ConfigMap,
    owners: &BTreeMap<String, String>,
) -> Result<(), ReconcilerError> {
    if owners.is_empty() {
        if let Some(annotations) = config_map.metadata.annotations.as_mut() {
            annotations.remove(FRAGMENT_OWNERS_ANNOTATION);
        }
        return Ok(());
    }
    config_map
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            FRAGMENT_OWNERS_ANNOTATION.to_string(),
            serde_json::to_string(owners)?,
        );
    Ok(())
}

pub struct ConfigAggregator {
    store: Arc<dyn ClusterStore>,
    namespace: String,
    name: String,
}

impl std::fmt::Debug for ConfigAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigAggregator")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ConfigAggregator {
    pub fn new(store: Arc<dyn ClusterStore>, namespace: &str, name: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Return the ConfigMap, creating it empty with `labels` when absent
    ///
    /// An existing ConfigMap missing any of `labels` gets them merged in.
    pub async fn ensure_exists(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<ConfigMap, ReconcilerError> {
        match self.store.get_config_map(&self.namespace, &self.name).await {
            Ok(existing) => self.reconcile_labels(existing, labels).await,
            Err(e) if e.is_not_found() => self.create(labels).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, labels: &BTreeMap<String, String>) -> Result<ConfigMap, ReconcilerError> {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            ..Default::default()
        };

        match self.store.create_config_map(&config_map).await {
            Ok(created) => {
                info!("Created ConfigMap {}/{}", self.namespace, self.name);
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                debug!(
                    "ConfigMap {}/{} was created concurrently, re-reading",
                    self.namespace, self.name
                );
                let existing = self.store.get_config_map(&self.namespace, &self.name).await?;
                self.reconcile_labels(existing, labels).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reconcile_labels(
        &self,
        mut existing: ConfigMap,
        labels: &BTreeMap<String, String>,
    ) -> Result<ConfigMap, ReconcilerError> {
        let merged = merge_labels(existing.metadata.labels.as_ref(), labels);
        if existing.metadata.labels.as_ref() == Some(&merged) {
            return Ok(existing);
        }

        info!("Restoring labels on ConfigMap {}/{}", self.namespace, self.name);
        existing.metadata.labels = Some(merged);
        Ok(self.store.replace_config_map(&existing).await?)
    }

    /// Upsert every fragment on behalf of `owner`, leaving unrelated keys untouched
    pub async fn merge(
        &self,
        fragments: &BTreeMap<String, String>,
        owner: &str,
    ) -> Result<ConfigMap, ReconcilerError> {
        let mut config_map = self.store.get_config_map(&self.namespace, &self.name).await?;
        let mut owners = fragment_owners(&config_map);
        let data = config_map.data.get_or_insert_with(BTreeMap::new);

        let mut changed = false;
        for (key, content) in fragments {
            match owners.get(key) {
                Some(previous) if previous != owner => {
                    warn!(
                        "Fragment {} in ConfigMap {}/{} belonged to {} and is overwritten by {}",
                        key, self.namespace, self.name, previous, owner
                    );
                    changed = true;
                }
                None => changed = true,
                Some(_) => {}
            }
            changed |= data.get(key) != Some(content);
        }
        if !changed {
            debug!("ConfigMap {}/{} already up to date", self.namespace, self.name);
            return Ok(config_map);
        }

        data.extend(fragments.iter().map(|(k, v)| (k.clone(), v.clone())));
        owners.extend(fragments.keys().map(|k| (k.clone(), owner.to_string())));
        set_fragment_owners(&mut config_map, &owners)?;
        let updated = self.store.replace_config_map(&config_map).await?;
        info!(
            "Merged {} fragment(s) into ConfigMap {}/{}",
            fragments.len(),
            self.namespace,
            self.name
        );
        Ok(updated)
    }

    /// Delete the given keys on behalf of `owner`; keys that are not present are ignored
    pub async fn remove(
        &self,
        keys: &BTreeSet<String>,
        owner: &str,
    ) -> Result<ConfigMap, ReconcilerError> {
        let mut config_map = self.store.get_config_map(&self.namespace, &self.name).await?;
        let mut owners = fragment_owners(&config_map);

        let mut removed = 0;
        if let Some(data) = config_map.data.as_mut() {
            for key in keys {
                if data.remove(key).is_none() {
                    continue;
                }
                removed += 1;
                if let Some(previous) = owners.remove(key).filter(|previous| previous != owner) {
                    warn!(
                        "Fragment {} in ConfigMap {}/{} belonged to {} and is removed by {}",
                        key, self.namespace, self.name, previous, owner
                    );
                }
            }
        }
        if removed == 0 {
            debug!(
                "None of {:?} present in ConfigMap {}/{}",
                keys, self.namespace, self.name
            );
            return Ok(config_map);
        }

        set_fragment_owners(&mut config_map, &owners)?;
        let updated = self.store.replace_config_map(&config_map).await?;
        info!(
            "Removed {} fragment(s) from ConfigMap {}/{}",
            removed, self.namespace, self.name
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, InjectedFailure};

    fn aggregator(store: &Arc<InMemoryStore>) -> ConfigAggregator {
        let store: Arc<dyn ClusterStore> = Arc::<InMemoryStore>::clone(store);
        ConfigAggregator::new(store, "loki", "loki-rule-cfg")
    }

    fn fragments(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_merge_labels_new_wins() {
        let existing = fragments(&[("a", "1"), ("b", "2")]);
        let new = fragments(&[("b", "3"), ("c", "4")]);
        let merged = merge_labels(Some(&existing), &new);
        assert_eq!(merged, fragments(&[("a", "1"), ("b", "3"), ("c", "4")]));
        assert_eq!(merge_labels(None, &new), new);
    }

    #[tokio::test]
    async fn test_ensure_exists_creates_empty_config_map() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(&store);

        let created = aggregator.ensure_exists(&management_labels()).await.unwrap();
        assert_eq!(fragment_count(&created), 0);
        assert_eq!(created.metadata.labels, Some(management_labels()));

        // A second call finds the existing object and does not recreate it
        let again = aggregator.ensure_exists(&management_labels()).await.unwrap();
        assert_eq!(again.metadata.resource_version, created.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_ensure_exists_restores_missing_labels() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(&store);
        let mut existing = aggregator
            .ensure_exists(&fragments(&[("team", "observability")]))
            .await
            .unwrap();
        existing.data = Some(fragments(&[("keep.yaml", "groups: []\n")]));
        store.replace_config_map(&existing).await.unwrap();

        let updated = aggregator.ensure_exists(&management_labels()).await.unwrap();
        let labels = updated.metadata.labels.clone().unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("observability"));
        assert_eq!(
            labels.get(MANAGED_BY_LABEL).map(String::as_str),
            Some(MANAGED_BY_LABEL_VALUE)
        );
        assert_eq!(fragment_count(&updated), 1);
    }

    #[tokio::test]
    async fn test_merge_then_remove_is_inverse() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(&store);
        aggregator.ensure_exists(&management_labels()).await.unwrap();
        let before = aggregator
            .merge(&fragments(&[("other.yaml", "groups: []\n")]), "default/other")
            .await
            .unwrap();

        aggregator
            .merge(&fragments(&[("default-r1.yaml", "groups: []\n")]), "default/r1")
            .await
            .unwrap();
        let after = aggregator
            .remove(&BTreeSet::from(["default-r1.yaml".to_string()]), "default/r1")
            .await
            .unwrap();

        assert_eq!(after.data, before.data);
    }

    #[tokio::test]
    async fn test_remove_absent_key_does_not_write() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(&store);
        let created = aggregator.ensure_exists(&management_labels()).await.unwrap();

        let after = aggregator
            .remove(&BTreeSet::from(["missing.yaml".to_string()]), "default/r1")
            .await
            .unwrap();
        assert_eq!(after.metadata.resource_version, created.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_merge_without_config_map_fails() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(&store);
        let err = aggregator
            .merge(&fragments(&[("a.yaml", "x")]), "default/r1")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_merge_conflict_is_surfaced() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(&store);
        aggregator.ensure_exists(&management_labels()).await.unwrap();
        store.fail_next("replace_config_map", InjectedFailure::Conflict);

        let err = aggregator
            .merge(&fragments(&[("a.yaml", "x")]), "default/r1")
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "Conflict");
    }

    #[tokio::test]
    async fn test_ensure_exists_rereads_after_losing_create_race() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(&store);

        // Another writer created the ConfigMap between our read and our create
        let mut theirs = ConfigMap::default();
        theirs.metadata.name = Some("loki-rule-cfg".to_string());
        theirs.metadata.namespace = Some("loki".to_string());
        theirs.metadata.labels = Some(fragments(&[("team", "observability")]));
        theirs.data = Some(fragments(&[("other.yaml", "groups: []\n")]));
        store.create_config_map(&theirs).await.unwrap();
        store.fail_next("get_config_map", InjectedFailure::NotFound);

        let existing = aggregator.ensure_exists(&management_labels()).await.unwrap();
        assert_eq!(fragment_count(&existing), 1);
        let labels = existing.metadata.labels.unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("observability"));
        assert_eq!(
            labels.get(COMPONENT_LABEL).map(String::as_str),
            Some(COMPONENT_LABEL_VALUE)
        );
        assert_eq!(
            store.config_map("loki", "loki-rule-cfg").unwrap().metadata.labels,
            Some(labels)
        );
    }

    #[tokio::test]
    async fn test_merge_records_owner_and_skips_unchanged_write() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(&store);
        aggregator.ensure_exists(&management_labels()).await.unwrap();

        let first = aggregator
            .merge(&fragments(&[("default-r1.yaml", "x")]), "default/r1")
            .await
            .unwrap();
        assert_eq!(
            fragment_owners(&first),
            fragments(&[("default-r1.yaml", "default/r1")])
        );

        let second = aggregator
            .merge(&fragments(&[("default-r1.yaml", "x")]), "default/r1")
            .await
            .unwrap();
        assert_eq!(second.metadata.resource_version, first.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_colliding_fragment_keys_track_latest_owner() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = aggregator(&store);
        aggregator.ensure_exists(&management_labels()).await.unwrap();

        aggregator
            .merge(&fragments(&[("a-b-c.yaml", "x")]), "a-b/c")
            .await
            .unwrap();
        // Same content from another resource still rewrites the owner
        let taken = aggregator
            .merge(&fragments(&[("a-b-c.yaml", "x")]), "a/b-c")
            .await
            .unwrap();
        assert_eq!(
            fragment_owners(&taken).get("a-b-c.yaml").map(String::as_str),
            Some("a/b-c")
        );

        let removed = aggregator
            .remove(&BTreeSet::from(["a-b-c.yaml".to_string()]), "a-b/c")
            .await
            .unwrap();
        assert_eq!(fragment_count(&removed), 0);
        assert!(fragment_owners(&removed).is_empty());
        assert!(!removed
            .metadata
            .annotations
            .unwrap_or_default()
            .contains_key(FRAGMENT_OWNERS_ANNOTATION));
    }
}
