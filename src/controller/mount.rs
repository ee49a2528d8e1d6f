//! # Mount Synchronizer
//!
//! Keeps the aggregated ConfigMap mounted into the Loki StatefulSet.
//!
//! Three things are managed on the pod template:
//!
//! - a ConfigMap volume named `<configMap>-volume`
//! - a volume mount of that volume in the Loki container
//! - the `checksum/config-<configMap>` annotation carrying a SHA-256 of the
//!   ConfigMap data, so any content change rolls the pods
//!
//! `sync` only ever adds (volume and mount are appended when neither exists,
//! the annotation is always refreshed) and writes with a JSON merge patch.
//! A patch that carries the volume and container lists is pinned to the
//! fetched `resourceVersion`, so a concurrent edit surfaces as a conflict.
//! `unsync` removes all three and writes the whole object back.

use crate::constants::{CHECKSUM_ANNOTATION_PREFIX, VOLUME_NAME_SUFFIX};
use crate::controller::reconciler::ReconcilerError;
use crate::controller::target::TargetWorkload;
use crate::store::ClusterStore;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, PodSpec, Volume, VolumeMount,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Volume and mount path binding the ConfigMap into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountBinding {
    pub volume_name: String,
    pub mount_path: String,
}

impl MountBinding {
    pub fn for_config_map(config_map_name: &str, mount_path: &str) -> Self {
        Self {
            volume_name: volume_name(config_map_name),
            mount_path: mount_path.to_string(),
        }
    }

    fn volume(&self, config_map_name: &str) -> Volume {
        Volume {
            name: self.volume_name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map_name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn volume_mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.volume_name.clone(),
            mount_path: self.mount_path.clone(),
            ..Default::default()
        }
    }
}

pub fn volume_name(config_map_name: &str) -> String {
    format!("{config_map_name}{VOLUME_NAME_SUFFIX}")
}

pub fn checksum_annotation_key(config_map_name: &str) -> String {
    format!("{CHECKSUM_ANNOTATION_PREFIX}{config_map_name}")
}

/// Lowercase hex SHA-256 of the ConfigMap data
///
/// Data is serialized as JSON with keys in sorted order; a ConfigMap without
/// data hashes like an empty one (`{}`, not `null`).
pub fn content_hash(config_map: &ConfigMap) -> Result<String, ReconcilerError> {
    let empty = BTreeMap::new();
    let data = config_map.data.as_ref().unwrap_or(&empty);
    let bytes = serde_json::to_vec(data)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn has_volume(pod_spec: &PodSpec, name: &str) -> bool {
    pod_spec
        .volumes
        .as_ref()
        .is_some_and(|volumes| volumes.iter().any(|v| v.name == name))
}

fn has_mount(container: &Container, name: &str) -> bool {
    container
        .volume_mounts
        .as_ref()
        .is_some_and(|mounts| mounts.iter().any(|m| m.name == name))
}

fn pod_spec<'a>(
    stateful_set: &'a StatefulSet,
    target: &TargetWorkload,
) -> Result<&'a PodSpec, ReconcilerError> {
    stateful_set
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .ok_or_else(|| ReconcilerError::InvalidTarget {
            namespace: target.namespace.clone(),
            name: target.name.clone(),
            reason: "pod template has no spec".to_string(),
        })
}

pub struct MountSynchronizer {
    store: Arc<dyn ClusterStore>,
    container: Option<String>,
}

impl std::fmt::Debug for MountSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountSynchronizer")
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}

impl MountSynchronizer {
    /// `container` names the Loki container; the first container is used when unset
    pub fn new(store: Arc<dyn ClusterStore>, container: Option<String>) -> Self {
        Self { store, container }
    }

    fn container_index(
        &self,
        pod_spec: &PodSpec,
        target: &TargetWorkload,
    ) -> Result<usize, ReconcilerError> {
        let found = match &self.container {
            Some(name) => pod_spec.containers.iter().position(|c| &c.name == name),
            None if pod_spec.containers.is_empty() => None,
            None => Some(0),
        };
        found.ok_or_else(|| ReconcilerError::InvalidTarget {
            namespace: target.namespace.clone(),
            name: target.name.clone(),
            reason: match &self.container {
                Some(name) => format!("container '{name}' not found"),
                None => "pod template has no containers".to_string(),
            },
        })
    }

    /// Mount `config_map` into the target and refresh its checksum annotation
    pub async fn sync(
        &self,
        target: &TargetWorkload,
        config_map: &ConfigMap,
        mount_path: &str,
    ) -> Result<StatefulSet, ReconcilerError> {
        let config_map_name = config_map.metadata.name.clone().unwrap_or_default();
        let binding = MountBinding::for_config_map(&config_map_name, mount_path);
        let hash = content_hash(config_map)?;

        let stateful_set = self
            .store
            .get_stateful_set(&target.namespace, &target.name)
            .await?;
        let pod_spec = pod_spec(&stateful_set, target)?;
        let index = self.container_index(pod_spec, target)?;

        let volume_present = has_volume(pod_spec, &binding.volume_name);
        let mount_present = has_mount(&pod_spec.containers[index], &binding.volume_name);

        let mut template_spec = serde_json::Map::new();
        match (volume_present, mount_present) {
            (false, false) => {
                let mut volumes = pod_spec.volumes.clone().unwrap_or_default();
                volumes.push(binding.volume(&config_map_name));

                let mut containers = pod_spec.containers.clone();
                containers[index]
                    .volume_mounts
                    .get_or_insert_with(Vec::new)
                    .push(binding.volume_mount());

                template_spec.insert("volumes".to_string(), serde_json::to_value(&volumes)?);
                template_spec.insert("containers".to_string(), serde_json::to_value(&containers)?);
                info!(
                    "Mounting volume {} at {} in {}",
                    binding.volume_name, binding.mount_path, target
                );
            }
            (true, true) => {
                debug!("Volume {} already mounted in {}", binding.volume_name, target);
            }
            (volume_present, mount_present) => {
                warn!(
                    "Volume {} on {} is only partially configured (volume: {}, mount: {}), leaving it as is",
                    binding.volume_name, target, volume_present, mount_present
                );
            }
        }

        let annotation_key = checksum_annotation_key(&config_map_name);
        let mut template = json!({
            "metadata": { "annotations": { annotation_key: hash } }
        });
        let template_replaces_lists = !template_spec.is_empty();
        if template_replaces_lists {
            template["spec"] = serde_json::Value::Object(template_spec);
        }
        let mut patch = json!({ "spec": { "template": template } });
        if template_replaces_lists {
            patch["metadata"] = json!({ "resourceVersion": stateful_set.metadata.resource_version });
        }

        let updated = self
            .store
            .patch_stateful_set(&target.namespace, &target.name, &patch)
            .await?;
        info!("Synchronized {} with checksum {}", target, hash);
        Ok(updated)
    }

    /// Remove the ConfigMap volume, its mount and the checksum annotation
    ///
    /// Returns `None` when there was nothing to remove.
    pub async fn unsync(
        &self,
        target: &TargetWorkload,
        config_map_name: &str,
    ) -> Result<Option<StatefulSet>, ReconcilerError> {
        let name = volume_name(config_map_name);
        let mut stateful_set = self
            .store
            .get_stateful_set(&target.namespace, &target.name)
            .await?;
        let pod_spec = pod_spec(&stateful_set, target)?;
        let index = self.container_index(pod_spec, target).ok();

        let volume_present = has_volume(pod_spec, &name);
        let mount_present = index.is_some_and(|i| has_mount(&pod_spec.containers[i], &name));
        if !volume_present && !mount_present {
            debug!("Volume {} not present in {}, nothing to remove", name, target);
            return Ok(None);
        }

        let Some(template) = stateful_set.spec.as_mut().map(|spec| &mut spec.template) else {
            return Ok(None);
        };
        if let Some(pod_spec) = template.spec.as_mut() {
            if let Some(volumes) = pod_spec.volumes.as_mut() {
                volumes.retain(|v| v.name != name);
            }
            if let Some(mounts) = index
                .and_then(|i| pod_spec.containers.get_mut(i))
                .and_then(|c| c.volume_mounts.as_mut())
            {
                mounts.retain(|m| m.name != name);
            }
        }
        if let Some(annotations) = template
            .metadata
            .as_mut()
            .and_then(|meta| meta.annotations.as_mut())
        {
            annotations.remove(&checksum_annotation_key(config_map_name));
        }

        let updated = self.store.replace_stateful_set(&stateful_set).await?;
        info!("Unmounted volume {} from {}", name, target);
        Ok(Some(updated))
    }
}
