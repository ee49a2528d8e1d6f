//! Common test utilities for the integration tests
//!
//! Builds reconcilers on top of the in-memory store and provides fixtures for
//! LokiRules and Loki StatefulSets.

#![allow(dead_code, reason = "Each test binary uses a different subset of the helpers")]

use clap::Parser;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector as K8sLabelSelector, ObjectMeta};
use loki_rule_operator::config::{OperatorConfig, OperatorSettings};
use loki_rule_operator::controller::mount::{checksum_annotation_key, volume_name};
use loki_rule_operator::controller::reconciler::Reconciler;
use loki_rule_operator::controller::target::TargetCache;
use loki_rule_operator::controller::validation::ExpressionValidator;
use loki_rule_operator::crd::{LokiRule, LokiRuleSpec, Rule, RuleGroup};
use loki_rule_operator::store::{ClusterStore, InMemoryStore};
use std::collections::BTreeMap;
use std::sync::{Arc, Once};

pub const LOKI_NAMESPACE: &str = "loki";
pub const CONFIG_MAP: &str = "loki-rule-cfg";
pub const MOUNT_PATH: &str = "/etc/loki/rules";

static RUSTLS_INIT: Once = Once::new();

/// Install the rustls crypto provider once per test binary
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Settings as the binary would parse them, with the test selector and namespace
pub fn settings(extra: &[&str]) -> OperatorSettings {
    let mut args = vec![
        "loki-rule-operator",
        "--loki-label-selector",
        "app=loki",
        "--loki-namespace",
        LOKI_NAMESPACE,
    ];
    args.extend_from_slice(extra);
    OperatorConfig::parse_from(args)
        .validate()
        .expect("test settings must be valid")
}

/// A reconciler over a fresh in-memory store
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub cache: Arc<TargetCache>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(&[], None)
    }

    pub fn with(extra: &[&str], validator: Option<Arc<dyn ExpressionValidator>>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(TargetCache::new());
        let cluster: Arc<dyn ClusterStore> = Arc::<InMemoryStore>::clone(&store);
        let reconciler = Reconciler::new(cluster, &settings(extra), validator, Arc::clone(&cache));
        Self {
            store,
            cache,
            reconciler,
        }
    }

    /// Seed the single Loki StatefulSet with one container named `loki`
    pub fn with_loki(self) -> Self {
        self.store.insert_stateful_set(loki_stateful_set("loki", &["loki"]));
        self
    }

    pub fn data(&self) -> BTreeMap<String, String> {
        self.store
            .config_map(LOKI_NAMESPACE, CONFIG_MAP)
            .and_then(|cm| cm.data)
            .unwrap_or_default()
    }

    pub fn loki(&self) -> StatefulSet {
        self.store
            .stateful_set(LOKI_NAMESPACE, "loki")
            .expect("loki StatefulSet must exist")
    }
}

pub fn loki_stateful_set(name: &str, containers: &[&str]) -> StatefulSet {
    let labels = BTreeMap::from([("app".to_string(), "loki".to_string())]);
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(LOKI_NAMESPACE.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            selector: K8sLabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: containers
                        .iter()
                        .map(|name| Container {
                            name: name.to_string(),
                            image: Some("grafana/loki:3.0.0".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_spec_mut(stateful_set: &mut StatefulSet) -> &mut PodSpec {
    stateful_set
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .expect("pod template must have a spec")
}

/// Declare the rules volume on the pod template without mounting it
pub fn add_rules_volume(stateful_set: &mut StatefulSet) {
    pod_spec_mut(stateful_set)
        .volumes
        .get_or_insert_with(Vec::new)
        .push(Volume {
            name: volume_name(CONFIG_MAP),
            config_map: Some(ConfigMapVolumeSource {
                name: CONFIG_MAP.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
}

/// Mount the rules volume in `container` at `path` without declaring the volume
pub fn add_rules_mount(stateful_set: &mut StatefulSet, container: &str, path: &str) {
    let pod_spec = pod_spec_mut(stateful_set);
    let container = pod_spec
        .containers
        .iter_mut()
        .find(|c| c.name == container)
        .expect("container must exist");
    container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(VolumeMount {
            name: volume_name(CONFIG_MAP),
            mount_path: path.to_string(),
            ..Default::default()
        });
}

pub fn record_group(name: &str, rules: &[(&str, &str)]) -> RuleGroup {
    RuleGroup {
        name: name.to_string(),
        rules: rules
            .iter()
            .map(|(record, expr)| Rule {
                record: Some(record.to_string()),
                expr: expr.to_string(),
                ..Rule::default()
            })
            .collect(),
        ..RuleGroup::default()
    }
}

pub fn rule(namespace: &str, name: &str, groups: Vec<RuleGroup>) -> Arc<LokiRule> {
    let mut rule = LokiRule::new(name, LokiRuleSpec { groups });
    rule.metadata.namespace = Some(namespace.to_string());
    rule.metadata.generation = Some(1);
    Arc::new(rule)
}

pub fn pod_spec(stateful_set: &StatefulSet) -> &PodSpec {
    stateful_set
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .expect("pod template must have a spec")
}

pub fn rules_volumes(stateful_set: &StatefulSet) -> Vec<Volume> {
    pod_spec(stateful_set)
        .volumes
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|v| v.name == volume_name(CONFIG_MAP))
        .collect()
}

/// Mount paths of the rules volume in `container`
pub fn rules_mounts(stateful_set: &StatefulSet, container: &str) -> Vec<String> {
    pod_spec(stateful_set)
        .containers
        .iter()
        .filter(|c| c.name == container)
        .flat_map(|c| c.volume_mounts.clone().unwrap_or_default())
        .filter(|m| m.name == volume_name(CONFIG_MAP))
        .map(|m| m.mount_path)
        .collect()
}

pub fn checksum(stateful_set: &StatefulSet) -> Option<String> {
    stateful_set
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.annotations.as_ref())
        .and_then(|annotations| annotations.get(&checksum_annotation_key(CONFIG_MAP)).cloned())
}
