//! # LokiRule Spec
//!
//! Main CRD specification types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// LokiRule Custom Resource Definition
///
/// Each LokiRule contributes one rules file to the aggregated ConfigMap that
/// is mounted into the Loki ruler.
///
/// # Example
///
/// ```yaml
/// apiVersion: loki.quero.com/v1alpha1
/// kind: LokiRule
/// metadata:
///   name: http-errors
///   namespace: payments
/// spec:
///   groups:
///     - name: http
///       rules:
///         - alert: HighErrorRate
///           expr: sum(rate({app="payments"} |= "error" [5m])) > 10
///           for: 10m
///           labels:
///             severity: page
/// ```
#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "LokiRule",
    group = "loki.quero.com",
    version = "v1alpha1",
    namespaced,
    status = "crate::crd::LokiRuleStatus",
    shortname = "lr",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LokiRuleSpec {
    /// Rule groups, rendered in the declared order
    #[serde(default)]
    pub groups: Vec<RuleGroup>,
}

/// A named group of rules evaluated together by the Loki ruler
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleGroup {
    pub name: String,
    /// Evaluation interval (e.g. "1m"); the ruler default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Limit on the number of alerts or series a rule may produce
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// A single alerting or recording rule
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    /// LogQL expression
    pub expr: String,
    #[serde(default, rename = "for", skip_serializing_if = "Option::is_none")]
    pub for_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl LokiRule {
    /// Namespace of the resource, falling back to `default` like the API server does
    pub fn namespace_or_default(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    pub fn name_or_unknown(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// All LogQL expressions declared by this resource, in declaration order
    pub fn expressions(&self) -> impl Iterator<Item = &str> {
        self.spec
            .groups
            .iter()
            .flat_map(|group| group.rules.iter())
            .map(|rule| rule.expr.as_str())
    }
}
