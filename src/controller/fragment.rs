//! # Fragment Compiler
//!
//! Turns one `LokiRule` into the rules file it contributes to the aggregated
//! ConfigMap. The file name is derived from the resource identity and the
//! content is the YAML rendering of its rule groups, in declaration order.

use crate::controller::reconciler::ReconcilerError;
use crate::controller::validation::ExpressionValidator;
use crate::crd::{LokiRule, RuleGroup};
use crate::observability::metrics;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// A rules file ready to be merged into the aggregated ConfigMap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub key: String,
    pub content: String,
}

/// Shape of a Loki ruler rules file
#[derive(Debug, Serialize)]
struct RulesFile<'a> {
    groups: &'a [RuleGroup],
}

/// ConfigMap key owned by the LokiRule `namespace/name`
pub fn fragment_key(namespace: &str, name: &str) -> String {
    format!("{namespace}-{name}.yaml")
}

/// Render a LokiRule into its fragment without any validation
pub fn render(rule: &LokiRule) -> Result<Fragment, ReconcilerError> {
    let content = serde_yaml::to_string(&RulesFile {
        groups: &rule.spec.groups,
    })?;
    Ok(Fragment {
        key: fragment_key(rule.namespace_or_default(), rule.name_or_unknown()),
        content,
    })
}

#[derive(Debug, Clone, Default)]
pub struct FragmentCompiler {
    validator: Option<Arc<dyn ExpressionValidator>>,
}

impl FragmentCompiler {
    pub fn new(validator: Option<Arc<dyn ExpressionValidator>>) -> Self {
        Self { validator }
    }

    pub fn validates(&self) -> bool {
        self.validator.is_some()
    }

    /// Validate every expression (when a validator is configured) and render the fragment
    ///
    /// The first invalid expression aborts compilation; no partial fragment is produced.
    pub async fn compile(&self, rule: &LokiRule) -> Result<Fragment, ReconcilerError> {
        if let Some(validator) = &self.validator {
            for expr in rule.expressions() {
                if !validator.validate(expr).await {
                    warn!(
                        "LokiRule {}/{} has an invalid LogQL expression: {}",
                        rule.namespace_or_default(),
                        rule.name_or_unknown(),
                        expr
                    );
                    metrics::increment_validation_failures();
                    return Err(ReconcilerError::Validation {
                        expr: expr.to_string(),
                    });
                }
            }
        }

        let fragment = render(rule)?;
        debug!("Compiled fragment {} ({} bytes)", fragment.key, fragment.content.len());
        Ok(fragment)
    }
}
