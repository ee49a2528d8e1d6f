//! # Reconciler Types
//!
//! The reconciliation context, the event taxonomy and the error taxonomy.

use crate::config::OperatorSettings;
use crate::controller::aggregator::ConfigAggregator;
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::fragment::FragmentCompiler;
use crate::controller::mount::MountSynchronizer;
use crate::controller::target::{TargetCache, TargetResolver};
use crate::controller::validation::ExpressionValidator;
use crate::constants::{DEFAULT_BACKOFF_MAX_SECS, DEFAULT_BACKOFF_MIN_SECS};
use crate::crd::LokiRule;
use crate::store::{ClusterStore, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("invalid LogQL expression: {expr}")]
    Validation { expr: String },

    #[error("no target found matching '{selector}' in namespace {namespace}")]
    TargetNotFound { selector: String, namespace: String },

    #[error("more than one target found matching '{selector}' in namespace {namespace} ({count} matches)")]
    TargetAmbiguous {
        selector: String,
        namespace: String,
        count: usize,
    },

    #[error("target {namespace}/{name} cannot be used: {reason}")]
    InvalidTarget {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("finalizer failed: {0}")]
    Finalizer(#[source] Box<kube_runtime::finalizer::Error<ReconcilerError>>),
}

impl From<serde_yaml::Error> for ReconcilerError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ReconcilerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl ReconcilerError {
    /// Whether retrying without any change to the inputs may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Finalizer(_))
    }

    /// Short machine-readable classification, used as status reason and metric label
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationFailed",
            Self::TargetNotFound { .. } => "TargetNotFound",
            Self::TargetAmbiguous { .. } => "TargetAmbiguous",
            Self::InvalidTarget { .. } => "InvalidTarget",
            Self::Store(StoreError::Conflict { .. }) => "Conflict",
            Self::Store(StoreError::Timeout(_)) => "Timeout",
            Self::Store(_) => "StoreError",
            Self::Serialization(_) => "SerializationFailed",
            Self::Finalizer(_) => "FinalizerFailed",
        }
    }
}

/// A change to a LokiRule, one handler per variant
#[derive(Debug, Clone)]
pub enum RuleEvent {
    Created(Arc<LokiRule>),
    Updated(Arc<LokiRule>),
    Deleted(Arc<LokiRule>),
}

impl RuleEvent {
    /// Classify a live (not deleted) resource
    ///
    /// A resource whose status has never recorded an observed generation has
    /// not been reconciled before.
    pub fn applied(rule: Arc<LokiRule>) -> Self {
        let observed = rule
            .status
            .as_ref()
            .and_then(|status| status.observed_generation);
        match observed {
            None => Self::Created(rule),
            Some(_) => Self::Updated(rule),
        }
    }

    pub fn rule(&self) -> &LokiRule {
        match self {
            Self::Created(rule) | Self::Updated(rule) | Self::Deleted(rule) => rule,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Backoff state for a specific resource
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self {
            backoff: FibonacciBackoff::new(DEFAULT_BACKOFF_MIN_SECS, DEFAULT_BACKOFF_MAX_SECS),
            error_count: 0,
        }
    }
}

impl BackoffState {
    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Everything a reconciliation needs, shared by all of them
pub struct Reconciler {
    pub store: Arc<dyn ClusterStore>,
    pub compiler: FragmentCompiler,
    pub aggregator: ConfigAggregator,
    pub resolver: TargetResolver,
    pub synchronizer: MountSynchronizer,
    pub mount_path: String,
    pub only_reconcile_rules: bool,
    /// Backoff state per resource (identified by namespace/name)
    pub backoff_states: Mutex<HashMap<String, BackoffState>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("compiler", &self.compiler)
            .field("aggregator", &self.aggregator)
            .field("resolver", &self.resolver)
            .field("synchronizer", &self.synchronizer)
            .field("mount_path", &self.mount_path)
            .field("only_reconcile_rules", &self.only_reconcile_rules)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        settings: &OperatorSettings,
        validator: Option<Arc<dyn ExpressionValidator>>,
        cache: Arc<TargetCache>,
    ) -> Self {
        Self {
            compiler: FragmentCompiler::new(validator),
            aggregator: ConfigAggregator::new(
                Arc::clone(&store),
                &settings.namespace,
                &settings.config_map_name,
            ),
            resolver: TargetResolver::new(
                Arc::clone(&store),
                settings.selector.clone(),
                &settings.namespace,
                cache,
            ),
            synchronizer: MountSynchronizer::new(Arc::clone(&store), settings.container.clone()),
            mount_path: settings.mount_path.clone(),
            only_reconcile_rules: settings.only_reconcile_rules,
            backoff_states: Mutex::new(HashMap::new()),
            store,
        }
    }
}
