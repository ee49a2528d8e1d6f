//! # Prelude
//!
//! Re-exports commonly used types and traits.
//!
//! ```rust
//! use loki_rule_operator::prelude::*;
//! ```

pub use crate::crd::*;

pub use crate::config::{
    LabelSelector, LeaderElection, LokiEndpoint, OperatorConfig, OperatorSettings,
};

pub use crate::controller::aggregator::{management_labels, merge_labels, ConfigAggregator};
pub use crate::controller::fragment::{Fragment, FragmentCompiler};
pub use crate::controller::mount::{content_hash, MountBinding, MountSynchronizer};
pub use crate::controller::reconciler::{
    ReconcileOutcome, Reconciler, ReconcilerError, RuleEvent,
};
pub use crate::controller::target::{TargetCache, TargetResolver, TargetWorkload};
pub use crate::controller::validation::{ExpressionValidator, LokiQueryValidator};

pub use crate::store::{ClusterStore, InMemoryStore, InjectedFailure, KubeStore, StoreError};
