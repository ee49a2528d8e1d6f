//! # Custom Resource Definitions
//!
//! CRD types for the Loki Rule Operator.
//!
//! ## Module Structure
//!
//! - `spec.rs` - `LokiRule` specification: rule groups and rules
//! - `status.rs` - Status types for tracking reconciliation state

mod spec;
mod status;

// Re-export all public types
pub use spec::{LokiRule, LokiRuleSpec, Rule, RuleGroup};
pub use status::{Condition, LokiRuleStatus, ReconcilePhase};
