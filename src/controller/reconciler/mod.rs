//! # Reconciler
//!
//! Coordinates the engine components for every LokiRule event.
//!
//! ## Reconciliation Flow
//!
//! 1. Compile the resource into its fragment (Created / Updated only)
//! 2. Make sure the aggregated ConfigMap exists
//! 3. Merge or remove the fragment
//! 4. Resolve the Loki StatefulSet (cached)
//! 5. Mount the ConfigMap and refresh the checksum annotation
//! 6. Update status (Created / Updated only)

pub mod reconcile;
pub mod status;
pub mod types;

pub use reconcile::ReconcileOutcome;
pub use types::{BackoffState, Reconciler, ReconcilerError, RuleEvent};
