//! Loki Rule Operator Library
//!
//! Aggregates `LokiRule` resources into a single ConfigMap and keeps it mounted
//! into the Loki StatefulSet. Tests are included in the module files and under
//! `tests/`.
//!
//! ## Quick Start
//!
//! ```rust
//! use loki_rule_operator::prelude::*;
//! ```

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod runtime;
pub mod server;
pub mod store;
