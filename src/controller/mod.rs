//! # Controller
//!
//! The aggregation-and-mount engine and the reconciler driving it.

pub mod aggregator;
pub mod backoff;
pub mod fragment;
pub mod mount;
pub mod reconciler;
pub mod target;
pub mod validation;
