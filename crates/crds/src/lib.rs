//! dynamic-prefix CRD definitions
//!
//! Kubernetes Custom Resource Definitions for the dynamic-prefix operator.
//! The single cluster-scoped kind is `DynamicPrefix`, which describes how to
//! receive a delegated IPv6 prefix and how to project it into address ranges
//! and subnets consumed by downstream pool resources.

pub mod dynamic_prefix;

pub use dynamic_prefix::*;
