//! Prometheus metrics for the operator API proxy
//!
//! Counters for proxied traffic, cache hits and dependent watches, served
//! alongside health and readiness probes.

pub mod prometheus;

pub use prometheus::*;
