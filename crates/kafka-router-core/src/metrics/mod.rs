//! Metrics collection for producers and consumer groups.
//!
//! Provides Prometheus-compatible metrics for send and consume paths.

pub mod prometheus;

pub use prometheus::ClientMetrics;
