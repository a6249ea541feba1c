//! Kafka Router Core Library
//!
//! Client-side messaging and multi-backend routing for microservices. It
//! produces and consumes partitioned event streams, and routes every
//! request-scoped operation to a primary, shadow (benchmark traffic) or gray
//! (canary) backend without callers knowing which one they got.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`trace`] - Request trace context and hierarchical call ids
//! - [`router`] - Primary/shadow/gray backend sets with transaction override
//! - [`producer`] - Sync or async producer stamping trace headers
//! - [`consumer`] - Consumer group engine, callback policies and supervisor
//! - [`broker`] - Broker client contract and the `rdkafka` adapter
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_router_core::config::RouterConfig;
//! use kafka_router_core::producer::Producer;
//! use kafka_router_core::trace::TraceContext;
//!
//! let config = RouterConfig::from_file("config.yaml")?;
//! let producer = Producer::connect(&config.producers[0], &connector, &config.tracing, shutdown, None).await?;
//!
//! let ctx = TraceContext::at_server_entry(request_headers, &config.tracing);
//! producer.send(&ctx.for_outbound_sibling(), payload, Some("customer-7")).await?;
//! ```

#![forbid(unsafe_code)]

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod producer;
pub mod router;
pub mod trace;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use config::{ConsumerGroupConfig, Environment, ProducerConfig, RouterConfig, TraceSettings};
pub use consumer::{handler_fn, ConsumerGroup, ConsumerGroups, MessageHandler};
pub use error::{BrokerError, CallbackError, ClientError, ClientResult, ConfigError};
pub use producer::Producer;
pub use router::{BackendSet, Producers, ReadWriteSet, Registry};
pub use trace::TraceContext;
