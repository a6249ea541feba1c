//! Test utilities.
//!
//! - [`MockBroker`] - An in-memory broker implementing the producer and
//!   consumer-group connectors
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_router_core::testing::{record, MockBroker};
//!
//! #[tokio::test]
//! async fn test_consume() {
//!     let broker = MockBroker::new();
//!     broker.push_claim(vec![record("orders", 0, 0, "{}")]);
//!     // connect a ConsumerGroup with `&broker` and start it
//!     assert!(broker.wait_for_marked(1, Duration::from_secs(1)).await);
//! }
//! ```

pub mod mock_broker;

pub use mock_broker::{record, record_with_headers, MarkedRecord, MockBroker};
