//! Broker client contract.
//!
//! The core never speaks the broker wire protocol. It requires a client that
//! can:
//! - join a consumer group and hand out partition claims ([`GroupSession`], [`Claim`])
//! - send a message and wait for the acknowledgement ([`SyncSender`])
//! - accept messages on a queue and report delivery outcomes ([`AsyncHandle`])
//!
//! The `kafka` feature provides an implementation backed by `rdkafka`;
//! `testing::MockBroker` provides an in-memory one.

#[cfg(feature = "kafka")]
pub mod kafka;

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::{ConsumerGroupConfig, ProducerConfig};
use crate::error::{BrokerError, BrokerResult};

#[cfg(feature = "kafka")]
pub use kafka::KafkaConnector;

/// A single message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Bytes,
}

impl RecordHeader {
    /// Create a header.
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A consumed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
    pub value: Bytes,
}

impl Record {
    /// Value of the first header named `key`.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_ref())
    }
}

/// A message to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: Option<String>,
    pub headers: Vec<RecordHeader>,
    pub payload: Bytes,
    pub timestamp: SystemTime,
}

impl OutboundMessage {
    /// Value of the first header named `key`, as text.
    #[must_use]
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .and_then(|h| std::str::from_utf8(&h.value).ok())
    }
}

/// Where an acknowledged message was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// Outcome of an asynchronous send.
#[derive(Debug, Clone)]
pub enum DeliveryReport {
    Delivered {
        message: OutboundMessage,
        delivery: Delivery,
    },
    Failed {
        message: OutboundMessage,
        error: BrokerError,
    },
}

/// Membership of one consumer group.
#[async_trait]
pub trait GroupSession: Send + Sync {
    /// Wait until partitions are assigned to the caller and return the claim.
    ///
    /// Each caller receives its own claim; the session serializes assignment.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] once the session has been closed, or
    /// the client's error if joining fails.
    async fn claim(&self, topics: &[String]) -> BrokerResult<Box<dyn Claim>>;

    /// Leave the group. Pending and future claims end.
    ///
    /// # Errors
    ///
    /// Returns the client's error if leaving the group fails; the session
    /// is closed regardless.
    async fn close(&self) -> BrokerResult<()>;
}

/// Ordered message feed for the partitions assigned to one worker.
#[async_trait]
pub trait Claim: Send {
    /// Next message, or `None` when the claim ends (rebalance or close).
    async fn next(&mut self) -> Option<Record>;

    /// Mark `record` as consumed.
    fn mark(&mut self, record: &Record);

    /// Commit marked offsets.
    ///
    /// # Errors
    ///
    /// Returns the client's error if the commit is rejected.
    async fn commit(&mut self) -> BrokerResult<()>;
}

/// Send primitive that waits for the broker acknowledgement.
#[async_trait]
pub trait SyncSender: Send + Sync {
    /// Send `message` and wait for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the broker's error if the message was not acknowledged.
    async fn send(&self, message: OutboundMessage) -> BrokerResult<Delivery>;

    /// Flush and close.
    ///
    /// # Errors
    ///
    /// Returns an error if pending messages could not be flushed.
    async fn close(&self) -> BrokerResult<()>;
}

/// Queue-based producer handle.
///
/// Messages pushed on `input` are sent in the background; every outcome is
/// reported on `reports`. Dropping `input` closes the producer, after which
/// `reports` ends once pending outcomes are delivered.
#[derive(Debug)]
pub struct AsyncHandle {
    pub input: mpsc::Sender<OutboundMessage>,
    pub reports: mpsc::Receiver<DeliveryReport>,
}

/// Builds producer handles.
#[async_trait]
pub trait ProducerConnector: Send + Sync {
    /// Create a synchronous sender.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created.
    async fn connect_sync(&self, config: &ProducerConfig) -> BrokerResult<Arc<dyn SyncSender>>;

    /// Create an asynchronous handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created.
    async fn connect_async(&self, config: &ProducerConfig) -> BrokerResult<AsyncHandle>;
}

/// Builds consumer group sessions.
#[async_trait]
pub trait GroupConnector: Send + Sync {
    /// Create a session for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created.
    async fn connect(&self, config: &ConsumerGroupConfig) -> BrokerResult<Arc<dyn GroupSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_header_lookup() {
        let record = Record {
            topic: "t".to_string(),
            partition: 0,
            offset: 7,
            key: None,
            headers: vec![
                RecordHeader::new("traceId", "abc"),
                RecordHeader::new("traceId", "second"),
            ],
            value: Bytes::from_static(b"{}"),
        };
        assert_eq!(record.header("traceId"), Some(&b"abc"[..]));
        assert_eq!(record.header("group"), None);
    }

    #[test]
    fn test_outbound_header_str() {
        let message = OutboundMessage {
            topic: "t".to_string(),
            key: None,
            headers: vec![
                RecordHeader::new("rpcId", "1.0"),
                RecordHeader::new("bad", Bytes::from_static(&[0xff])),
            ],
            payload: Bytes::new(),
            timestamp: SystemTime::now(),
        };
        assert_eq!(message.header_str("rpcId"), Some("1.0"));
        assert_eq!(message.header_str("bad"), None);
    }
}
