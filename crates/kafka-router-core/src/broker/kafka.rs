//! Broker contract implemented with `rdkafka`.
//!
//! Each consumer worker claim is its own `StreamConsumer` member of the
//! group, so the broker assigns every partition to exactly one worker and
//! per-partition order holds. Offsets are stored on `mark` and committed on
//! `commit`.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    AsyncHandle, Claim, Delivery, DeliveryReport, GroupConnector, GroupSession, OutboundMessage,
    ProducerConnector, Record, RecordHeader, SyncSender,
};
use crate::config::{ConsumerGroupConfig, ProducerConfig};
use crate::error::{BrokerError, BrokerResult};

/// Capacity of the async producer input queue and report feed.
const QUEUE_CAPACITY: usize = 1024;

/// Creates producers and consumer group sessions backed by librdkafka.
#[derive(Debug, Clone, Default)]
pub struct KafkaConnector {
    client_id: Option<String>,
}

impl KafkaConnector {
    /// Create a connector with librdkafka's default client id.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `client.id` reported to the brokers.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    fn producer_config(&self, config: &ProducerConfig) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", config.brokers().join(","))
            .set("acks", config.required_acks.as_kafka_value())
            .set("enable.idempotence", config.idempotent.to_string())
            .set(
                "max.in.flight.requests.per.connection",
                config.max_open_requests.to_string(),
            )
            .set("message.timeout.ms", config.message_timeout_ms.to_string());
        if let Some(client_id) = &self.client_id {
            client.set("client.id", client_id);
        }
        client
    }

    fn consumer_config(&self, config: &ConsumerGroupConfig) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", config.brokers().join(","))
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", config.auto_commit.to_string())
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", config.auto_offset_reset.as_kafka_value())
            .set("session.timeout.ms", config.session_timeout_ms.to_string());
        if let Some(client_id) = &self.client_id {
            client.set("client.id", client_id);
        }
        client
    }
}

fn broker_error(e: &KafkaError) -> BrokerError {
    match e.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::OperationTimedOut,
        ) => BrokerError::Timeout,
        Some(RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure) => {
            BrokerError::Unavailable(e.to_string())
        }
        _ => match e {
            KafkaError::MessageProduction(_) => BrokerError::Rejected(e.to_string()),
            KafkaError::ClientCreation(_) => BrokerError::Unavailable(e.to_string()),
            _ => BrokerError::Client(e.to_string()),
        },
    }
}

fn owned_headers(headers: &[RecordHeader]) -> OwnedHeaders {
    headers.iter().fold(OwnedHeaders::new(), |acc, h| {
        acc.insert(Header {
            key: h.key.as_str(),
            value: Some(h.value.as_ref()),
        })
    })
}

fn millis_since_epoch(timestamp: SystemTime) -> Option<i64> {
    timestamp
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_millis()).ok())
}

fn future_record<'a>(message: &'a OutboundMessage) -> FutureRecord<'a, str, [u8]> {
    let mut record = FutureRecord::to(&message.topic)
        .payload(message.payload.as_ref())
        .headers(owned_headers(&message.headers));
    if let Some(key) = &message.key {
        record = record.key(key.as_str());
    }
    if let Some(ts) = millis_since_epoch(message.timestamp) {
        record = record.timestamp(ts);
    }
    record
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| RecordHeader::new(h.key, Bytes::copy_from_slice(h.value.unwrap_or_default())))
                .collect()
        })
        .unwrap_or_default();

    Record {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        headers,
        value: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
    }
}

struct KafkaSyncSender {
    producer: FutureProducer,
    timeout: Duration,
}

#[async_trait]
impl SyncSender for KafkaSyncSender {
    async fn send(&self, message: OutboundMessage) -> BrokerResult<Delivery> {
        self.producer
            .send(future_record(&message), Timeout::After(self.timeout))
            .await
            .map(|(partition, offset)| Delivery { partition, offset })
            .map_err(|(e, _)| broker_error(&e))
    }

    async fn close(&self) -> BrokerResult<()> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::Client(e.to_string()))?
            .map_err(|e| broker_error(&e))
    }
}

/// Forward queued messages to librdkafka and every outcome to the report feed.
async fn bridge(
    producer: FutureProducer,
    timeout: Duration,
    mut input: mpsc::Receiver<OutboundMessage>,
    reports: mpsc::Sender<DeliveryReport>,
) {
    while let Some(message) = input.recv().await {
        let queued = producer
            .send_result(future_record(&message))
            .map_err(|(e, _)| broker_error(&e));

        match queued {
            Ok(delivery) => {
                let reports = reports.clone();
                tokio::spawn(async move {
                    let report = match delivery.await {
                        Ok(Ok((partition, offset))) => DeliveryReport::Delivered {
                            message,
                            delivery: Delivery { partition, offset },
                        },
                        Ok(Err((e, _))) => DeliveryReport::Failed {
                            message,
                            error: broker_error(&e),
                        },
                        Err(_canceled) => DeliveryReport::Failed {
                            message,
                            error: BrokerError::Closed,
                        },
                    };
                    let _ = reports.send(report).await;
                });
            }
            Err(error) => {
                let _ = reports.send(DeliveryReport::Failed { message, error }).await;
            }
        }
    }

    debug!("async producer input closed, flushing");
    let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await;
    if let Ok(Err(e)) = flushed {
        warn!(error = %e, "async producer flush failed");
    }
}

#[async_trait]
impl ProducerConnector for KafkaConnector {
    async fn connect_sync(&self, config: &ProducerConfig) -> BrokerResult<Arc<dyn SyncSender>> {
        let producer: FutureProducer = self
            .producer_config(config)
            .create()
            .map_err(|e| broker_error(&e))?;
        Ok(Arc::new(KafkaSyncSender {
            producer,
            timeout: config.message_timeout(),
        }))
    }

    async fn connect_async(&self, config: &ProducerConfig) -> BrokerResult<AsyncHandle> {
        let producer: FutureProducer = self
            .producer_config(config)
            .create()
            .map_err(|e| broker_error(&e))?;

        let (input, queue) = mpsc::channel(QUEUE_CAPACITY);
        let (report_tx, reports) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(bridge(producer, config.message_timeout(), queue, report_tx));

        Ok(AsyncHandle { input, reports })
    }
}

struct KafkaSession {
    client: ClientConfig,
    closed: CancellationToken,
}

#[async_trait]
impl GroupSession for KafkaSession {
    async fn claim(&self, topics: &[String]) -> BrokerResult<Box<dyn Claim>> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        let consumer: StreamConsumer = self.client.create().map_err(|e| broker_error(&e))?;
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics).map_err(|e| broker_error(&e))?;

        Ok(Box::new(KafkaClaim {
            consumer,
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.cancel();
        Ok(())
    }
}

struct KafkaClaim {
    consumer: StreamConsumer,
    closed: CancellationToken,
}

#[async_trait]
impl Claim for KafkaClaim {
    async fn next(&mut self) -> Option<Record> {
        let received = tokio::select! {
            () = self.closed.cancelled() => return None,
            received = self.consumer.recv() => received.map(|m| to_record(&m)),
        };

        match received {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "receive failed, ending claim");
                None
            }
        }
    }

    fn mark(&mut self, record: &Record) {
        if let Err(e) = self
            .consumer
            .store_offset(&record.topic, record.partition, next_offset(record.offset))
        {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "failed to store offset"
            );
        }
    }

    async fn commit(&mut self) -> BrokerResult<()> {
        self.consumer
            .commit_consumer_state(CommitMode::Async)
            .map_err(|e| broker_error(&e))
    }
}

/// Offset a group resumes from once `offset` has been consumed.
fn next_offset(offset: i64) -> i64 {
    offset + 1
}

#[async_trait]
impl GroupConnector for KafkaConnector {
    async fn connect(&self, config: &ConsumerGroupConfig) -> BrokerResult<Arc<dyn GroupSession>> {
        Ok(Arc::new(KafkaSession {
            client: self.consumer_config(config),
            closed: CancellationToken::new(),
        }))
    }
}
