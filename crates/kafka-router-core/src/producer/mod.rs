//! Trace-aware message producer.
//!
//! A producer is either synchronous (every send waits for the broker
//! acknowledgement) or asynchronous (sends are queued and a background task
//! drains the delivery reports). The mode is fixed at construction.

mod drain;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

use crate::broker::{OutboundMessage, ProducerConnector, RecordHeader, SyncSender};
use crate::config::{ProducerConfig, TraceSettings};
use crate::error::{BrokerError, ClientError, ClientResult};
use crate::metrics::ClientMetrics;
use crate::router::{cleanup_fn, Backend, Cleanup};
use crate::trace::{loggable_payload, TraceContext};

use drain::DrainTask;

enum Transport {
    Sync(Mutex<Option<Arc<dyn SyncSender>>>),
    Async {
        input: Mutex<Option<mpsc::Sender<OutboundMessage>>>,
        drain: Mutex<Option<JoinHandle<()>>>,
    },
}

struct Inner {
    name: String,
    topic: String,
    transport: Transport,
    settings: TraceSettings,
    metrics: Option<Arc<ClientMetrics>>,
    last_error: Arc<Mutex<Option<BrokerError>>>,
    close_timeout: Duration,
}

/// Sends payloads to one topic, stamping trace headers on every message.
///
/// Cloning is cheap; clones share the same underlying client.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<Inner>,
}

impl Producer {
    /// Validate `config` and create the producer.
    ///
    /// Asynchronous producers spawn a task that drains delivery reports until
    /// the producer is closed or `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if validation fails and
    /// [`ClientError::Construction`] if the client cannot be created. No
    /// producer exists in either case.
    pub async fn connect(
        config: &ProducerConfig,
        connector: &dyn ProducerConnector,
        settings: &TraceSettings,
        shutdown: CancellationToken,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> ClientResult<Self> {
        if let Err(e) = config.validate() {
            error!(producer = %config.name, error = %e, "invalid producer configuration");
            return Err(e.into());
        }

        let construction = |source: BrokerError| {
            error!(producer = %config.name, sync = config.sync, error = %source, "failed to create producer");
            ClientError::Construction {
                component: "producer",
                name: config.name.clone(),
                source,
            }
        };

        let last_error = Arc::new(Mutex::new(None));
        let transport = if config.sync {
            let sender = connector.connect_sync(config).await.map_err(construction)?;
            Transport::Sync(Mutex::new(Some(sender)))
        } else {
            let handle = connector.connect_async(config).await.map_err(construction)?;
            let task = DrainTask {
                producer: config.name.clone(),
                reports: handle.reports,
                shutdown,
                settings: settings.clone(),
                metrics: metrics.clone(),
                last_error: Arc::clone(&last_error),
            };
            Transport::Async {
                input: Mutex::new(Some(handle.input)),
                drain: Mutex::new(Some(tokio::spawn(task.run()))),
            }
        };

        info!(
            producer = %config.name,
            topic = %config.topic,
            sync = config.sync,
            brokers = %config.brokers().join(","),
            "producer running"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                name: config.name.clone(),
                topic: config.topic.clone(),
                transport,
                settings: settings.clone(),
                metrics,
                last_error,
                close_timeout: config.message_timeout(),
            }),
        })
    }

    /// Producer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Destination topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Whether sends wait for the broker acknowledgement.
    #[must_use]
    pub fn is_sync(&self) -> bool {
        matches!(self.inner.transport, Transport::Sync(_))
    }

    /// Most recent send, delivery or close failure.
    #[must_use]
    pub fn last_error(&self) -> Option<BrokerError> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send `payload`, optionally keyed by `key` for partitioning.
    ///
    /// The message carries the trace id, call id and routing group of `ctx`.
    /// A synchronous producer returns once the broker has acknowledged the
    /// message; an asynchronous one returns once it is queued, and delivery
    /// failures are only logged.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Send`] if the broker rejects the message or
    /// the queue is gone, and [`ClientError::Closed`] after [`close`](Self::close).
    pub async fn send(
        &self,
        ctx: &TraceContext,
        payload: impl Into<Bytes>,
        key: Option<&str>,
    ) -> ClientResult<()> {
        let payload = payload.into();
        self.send_traced(ctx, payload, key)
            .instrument(ctx.span())
            .await
    }

    async fn send_traced(&self, ctx: &TraceContext, payload: Bytes, key: Option<&str>) -> ClientResult<()> {
        let inner = &self.inner;
        let message = OutboundMessage {
            topic: inner.topic.clone(),
            key: key.map(str::to_string),
            headers: ctx
                .outbound_headers()
                .into_iter()
                .map(|(k, v)| RecordHeader::new(k, v))
                .collect(),
            payload: payload.clone(),
            timestamp: SystemTime::now(),
        };

        let result = match &inner.transport {
            Transport::Sync(sender) => {
                let sender = sender
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                let Some(sender) = sender else {
                    return Err(self.closed());
                };
                sender.send(message).await.map(|delivery| {
                    if let Some(metrics) = &inner.metrics {
                        metrics.record_sent(&inner.name);
                    }
                    Some(delivery)
                })
            }
            Transport::Async { input, .. } => {
                let input = input.lock().unwrap_or_else(PoisonError::into_inner).clone();
                let Some(input) = input else {
                    return Err(self.closed());
                };
                input
                    .send(message)
                    .await
                    .map(|()| None)
                    .map_err(|_| BrokerError::Closed)
            }
        };

        let text = loggable_payload(&payload, &inner.settings);
        match result {
            Ok(delivery) => {
                info!(
                    producer = %inner.name,
                    topic = %inner.topic,
                    key = key.unwrap_or_default(),
                    partition = delivery.map(|d| d.partition),
                    offset = delivery.map(|d| d.offset),
                    msg = %text,
                    "message sent"
                );
                Ok(())
            }
            Err(source) => {
                error!(
                    producer = %inner.name,
                    topic = %inner.topic,
                    key = key.unwrap_or_default(),
                    error = %source,
                    msg = %text,
                    "send failed"
                );
                self.record_failure(&source);
                Err(ClientError::Send {
                    producer: inner.name.clone(),
                    topic: inner.topic.clone(),
                    key: key.map(str::to_string),
                    source,
                })
            }
        }
    }

    /// Flush and close the underlying client.
    ///
    /// An asynchronous producer stops accepting messages and waits, up to the
    /// message timeout, for outstanding delivery reports. Closing twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Cleanup`] if the client fails to flush.
    pub async fn close(&self) -> ClientResult<()> {
        let inner = &self.inner;
        let result = match &inner.transport {
            Transport::Sync(sender) => {
                let sender = sender.lock().unwrap_or_else(PoisonError::into_inner).take();
                match sender {
                    Some(sender) => sender.close().await,
                    None => Ok(()),
                }
            }
            Transport::Async { input, drain } => {
                drop(input.lock().unwrap_or_else(PoisonError::into_inner).take());
                let handle = drain.lock().unwrap_or_else(PoisonError::into_inner).take();
                match handle {
                    Some(mut handle) => {
                        match tokio::time::timeout(inner.close_timeout, &mut handle).await {
                            Ok(_) => Ok(()),
                            Err(_) => {
                                handle.abort();
                                Err(BrokerError::Timeout)
                            }
                        }
                    }
                    None => Ok(()),
                }
            }
        };

        match result {
            Ok(()) => {
                info!(producer = %inner.name, "producer closed");
                Ok(())
            }
            Err(source) => {
                error!(producer = %inner.name, error = %source, "producer close failed");
                self.record_failure(&source);
                Err(ClientError::Cleanup {
                    backend: inner.name.clone(),
                    source,
                })
            }
        }
    }

    fn record_failure(&self, error: &BrokerError) {
        *self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error.clone());
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_send_error(&self.inner.name);
        }
    }

    fn closed(&self) -> ClientError {
        ClientError::Closed {
            name: self.inner.name.clone(),
        }
    }
}

impl Backend for Producer {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn cleanup(&self) -> Cleanup {
        let producer = self.clone();
        cleanup_fn(move || async move { producer.close().await })
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("name", &self.inner.name)
            .field("topic", &self.inner.topic)
            .field("sync", &self.is_sync())
            .finish()
    }
}
