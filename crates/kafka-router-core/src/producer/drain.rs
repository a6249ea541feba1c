//! Background delivery-report drain for asynchronous producers.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::broker::DeliveryReport;
use crate::config::TraceSettings;
use crate::error::BrokerError;
use crate::metrics::ClientMetrics;
use crate::trace::loggable_payload;

pub(super) struct DrainTask {
    pub producer: String,
    pub reports: mpsc::Receiver<DeliveryReport>,
    pub shutdown: CancellationToken,
    pub settings: TraceSettings,
    pub metrics: Option<Arc<ClientMetrics>>,
    pub last_error: Arc<Mutex<Option<BrokerError>>>,
}

impl DrainTask {
    /// Drain reports until the feed ends or shutdown is signalled.
    ///
    /// Failed messages are logged and dropped; they are not re-sent.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                report = self.reports.recv() => match report {
                    Some(report) => self.handle(report),
                    None => {
                        debug!(producer = %self.producer, "delivery report feed closed");
                        break;
                    }
                },
                () = self.shutdown.cancelled() => {
                    debug!(producer = %self.producer, "delivery report drain cancelled");
                    break;
                }
            }
        }
    }

    fn handle(&self, report: DeliveryReport) {
        match report {
            DeliveryReport::Delivered { message, delivery } => {
                trace!(
                    producer = %self.producer,
                    topic = %message.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "message delivered"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_sent(&self.producer);
                }
            }
            DeliveryReport::Failed { message, error } => {
                error!(
                    producer = %self.producer,
                    topic = %message.topic,
                    key = message.key.as_deref().unwrap_or_default(),
                    error = %error,
                    msg = %loggable_payload(&message.payload, &self.settings),
                    "async delivery failed"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_send_error(&self.producer);
                }
                *self
                    .last_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(error);
            }
        }
    }
}
