//! Prometheus metrics for producers and consumer groups.
//!
//! Every series is labelled by the producer or consumer-group name.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Client metrics collection.
pub struct ClientMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Messages acknowledged by the broker, by producer.
    pub messages_sent: IntCounterVec,

    /// Failed sends by producer.
    pub send_errors: IntCounterVec,

    /// Messages marked consumed by consumer group.
    pub messages_consumed: IntCounterVec,

    /// Callback invocations that returned an error.
    pub callback_errors: IntCounterVec,

    /// Callback invocations that panicked.
    pub callback_faults: IntCounterVec,

    /// Callback invocations slower than the group's threshold.
    pub slow_callbacks: IntCounterVec,

    /// Callback latency histogram by consumer group.
    pub callback_duration_seconds: HistogramVec,

    /// Workers currently running by consumer group.
    pub active_workers: IntGaugeVec,
}

impl ClientMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_sent = IntCounterVec::new(
            Opts::new(
                "kafka_router_messages_sent_total",
                "Total number of messages handed to the broker by producer",
            ),
            &["producer"],
        )
        .expect("metric creation should succeed");

        let send_errors = IntCounterVec::new(
            Opts::new(
                "kafka_router_send_errors_total",
                "Total number of failed sends by producer",
            ),
            &["producer"],
        )
        .expect("metric creation should succeed");

        let messages_consumed = IntCounterVec::new(
            Opts::new(
                "kafka_router_messages_consumed_total",
                "Total number of messages marked consumed by consumer group",
            ),
            &["group"],
        )
        .expect("metric creation should succeed");

        let callback_errors = IntCounterVec::new(
            Opts::new(
                "kafka_router_callback_errors_total",
                "Total number of callback errors by consumer group",
            ),
            &["group"],
        )
        .expect("metric creation should succeed");

        let callback_faults = IntCounterVec::new(
            Opts::new(
                "kafka_router_callback_faults_total",
                "Total number of recovered callback panics by consumer group",
            ),
            &["group"],
        )
        .expect("metric creation should succeed");

        let slow_callbacks = IntCounterVec::new(
            Opts::new(
                "kafka_router_slow_callbacks_total",
                "Total number of callbacks exceeding the slow threshold",
            ),
            &["group"],
        )
        .expect("metric creation should succeed");

        let callback_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "kafka_router_callback_duration_seconds",
                "Callback latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 3.0, 10.0,
            ]),
            &["group"],
        )
        .expect("metric creation should succeed");

        let active_workers = IntGaugeVec::new(
            Opts::new(
                "kafka_router_active_workers",
                "Current number of running consumer workers",
            ),
            &["group"],
        )
        .expect("metric creation should succeed");

        registry
            .register(Box::new(messages_sent.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(send_errors.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(messages_consumed.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(callback_errors.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(callback_faults.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(slow_callbacks.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(callback_duration_seconds.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(active_workers.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            messages_sent,
            send_errors,
            messages_consumed,
            callback_errors,
            callback_faults,
            slow_callbacks,
            callback_duration_seconds,
            active_workers,
        }
    }

    /// Record a message handed to the broker.
    pub fn record_sent(&self, producer: &str) {
        self.messages_sent.with_label_values(&[producer]).inc();
    }

    /// Record a failed send.
    pub fn record_send_error(&self, producer: &str) {
        self.send_errors.with_label_values(&[producer]).inc();
    }

    /// Record a message marked consumed.
    pub fn record_consumed(&self, group: &str) {
        self.messages_consumed.with_label_values(&[group]).inc();
    }

    /// Record a callback error.
    pub fn record_callback_error(&self, group: &str) {
        self.callback_errors.with_label_values(&[group]).inc();
    }

    /// Record a recovered callback panic.
    pub fn record_callback_fault(&self, group: &str) {
        self.callback_faults.with_label_values(&[group]).inc();
    }

    /// Record a callback exceeding the slow threshold.
    pub fn record_slow_callback(&self, group: &str) {
        self.slow_callbacks.with_label_values(&[group]).inc();
    }

    /// Record callback duration.
    pub fn record_callback_duration(&self, group: &str, duration_seconds: f64) {
        self.callback_duration_seconds
            .with_label_values(&[group])
            .observe(duration_seconds);
    }

    /// Increment running workers.
    pub fn inc_workers(&self, group: &str) {
        self.active_workers.with_label_values(&[group]).inc();
    }

    /// Decrement running workers.
    pub fn dec_workers(&self, group: &str) {
        self.active_workers.with_label_values(&[group]).dec();
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}
