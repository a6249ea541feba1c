//! Producer tests against the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kafka_router_core::config::{ProducerConfig, RequiredAcks, TraceSettings};
use kafka_router_core::error::{BrokerError, ClientError, ConfigError};
use kafka_router_core::metrics::ClientMetrics;
use kafka_router_core::producer::Producer;
use kafka_router_core::testing::MockBroker;
use kafka_router_core::trace::TraceContext;

const WAIT: Duration = Duration::from_secs(5);

fn settings() -> TraceSettings {
    TraceSettings {
        service_name: "checkout".to_string(),
        default_group: "blue".to_string(),
        ..TraceSettings::default()
    }
}

fn producer_config(sync: bool) -> ProducerConfig {
    let mut config = ProducerConfig::new("events", vec!["mock:9092".to_string()], "order-events");
    config.sync = sync;
    config
}

fn request_context() -> TraceContext {
    let headers: [(&str, &[u8]); 3] = [
        ("traceId", b"trace-1"),
        ("rpcId", b"1"),
        ("group", b"green"),
    ];
    TraceContext::at_server_entry(headers, &settings())
}

async fn connect(broker: &MockBroker, config: &ProducerConfig, metrics: Option<Arc<ClientMetrics>>) -> Producer {
    Producer::connect(config, broker, &settings(), CancellationToken::new(), metrics)
        .await
        .expect("producer should connect")
}

#[tokio::test]
async fn test_sync_send_stamps_trace_headers() {
    let broker = MockBroker::new();
    let producer = connect(&broker, &producer_config(true), None).await;
    assert!(producer.is_sync());

    let ctx = request_context().for_outbound_sibling();
    producer
        .send(&ctx, "{\"order\":7}", Some("customer-7"))
        .await
        .unwrap();

    let sent = broker.sent();
    assert_eq!(sent.len(), 1);
    let message = &sent[0];
    assert_eq!(message.topic, "order-events");
    assert_eq!(message.key.as_deref(), Some("customer-7"));
    assert_eq!(message.payload.as_ref(), b"{\"order\":7}");
    assert_eq!(message.header_str("traceId"), Some("trace-1"));
    assert_eq!(message.header_str("rpcId"), Some(ctx.call_id().as_str()));
    assert_eq!(message.header_str("rpcId"), Some("1.1"));
    assert_eq!(message.header_str("group"), Some("green"));
    assert_eq!(message.header_str("from"), Some("checkout"));
}

#[tokio::test]
async fn test_sibling_sends_carry_distinct_call_ids() {
    let broker = MockBroker::new();
    let producer = connect(&broker, &producer_config(true), None).await;

    let ctx = request_context();
    for _ in 0..3 {
        producer.send(&ctx.for_outbound_sibling(), "x", None).await.unwrap();
    }

    let ids: Vec<_> = broker
        .sent()
        .iter()
        .map(|m| m.header_str("rpcId").unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["1.1", "1.2", "1.3"]);
}

#[tokio::test]
async fn test_sync_send_rejected() {
    let broker = MockBroker::new();
    let metrics = Arc::new(ClientMetrics::new());
    let producer = connect(&broker, &producer_config(true), Some(Arc::clone(&metrics))).await;

    broker.reject_sends(Some(BrokerError::Rejected("NOT_ENOUGH_REPLICAS".to_string())));
    let err = producer
        .send(&request_context(), "x", Some("customer-7"))
        .await
        .unwrap_err();

    match err {
        ClientError::Send { topic, key, source, .. } => {
            assert_eq!(topic, "order-events");
            assert_eq!(key.as_deref(), Some("customer-7"));
            assert_eq!(source, BrokerError::Rejected("NOT_ENOUGH_REPLICAS".to_string()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(
        producer.last_error(),
        Some(BrokerError::Rejected("NOT_ENOUGH_REPLICAS".to_string()))
    );
    assert_eq!(metrics.send_errors.with_label_values(&["events"]).get(), 1);
    assert_eq!(metrics.messages_sent.with_label_values(&["events"]).get(), 0);

    broker.reject_sends(None);
    producer.send(&request_context(), "y", None).await.unwrap();
    assert_eq!(metrics.messages_sent.with_label_values(&["events"]).get(), 1);
}

#[tokio::test]
async fn test_async_send_returns_before_delivery() {
    let broker = MockBroker::new();
    let metrics = Arc::new(ClientMetrics::new());
    let producer = connect(&broker, &producer_config(false), Some(Arc::clone(&metrics))).await;
    assert!(!producer.is_sync());

    for i in 0..5 {
        producer
            .send(&request_context(), format!("event-{i}"), None)
            .await
            .unwrap();
    }

    assert!(broker.wait_for_sent(5, WAIT).await);
    producer.close().await.unwrap();

    let payloads: Vec<_> = broker.sent().iter().map(|m| m.payload.clone()).collect();
    assert_eq!(payloads.len(), 5);
    assert_eq!(payloads[0].as_ref(), b"event-0");
    assert_eq!(metrics.messages_sent.with_label_values(&["events"]).get(), 5);
}

#[tokio::test]
async fn test_async_delivery_failure_only_recorded() {
    let broker = MockBroker::new();
    let producer = connect(&broker, &producer_config(false), None).await;

    broker.reject_sends(Some(BrokerError::Timeout));
    producer.send(&request_context(), "x", None).await.unwrap();

    assert!(broker.wait_for_sent(1, WAIT).await);
    producer.close().await.unwrap();

    assert_eq!(broker.rejected().len(), 1);
    assert_eq!(producer.last_error(), Some(BrokerError::Timeout));
}

#[tokio::test]
async fn test_close_then_send_fails() {
    for sync in [true, false] {
        let broker = MockBroker::new();
        let producer = connect(&broker, &producer_config(sync), None).await;

        producer.close().await.unwrap();
        producer.close().await.unwrap();
        assert_eq!(broker.producer_closes(), 1);

        let err = producer.send(&request_context(), "x", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Closed { name } if name == "events"));
    }
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let broker = MockBroker::new();
    let mut config = producer_config(true);
    config.idempotent = true;
    config.required_acks = RequiredAcks::Leader;

    let err = Producer::connect(&config, &broker, &settings(), CancellationToken::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Config(ConfigError::InvalidAcks { .. })));
}

#[tokio::test]
async fn test_connect_failure_is_construction_error() {
    let broker = MockBroker::new();
    broker.fail_producer_connect(BrokerError::Unavailable("mock:9092".to_string()));

    let err = Producer::connect(&producer_config(false), &broker, &settings(), CancellationToken::new(), None)
        .await
        .unwrap_err();
    match err {
        ClientError::Construction { component, name, source } => {
            assert_eq!(component, "producer");
            assert_eq!(name, "events");
            assert_eq!(source, BrokerError::Unavailable("mock:9092".to_string()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
