//! Kafka Router CLI
//!
//! Runs the producers and consumer groups described in a YAML file against a
//! Kafka cluster, routing benchmark and gray traffic to their own backends.

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kafka_router_core::broker::KafkaConnector;
use kafka_router_core::config::{LoggingConfig, ProducerConfig, RouterConfig, TraceSettings};
use kafka_router_core::consumer::{handler_fn, ConsumerGroup, ConsumerGroups};
use kafka_router_core::metrics::ClientMetrics;
use kafka_router_core::producer::Producer;
use kafka_router_core::router::{CompositeCleanup, Producers, Registry};
use kafka_router_core::trace::{headers, loggable_payload, TraceContext};

/// Trace-aware Kafka producer and consumer-group runner.
#[derive(Parser)]
#[command(name = "kafka-router")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start every configured producer and consumer group until interrupted.
    Run,

    /// Send one message through a configured producer.
    Produce {
        /// Producer name from the configuration.
        #[arg(long)]
        producer: String,

        /// Partitioning key.
        #[arg(long)]
        key: Option<String>,

        /// Trace id to send with; a `pts_` style prefix routes to the shadow.
        #[arg(long)]
        trace_id: Option<String>,

        /// Routing group header.
        #[arg(long)]
        group: Option<String>,

        /// Message payload.
        message: String,
    },

    /// Validate the configuration and exit.
    Check,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = RouterConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config))?;

    // Override log level from verbosity flag
    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = %config.tracing.service_name,
        environment = config.tracing.environment.as_str(),
        producers = config.producers.len(),
        consumer_groups = config.consumer_groups.len(),
        "starting kafka router"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => runtime.block_on(run(config)),
        Command::Produce {
            producer,
            key,
            trace_id,
            group,
            message,
        } => runtime.block_on(produce_one(
            config,
            &producer,
            key.as_deref(),
            trace_id.as_deref(),
            group.as_deref(),
            message,
        )),
        Command::Check => {
            info!("configuration is valid");
            Ok(())
        }
    }
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

fn connector(settings: &TraceSettings) -> KafkaConnector {
    if settings.service_name.is_empty() {
        KafkaConnector::new()
    } else {
        KafkaConnector::new().with_client_id(settings.service_name.clone())
    }
}

/// Build the primary producer of `config` plus its shadow and gray replicas.
///
/// Producers are created once per name through `registry`.
async fn build_producers(
    config: &ProducerConfig,
    registry: &Registry<Producer>,
    connector: &KafkaConnector,
    settings: &TraceSettings,
    shutdown: &CancellationToken,
    metrics: &Arc<ClientMetrics>,
) -> anyhow::Result<Producers> {
    let create = |config: ProducerConfig| async move {
        registry
            .get_or_try_init(&config.name, || {
                Producer::connect(
                    &config,
                    connector,
                    settings,
                    shutdown.clone(),
                    Some(Arc::clone(metrics)),
                )
            })
            .await
    };

    let mut set = Producers::new(create(config.clone()).await?);
    if let Some(over) = &config.shadow {
        set = set.try_with_shadow(create(config.derive(over, "shadow")).await);
    }
    if let Some(over) = &config.gray {
        set = set.try_with_gray(create(config.derive(over, "gray")).await);
    }
    Ok(set.checked().await?)
}

async fn run(config: RouterConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(ClientMetrics::new());
    let shutdown = CancellationToken::new();
    let connector = connector(&config.tracing);

    if config.metrics.enabled {
        let metrics_clone = Arc::clone(&metrics);
        let metrics_addr = config.metrics.address.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_addr, metrics_clone).await {
                error!(error = %e, "metrics server error");
            }
        });
        info!(address = %config.metrics.address, "metrics server started");
    }

    let registry = Registry::new();
    let mut cleanup = CompositeCleanup::default();
    for producer in &config.producers {
        match build_producers(producer, &registry, &connector, &config.tracing, &shutdown, &metrics).await {
            Ok(mut set) => cleanup.extend(set.cleanup()),
            Err(e) => {
                cleanup.run().await;
                return Err(e.context(format!("building producer '{}'", producer.name)));
            }
        }
    }

    let mut groups = ConsumerGroups::new();
    for group in &config.consumer_groups {
        let settings = config.tracing.clone();
        let name = group.name.clone();
        let handler = handler_fn(move |ctx: TraceContext, payload: Bytes| {
            let settings = settings.clone();
            let name = name.clone();
            async move {
                info!(
                    group = %name,
                    trace = %ctx.trace_label(),
                    origin = %ctx.origin(),
                    msg = %loggable_payload(&payload, &settings),
                    "message received"
                );
                Ok(())
            }
        });
        let engine = ConsumerGroup::connect(
            group.clone(),
            &connector,
            Arc::new(handler),
            &config.tracing,
            Some(Arc::clone(&metrics)),
        )
        .await;
        match engine {
            Ok(engine) => {
                groups.register(Arc::new(engine));
            }
            Err(e) => {
                groups.stop().await.ok();
                cleanup.run().await;
                return Err(anyhow::Error::new(e).context(format!("building consumer group '{}'", group.name)));
            }
        }
    }

    if let Err(e) = groups.start(&shutdown).await {
        error!(error = %e, "consumer groups did not all start");
    }
    info!(
        producers = %registry.names().await.join(","),
        consumer_groups = %groups.name(),
        "kafka router running"
    );

    shutdown_signal().await;
    info!("shutdown signal received, stopping");
    shutdown.cancel();

    if let Err(e) = groups.stop().await {
        error!(error = %e, "consumer groups did not stop cleanly");
    }
    for e in cleanup.run().await {
        error!(error = %e, "producer did not close cleanly");
    }

    info!("shutdown complete");
    Ok(())
}

async fn produce_one(
    config: RouterConfig,
    name: &str,
    key: Option<&str>,
    trace_id: Option<&str>,
    group: Option<&str>,
    message: String,
) -> anyhow::Result<()> {
    let producer = config
        .producers
        .iter()
        .find(|p| p.name == name)
        .with_context(|| format!("no producer named '{name}' in configuration"))?;

    let metrics = Arc::new(ClientMetrics::new());
    let shutdown = CancellationToken::new();
    let connector = connector(&config.tracing);
    let registry = Registry::new();
    let mut set = build_producers(producer, &registry, &connector, &config.tracing, &shutdown, &metrics).await?;

    let mut inbound: Vec<(&str, &[u8])> = Vec::new();
    if let Some(trace_id) = trace_id {
        inbound.push((headers::TRACE_ID, trace_id.as_bytes()));
    }
    if let Some(group) = group {
        inbound.push((headers::GROUP, group.as_bytes()));
    }
    let ctx = TraceContext::at_server_entry(inbound, &config.tracing);

    let target = set.select_gray(&ctx);
    info!(producer = %target.name(), topic = %target.topic(), trace = %ctx.trace_label(), "sending");
    let sent = target.send(&ctx.for_outbound_sibling(), message, key).await;

    for e in set.cleanup().run().await {
        error!(error = %e, "producer did not close cleanly");
    }
    sent?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn start_metrics_server(
    addr: &str,
    metrics: Arc<ClientMetrics>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use http_body_util::Full;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    let body = metrics.encode().unwrap_or_default();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}
