//! Consumer group engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::handler::MessageHandler;
use super::panic_trace;
use super::worker::{StateTable, Worker, WorkerShared, WorkerState};
use crate::broker::GroupConnector;
use crate::config::{ConsumerGroupConfig, TraceSettings, MIN_WORKERS};
use crate::error::{ClientError, ClientResult};
use crate::metrics::ClientMetrics;

/// A pool of workers consuming one group's topics with one callback.
///
/// Workers run the same loop independently: wait for a claim, invoke the
/// callback for every message of the claim in order, mark it, and commit
/// when auto-commit is off. Callback errors and panics are contained at the
/// worker; a failed join ends only that worker.
pub struct ConsumerGroup {
    config: ConsumerGroupConfig,
    shared: Arc<WorkerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    halt: Mutex<Option<CancellationToken>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ConsumerGroup {
    /// Validate `config` and open the group session.
    ///
    /// A `worker_count` below [`MIN_WORKERS`] is raised to it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if validation fails and
    /// [`ClientError::Construction`] if the session cannot be created.
    pub async fn connect(
        mut config: ConsumerGroupConfig,
        connector: &dyn GroupConnector,
        handler: Arc<dyn MessageHandler>,
        settings: &TraceSettings,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> ClientResult<Self> {
        if let Err(e) = config.validate() {
            error!(group = %config.name, error = %e, "invalid consumer group configuration");
            return Err(e.into());
        }
        if config.worker_count < MIN_WORKERS {
            warn!(
                group = %config.name,
                configured = config.worker_count,
                workers = MIN_WORKERS,
                "worker_count below minimum, raising"
            );
            config.worker_count = MIN_WORKERS;
        }
        panic_trace::install();

        let session = connector.connect(&config).await.map_err(|source| {
            error!(group = %config.name, error = %source, "failed to create consumer group");
            ClientError::Construction {
                component: "consumer group",
                name: config.name.clone(),
                source,
            }
        })?;

        let shared = Arc::new(WorkerShared {
            group: config.name.clone(),
            topics: config.topics.clone(),
            session,
            handler,
            settings: settings.clone(),
            metrics,
            auto_commit: config.auto_commit,
            slow_threshold: config.slow_threshold(),
            fault_policy: config.fault_policy,
            error_policy: config.error_policy,
            states: StateTable::new(config.worker_count),
        });

        Ok(Self {
            config,
            shared,
            workers: Mutex::new(Vec::new()),
            halt: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Engine name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &ConsumerGroupConfig {
        &self.config
    }

    /// Current state of every worker, indexed by worker id.
    #[must_use]
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared.states.snapshot()
    }

    /// Spawn the workers. They run until `cancel` fires, [`stop`](Self::stop)
    /// is called, or their join fails.
    ///
    /// Starting an engine that was already started does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the engine was stopped.
    pub fn start(&self, cancel: CancellationToken) -> ClientResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ClientError::Closed {
                name: self.config.name.clone(),
            });
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(group = %self.config.name, "consumer group already started");
            return Ok(());
        }

        info!(
            group = %self.config.name,
            group_id = %self.config.group_id,
            topics = %self.config.topics.join(","),
            brokers = %self.config.brokers().join(","),
            workers = self.config.worker_count,
            "consumer group starting"
        );

        let halt = cancel.child_token();
        let handles = (0..self.config.worker_count)
            .map(|id| {
                let worker = Worker {
                    id,
                    shared: Arc::clone(&self.shared),
                    cancel: halt.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        *self.workers.lock().unwrap_or_else(PoisonError::into_inner) = handles;
        *self.halt.lock().unwrap_or_else(PoisonError::into_inner) = Some(halt);
        Ok(())
    }

    /// Close the session and wait for every worker to exit.
    ///
    /// A callback already running finishes first; retry pauses are cut
    /// short and the message being retried is left unmarked.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Cleanup`] if the session reported an error
    /// while closing. Workers are awaited either way.
    pub async fn stop(&self) -> ClientResult<()> {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(halt) = self.halt.lock().unwrap_or_else(PoisonError::into_inner).take() {
            halt.cancel();
        }
        let closed = self.shared.session.close().await;

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(group = %self.config.name, error = %e, "consumer worker task failed");
            }
        }
        match closed {
            Ok(()) => {
                info!(group = %self.config.name, "consumer group stopped");
                Ok(())
            }
            Err(source) => {
                error!(group = %self.config.name, error = %source, "consumer group close failed");
                Err(ClientError::Cleanup {
                    backend: self.config.name.clone(),
                    source,
                })
            }
        }
    }
}

impl std::fmt::Debug for ConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroup")
            .field("name", &self.config.name)
            .field("group_id", &self.config.group_id)
            .field("topics", &self.config.topics)
            .field("workers", &self.config.worker_count)
            .finish()
    }
}
