//! Lifecycle aggregation over several named consumers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::group::ConsumerGroup;
use crate::error::ClientResult;

/// Anything with a start/stop lifecycle that the supervisor can manage.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Unique name.
    fn name(&self) -> &str;

    /// Start consuming until `cancel` fires or [`stop`](Self::stop) is called.
    async fn start(&self, cancel: CancellationToken) -> ClientResult<()>;

    /// Stop consuming and wait for in-flight work.
    async fn stop(&self) -> ClientResult<()>;
}

#[async_trait]
impl Consumer for ConsumerGroup {
    fn name(&self) -> &str {
        ConsumerGroup::name(self)
    }

    async fn start(&self, cancel: CancellationToken) -> ClientResult<()> {
        ConsumerGroup::start(self, cancel)
    }

    async fn stop(&self) -> ClientResult<()> {
        ConsumerGroup::stop(self).await
    }
}

/// Named consumers started and stopped together.
///
/// Registering a name twice replaces the earlier consumer. `start` and
/// `stop` reach every member and report only the last error observed; the
/// individual failures are in the logs.
#[derive(Default)]
pub struct ConsumerGroups {
    members: BTreeMap<String, Arc<dyn Consumer>>,
}

impl ConsumerGroups {
    /// Create an empty supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `consumer`, returning the one it replaced.
    pub fn register(&mut self, consumer: Arc<dyn Consumer>) -> Option<Arc<dyn Consumer>> {
        let name = consumer.name().to_string();
        let replaced = self.members.insert(name.clone(), consumer);
        if replaced.is_some() {
            warn!(consumer = %name, "replacing consumer registered under the same name");
        }
        replaced
    }

    /// Register `consumer` and return `self`.
    #[must_use]
    pub fn with(mut self, consumer: Arc<dyn Consumer>) -> Self {
        self.register(consumer);
        self
    }

    /// Member registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Consumer>> {
        self.members.get(name)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether no consumer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Comma-joined member names.
    #[must_use]
    pub fn name(&self) -> String {
        self.members.keys().cloned().collect::<Vec<_>>().join(",")
    }

    /// Start every member.
    ///
    /// # Errors
    ///
    /// Returns the last error reported by a member.
    pub async fn start(&self, cancel: &CancellationToken) -> ClientResult<()> {
        let mut last = Ok(());
        for (name, consumer) in &self.members {
            if let Err(e) = consumer.start(cancel.clone()).await {
                warn!(consumer = %name, error = %e, "consumer failed to start");
                last = Err(e);
            }
        }
        info!(consumers = %self.name(), "consumers started");
        last
    }

    /// Stop every member.
    ///
    /// # Errors
    ///
    /// Returns the last error reported by a member.
    pub async fn stop(&self) -> ClientResult<()> {
        let mut last = Ok(());
        for (name, consumer) in &self.members {
            if let Err(e) = consumer.stop().await {
                warn!(consumer = %name, error = %e, "consumer failed to stop");
                last = Err(e);
            }
        }
        info!(consumers = %self.name(), "consumers stopped");
        last
    }
}

impl std::fmt::Debug for ConsumerGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroups")
            .field("members", &self.members.keys().collect::<Vec<_>>())
            .finish()
    }
}
