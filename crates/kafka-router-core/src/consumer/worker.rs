//! Claim-consumption loop run by every worker of a consumer group.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::handler::MessageHandler;
use super::panic_trace;
use super::policy::{ErrorPolicy, RetryPolicy};
use crate::broker::{Claim, GroupSession, Record};
use crate::config::TraceSettings;
use crate::error::{BrokerError, ClientError};
use crate::metrics::ClientMetrics;
use crate::trace::{loggable_payload, TraceContext};

/// Lifecycle state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, not yet started.
    Idle,
    /// Waiting for the broker to assign partitions.
    Joining,
    /// Holding a claim, waiting for the next message.
    Claiming,
    /// Running the callback.
    Processing,
    /// Committing offsets after a successful callback.
    Committing,
    /// Cancellation observed; finishing up.
    Draining,
    /// Exited. Terminal.
    Stopped,
}

/// Shared per-worker state table of one consumer group.
#[derive(Debug, Clone)]
pub(super) struct StateTable {
    states: Arc<Mutex<Vec<WorkerState>>>,
}

impl StateTable {
    pub fn new(workers: usize) -> Self {
        Self {
            states: Arc::new(Mutex::new(vec![WorkerState::Idle; workers])),
        }
    }

    pub fn set(&self, worker: usize, state: WorkerState) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = states.get_mut(worker) {
            *slot = state;
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Settings and collaborators shared by every worker of one group.
pub(super) struct WorkerShared {
    pub group: String,
    pub topics: Vec<String>,
    pub session: Arc<dyn GroupSession>,
    pub handler: Arc<dyn MessageHandler>,
    pub settings: TraceSettings,
    pub metrics: Option<Arc<ClientMetrics>>,
    pub auto_commit: bool,
    pub slow_threshold: Duration,
    pub fault_policy: RetryPolicy,
    pub error_policy: ErrorPolicy,
    pub states: StateTable,
}

enum Outcome {
    Succeeded,
    Failed,
    Faulted,
    Abandoned,
}

pub(super) struct Worker {
    pub id: usize,
    pub shared: Arc<WorkerShared>,
    pub cancel: CancellationToken,
}

impl Worker {
    /// Join, consume claims and repeat until cancelled, closed or a join fails.
    pub async fn run(self) {
        let shared = &self.shared;
        if let Some(metrics) = &shared.metrics {
            metrics.inc_workers(&shared.group);
        }

        loop {
            if self.cancel.is_cancelled() {
                info!(group = %shared.group, worker = self.id, topics = ?shared.topics, "consumer cancelled");
                break;
            }

            self.set_state(WorkerState::Joining);
            let claim = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    info!(group = %shared.group, worker = self.id, topics = ?shared.topics, "consumer cancelled");
                    break;
                }
                claim = shared.session.claim(&shared.topics) => claim,
            };

            match claim {
                Ok(claim) => self.consume(claim).await,
                Err(BrokerError::Closed) => {
                    info!(group = %shared.group, worker = self.id, "session closed, worker exiting");
                    break;
                }
                Err(source) => {
                    let e = ClientError::Join {
                        group: shared.group.clone(),
                        source,
                    };
                    error!(
                        group = %shared.group,
                        worker = self.id,
                        topics = ?shared.topics,
                        error = %e,
                        "consume failed, worker exiting"
                    );
                    break;
                }
            }
        }

        self.set_state(WorkerState::Draining);
        if let Some(metrics) = &shared.metrics {
            metrics.dec_workers(&shared.group);
        }
        self.set_state(WorkerState::Stopped);
    }

    async fn consume(&self, mut claim: Box<dyn Claim>) {
        loop {
            self.set_state(WorkerState::Claiming);
            let record = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.set_state(WorkerState::Draining);
                    return;
                }
                record = claim.next() => record,
            };
            let Some(record) = record else {
                debug!(group = %self.shared.group, worker = self.id, "claim ended");
                return;
            };

            self.set_state(WorkerState::Processing);
            let ctx = TraceContext::from_record(&record, &self.shared.settings);
            let span = ctx.span();
            self.process(&mut *claim, ctx, record).instrument(span).await;
        }
    }

    async fn process(&self, claim: &mut dyn Claim, ctx: TraceContext, record: Record) {
        let shared = &*self.shared;
        let error_retry = shared.error_policy.retry_policy();
        let mut faults = 0u32;
        let mut errors = 0u32;

        let (outcome, cost) = loop {
            let begin = Instant::now();
            let result = AssertUnwindSafe(shared.handler.handle(ctx.clone(), record.value.clone()))
                .catch_unwind()
                .await;
            let cost = begin.elapsed();
            self.observe(&ctx, &record, cost);

            match result {
                Ok(Ok(())) => break (Outcome::Succeeded, cost),
                Ok(Err(e)) => {
                    errors += 1;
                    if let Some(metrics) = &shared.metrics {
                        metrics.record_callback_error(&shared.group);
                    }
                    error!(
                        group = %shared.group,
                        partition = record.partition,
                        offset = record.offset,
                        attempt = errors,
                        error = %e,
                        trace = %ctx.trace_label(),
                        msg = %loggable_payload(&record.value, &shared.settings),
                        "callback failed"
                    );
                    match error_retry {
                        Some(policy) if policy.allows_another(errors) => {
                            if !self.pause(policy.backoff()).await {
                                break (Outcome::Abandoned, cost);
                            }
                        }
                        _ => break (Outcome::Failed, cost),
                    }
                }
                Err(payload) => {
                    let stack = panic_trace::take()
                        .map_or_else(|| "unavailable".to_string(), |bt| bt.to_string());
                    faults += 1;
                    if let Some(metrics) = &shared.metrics {
                        metrics.record_callback_fault(&shared.group);
                    }
                    error!(
                        group = %shared.group,
                        partition = record.partition,
                        offset = record.offset,
                        attempt = faults,
                        panic = %panic_message(payload.as_ref()),
                        trace = %ctx.trace_label(),
                        msg = %loggable_payload(&record.value, &shared.settings),
                        stack = %stack,
                        "callback panicked"
                    );
                    drop(payload);
                    if !self.pause(shared.fault_policy.backoff()).await {
                        break (Outcome::Abandoned, cost);
                    }
                    if !shared.fault_policy.allows_another(faults) {
                        break (Outcome::Faulted, cost);
                    }
                }
            }
        };

        match outcome {
            Outcome::Abandoned => {
                info!(
                    group = %shared.group,
                    partition = record.partition,
                    offset = record.offset,
                    "cancelled during retry, message left unmarked"
                );
                return;
            }
            Outcome::Faulted => {
                warn!(
                    group = %shared.group,
                    partition = record.partition,
                    offset = record.offset,
                    attempts = faults,
                    "fault retries exhausted, skipping message"
                );
            }
            Outcome::Failed | Outcome::Succeeded => {}
        }

        claim.mark(&record);
        if let Some(metrics) = &shared.metrics {
            metrics.record_consumed(&shared.group);
        }

        if !matches!(outcome, Outcome::Succeeded) {
            return;
        }

        if !shared.auto_commit {
            self.set_state(WorkerState::Committing);
            if let Err(e) = claim.commit().await {
                warn!(
                    group = %shared.group,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "commit failed"
                );
            }
        }

        info!(
            group = %shared.group,
            partition = record.partition,
            offset = record.offset,
            cost = ?cost,
            trace = %ctx.trace_label(),
            msg = %loggable_payload(&record.value, &shared.settings),
            "message consumed"
        );
    }

    fn observe(&self, ctx: &TraceContext, record: &Record, cost: Duration) {
        let shared = &*self.shared;
        if let Some(metrics) = &shared.metrics {
            metrics.record_callback_duration(&shared.group, cost.as_secs_f64());
        }
        if cost > shared.slow_threshold {
            if let Some(metrics) = &shared.metrics {
                metrics.record_slow_callback(&shared.group);
            }
            warn!(
                group = %shared.group,
                limit = ?shared.slow_threshold,
                cost = ?cost,
                trace = %ctx.trace_label(),
                msg = %loggable_payload(&record.value, &shared.settings),
                "slow callback"
            );
        }
    }

    /// Sleep for `delay`; `false` if cancelled first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.shared.states.set(self.id, state);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 7");

        let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(5u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_state_table() {
        let table = StateTable::new(3);
        assert_eq!(table.snapshot(), vec![WorkerState::Idle; 3]);

        table.set(1, WorkerState::Processing);
        table.set(7, WorkerState::Stopped);
        assert_eq!(
            table.snapshot(),
            vec![WorkerState::Idle, WorkerState::Processing, WorkerState::Idle]
        );
    }
}
