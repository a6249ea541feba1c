//! In-memory broker for integration testing.
//!
//! A mock broker that:
//! - Hands out scripted claims to consumer workers, one claim per worker
//! - Records marks, commits, closes and every produced message
//! - Injects connect, join, send and commit failures on demand

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::broker::{
    AsyncHandle, Claim, Delivery, DeliveryReport, GroupConnector, GroupSession, OutboundMessage,
    ProducerConnector, Record, RecordHeader, SyncSender,
};
use crate::config::{ConsumerGroupConfig, ProducerConfig};
use crate::error::{BrokerError, BrokerResult};

/// Build a record with no key or headers.
pub fn record(topic: &str, partition: i32, offset: i64, value: impl Into<Bytes>) -> Record {
    Record {
        topic: topic.to_string(),
        partition,
        offset,
        key: None,
        headers: Vec::new(),
        value: value.into(),
    }
}

/// Build a record carrying `headers`.
pub fn record_with_headers(
    topic: &str,
    partition: i32,
    offset: i64,
    value: impl Into<Bytes>,
    headers: &[(&str, &str)],
) -> Record {
    Record {
        headers: headers
            .iter()
            .map(|(k, v)| RecordHeader::new(*k, v.to_string()))
            .collect(),
        ..record(topic, partition, offset, value)
    }
}

/// A message marked consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

enum Script {
    Claim(Vec<Record>),
    Fail(BrokerError),
}

#[derive(Default)]
struct State {
    scripts: VecDeque<Script>,
    marked: Vec<MarkedRecord>,
    commits: usize,
    commit_error: Option<BrokerError>,
    session_closes: usize,
    group_connects: usize,
    group_connect_error: Option<BrokerError>,
    producer_connect_error: Option<BrokerError>,
    send_error: Option<BrokerError>,
    sent: Vec<OutboundMessage>,
    rejected: Vec<OutboundMessage>,
    next_offset: HashMap<String, i64>,
    producer_closes: usize,
}

/// In-memory broker implementing both connector traits.
///
/// Clones share state, so a test keeps one clone for scripting and
/// assertions and hands another to the code under test.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<State>>,
    claim_ready: Arc<Notify>,
}

impl MockBroker {
    /// Create a broker with no scripted claims.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a claim; the next worker waiting in `claim()` receives it.
    pub fn push_claim(&self, records: Vec<Record>) {
        self.state().scripts.push_back(Script::Claim(records));
        self.claim_ready.notify_waiters();
    }

    /// Queue a join failure; the next worker waiting in `claim()` receives it.
    pub fn push_join_error(&self, error: BrokerError) {
        self.state().scripts.push_back(Script::Fail(error));
        self.claim_ready.notify_waiters();
    }

    /// Make the next group connect fail.
    pub fn fail_group_connect(&self, error: BrokerError) {
        self.state().group_connect_error = Some(error);
    }

    /// Make the next producer connect fail.
    pub fn fail_producer_connect(&self, error: BrokerError) {
        self.state().producer_connect_error = Some(error);
    }

    /// Reject every send with `error` until called with `None`.
    pub fn reject_sends(&self, error: Option<BrokerError>) {
        self.state().send_error = error;
    }

    /// Fail every commit with `error` until called with `None`.
    pub fn fail_commits(&self, error: Option<BrokerError>) {
        self.state().commit_error = error;
    }

    /// Messages marked consumed, in marking order.
    #[must_use]
    pub fn marked(&self) -> Vec<MarkedRecord> {
        self.state().marked.clone()
    }

    /// Offsets marked consumed, in marking order.
    #[must_use]
    pub fn marked_offsets(&self) -> Vec<i64> {
        self.state().marked.iter().map(|m| m.offset).collect()
    }

    /// Successful commits.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.state().commits
    }

    /// Group sessions closed.
    #[must_use]
    pub fn session_closes(&self) -> usize {
        self.state().session_closes
    }

    /// Group sessions opened.
    #[must_use]
    pub fn group_connects(&self) -> usize {
        self.state().group_connects
    }

    /// Messages acknowledged, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.state().sent.clone()
    }

    /// Messages rejected, in order.
    #[must_use]
    pub fn rejected(&self) -> Vec<OutboundMessage> {
        self.state().rejected.clone()
    }

    /// Producers closed.
    #[must_use]
    pub fn producer_closes(&self) -> usize {
        self.state().producer_closes
    }

    /// Wait until at least `count` messages are marked.
    pub async fn wait_for_marked(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.marked.len() >= count).await
    }

    /// Wait until at least `count` messages are acknowledged or rejected.
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.sent.len() + s.rejected.len() >= count)
            .await
    }

    async fn wait_until(&self, timeout: Duration, done: impl Fn(&State) -> bool) -> bool {
        let poll = async {
            loop {
                if done(&self.state()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    fn deliver(&self, message: OutboundMessage) -> BrokerResult<Delivery> {
        let mut state = self.state();
        if let Some(error) = state.send_error.clone() {
            state.rejected.push(message);
            return Err(error);
        }
        let offset = state.next_offset.entry(message.topic.clone()).or_insert(0);
        let delivery = Delivery {
            partition: 0,
            offset: *offset,
        };
        *offset += 1;
        state.sent.push(message);
        Ok(delivery)
    }

    fn next_script(&self) -> Option<Script> {
        self.state().scripts.pop_front()
    }
}

struct MockSession {
    broker: MockBroker,
    closed: CancellationToken,
}

#[async_trait]
impl GroupSession for MockSession {
    async fn claim(&self, _topics: &[String]) -> BrokerResult<Box<dyn Claim>> {
        loop {
            if self.closed.is_cancelled() {
                return Err(BrokerError::Closed);
            }

            let notified = self.broker.claim_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.broker.next_script() {
                Some(Script::Claim(records)) => {
                    return Ok(Box::new(MockClaim {
                        records: records.into(),
                        broker: self.broker.clone(),
                        closed: self.closed.clone(),
                    }));
                }
                Some(Script::Fail(error)) => return Err(error),
                None => {}
            }

            tokio::select! {
                () = self.closed.cancelled() => return Err(BrokerError::Closed),
                () = &mut notified => {}
            }
        }
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.broker.state().session_closes += 1;
        }
        Ok(())
    }
}

struct MockClaim {
    records: VecDeque<Record>,
    broker: MockBroker,
    closed: CancellationToken,
}

#[async_trait]
impl Claim for MockClaim {
    async fn next(&mut self) -> Option<Record> {
        tokio::task::yield_now().await;
        if self.closed.is_cancelled() {
            return None;
        }
        self.records.pop_front()
    }

    fn mark(&mut self, record: &Record) {
        self.broker.state().marked.push(MarkedRecord {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
        });
    }

    async fn commit(&mut self) -> BrokerResult<()> {
        let mut state = self.broker.state();
        if let Some(error) = state.commit_error.clone() {
            return Err(error);
        }
        state.commits += 1;
        Ok(())
    }
}

#[async_trait]
impl GroupConnector for MockBroker {
    async fn connect(&self, _config: &ConsumerGroupConfig) -> BrokerResult<Arc<dyn GroupSession>> {
        let mut state = self.state();
        if let Some(error) = state.group_connect_error.take() {
            return Err(error);
        }
        state.group_connects += 1;
        Ok(Arc::new(MockSession {
            broker: self.clone(),
            closed: CancellationToken::new(),
        }))
    }
}

struct MockSyncSender {
    broker: MockBroker,
}

#[async_trait]
impl SyncSender for MockSyncSender {
    async fn send(&self, message: OutboundMessage) -> BrokerResult<Delivery> {
        self.broker.deliver(message)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.broker.state().producer_closes += 1;
        Ok(())
    }
}

#[async_trait]
impl ProducerConnector for MockBroker {
    async fn connect_sync(&self, _config: &ProducerConfig) -> BrokerResult<Arc<dyn SyncSender>> {
        if let Some(error) = self.state().producer_connect_error.take() {
            return Err(error);
        }
        Ok(Arc::new(MockSyncSender {
            broker: self.clone(),
        }))
    }

    async fn connect_async(&self, _config: &ProducerConfig) -> BrokerResult<AsyncHandle> {
        if let Some(error) = self.state().producer_connect_error.take() {
            return Err(error);
        }

        let (input, mut queue) = mpsc::channel::<OutboundMessage>(256);
        let (report_tx, reports) = mpsc::channel(256);
        let broker = self.clone();
        tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                let report = match broker.deliver(message.clone()) {
                    Ok(delivery) => DeliveryReport::Delivered { message, delivery },
                    Err(error) => DeliveryReport::Failed { message, error },
                };
                if report_tx.send(report).await.is_err() {
                    break;
                }
            }
            broker.state().producer_closes += 1;
        });

        Ok(AsyncHandle { input, reports })
    }
}
