//! In-memory stand-ins for Kafka and Postgres, used to exercise the API and the consumer
//! without external services.
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio::sync::mpsc;

use crate::envelope::Post;
use crate::queue::{
    MessageSource, PartitionOffsets, PublishError, Publisher, QueueMessage, SourceError,
};
use crate::store::{DocumentSink, StoreError};

type Delivery = Result<QueueMessage, SourceError>;

/// A single-partition queue backed by a channel.
pub struct MemoryQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    next_offset: AtomicI64,
    committed: Mutex<PartitionOffsets>,
    commits: AtomicUsize,
    commit_failures_left: AtomicUsize,
    reject_publish: AtomicBool,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            next_offset: AtomicI64::new(0),
            committed: Mutex::new(PartitionOffsets::new()),
            commits: AtomicUsize::new(0),
            commit_failures_left: AtomicUsize::new(0),
            reject_publish: AtomicBool::new(false),
        }
    }

    /// Enqueue a raw payload, returns its offset.
    pub fn push_raw(&self, payload: Option<Vec<u8>>) -> i64 {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        let message = QueueMessage {
            partition: 0,
            offset,
            payload,
        };
        self.send(Ok(message));
        offset
    }

    /// The next `recv` in line fails with a transient broker error.
    pub fn inject_recv_error(&self) {
        self.send(Err(SourceError::Receive(KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure,
        ))));
    }

    fn send(&self, delivery: Delivery) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            sender.send(delivery).expect("receiver is owned by the queue");
        }
    }

    pub fn push(&self, post: &Post) -> i64 {
        self.push_raw(Some(serde_json::to_vec(post).unwrap()))
    }

    /// Once the queued messages are drained, `recv` reports the queue as closed.
    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }

    /// Number of messages ever enqueued.
    pub fn len(&self) -> usize {
        self.next_offset.load(Ordering::SeqCst) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn committed(&self) -> PartitionOffsets {
        self.committed.lock().unwrap().clone()
    }

    /// Commit calls made, failed ones included.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn fail_commits(&self, calls: usize) {
        self.commit_failures_left.store(calls, Ordering::SeqCst);
    }

    pub fn reject_publish(&self, reject: bool) {
        self.reject_publish.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl Publisher for MemoryQueue {
    async fn publish(&self, post: &Post) -> Result<(), PublishError> {
        if self.reject_publish.load(Ordering::SeqCst) {
            return Err(PublishError::Canceled);
        }
        let payload = serde_json::to_vec(post)?;
        self.push_raw(Some(payload));
        Ok(())
    }
}

#[async_trait]
impl MessageSource for MemoryQueue {
    async fn recv(&self) -> Result<QueueMessage, SourceError> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.unwrap_or(Err(SourceError::Closed))
    }

    async fn commit(&self, offsets: &PartitionOffsets) -> Result<(), SourceError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .commit_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SourceError::Commit(KafkaError::ConsumerCommit(
                RDKafkaErrorCode::RebalanceInProgress,
            )));
        }

        let mut committed = self.committed.lock().unwrap();
        for (partition, offset) in offsets {
            let current = committed.entry(*partition).or_insert(*offset);
            *current = (*current).max(*offset);
        }
        Ok(())
    }
}

/// Records every successful bulk write, can be told to fail the next calls.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<Post>>>,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, calls: usize) {
        self.failures_left.store(calls, Ordering::SeqCst);
    }

    /// Successfully written batches, in write order.
    pub fn batches(&self) -> Vec<Vec<Post>> {
        self.batches.lock().unwrap().clone()
    }

    /// Calls made, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentSink for MemorySink {
    async fn insert_many(&self, posts: &[Post]) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Timeout {
                count: posts.len(),
                timeout: Duration::ZERO,
            });
        }

        self.batches.lock().unwrap().push(posts.to_vec());
        Ok(())
    }
}

/// A post with distinguishable content, stamped at `id` milliseconds.
pub fn test_post(id: i64) -> Post {
    let at = Utc
        .timestamp_millis_opt(id)
        .single()
        .expect("valid timestamp");
    Post {
        id,
        title: format!("title {id}"),
        subtitle: format!("subtitle {id}"),
        content: format!("content {id}"),
        author: "author".to_string(),
        created_at: at,
        updated_at: at,
    }
}
