use std::collections::BTreeMap;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::envelope::Post;

/// Highest consumed offset for each partition of a topic.
pub type PartitionOffsets = BTreeMap<i32, i64>;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize post: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("queue rejected post: {0}")]
    Rejected(#[from] KafkaError),
    #[error("queue did not acknowledge post before the write timeout")]
    Canceled,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to receive message: {0}")]
    Receive(KafkaError),
    #[error("failed to commit offsets: {0}")]
    Commit(KafkaError),
    #[error("queue is closed")]
    Closed,
}

/// A message as read from the queue, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

/// Hands posts to the queue, one at a time.
#[async_trait]
pub trait Publisher {
    /// Returns once the queue accepted the post.
    async fn publish(&self, post: &Post) -> Result<(), PublishError>;
}

/// Reads messages from the queue in per-partition order.
#[async_trait]
pub trait MessageSource {
    /// Waits for the next message. Dropping the returned future must not lose a message.
    async fn recv(&self) -> Result<QueueMessage, SourceError>;

    /// Marks every message up to and including the given offsets as processed.
    async fn commit(&self, offsets: &PartitionOffsets) -> Result<(), SourceError>;
}
