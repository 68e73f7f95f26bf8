use rdkafka::error::KafkaError;
use thiserror::Error;

use posts_common::store::StoreError;

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("invalid consumer configuration: {0}")]
    InvalidConfig(String),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to flush the final batch of {count} posts: {error}")]
    FinalFlush { count: usize, error: StoreError },
}

/// Why a dequeued message could not be turned into a post. Such messages are dropped.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("message has no payload")]
    EmptyPayload,
    #[error("payload is not a valid post: {0}")]
    InvalidJson(#[from] serde_json::Error),
}
