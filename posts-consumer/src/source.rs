use async_trait::async_trait;
use health::HealthHandle;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tracing::info;

use posts_common::kafka::{create_kafka_consumer, ConsumerConfig, KafkaConfig, KafkaContext};
use posts_common::queue::{MessageSource, PartitionOffsets, QueueMessage, SourceError};

use crate::error::ConsumerError;

/// Reads the posts topic as a member of the consumer group. Offsets only move on `commit`.
pub struct KafkaSource {
    consumer: StreamConsumer<KafkaContext>,
    topic: String,
}

impl KafkaSource {
    pub fn new(
        config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        liveness: HealthHandle,
    ) -> Result<Self, ConsumerError> {
        let consumer = create_kafka_consumer(config, consumer_config, liveness)?;
        consumer.subscribe(&[&config.kafka_topic])?;

        info!(
            topic = config.kafka_topic,
            group_id = consumer_config.kafka_consumer_group,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            topic: config.kafka_topic.clone(),
        })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn recv(&self) -> Result<QueueMessage, SourceError> {
        let message = self.consumer.recv().await.map_err(SourceError::Receive)?;

        Ok(QueueMessage {
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec),
        })
    }

    async fn commit(&self, offsets: &PartitionOffsets) -> Result<(), SourceError> {
        let mut list = TopicPartitionList::with_capacity(offsets.len());
        for (partition, offset) in offsets {
            // Kafka expects the offset of the next message to read
            list.add_partition_offset(&self.topic, *partition, Offset::Offset(offset + 1))
                .map_err(SourceError::Commit)?;
        }

        self.consumer
            .commit(&list, CommitMode::Sync)
            .map_err(SourceError::Commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use health::HealthRegistry;

    #[test]
    fn invalid_client_settings_are_reported() {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry.register("rdkafka".to_string(), time::Duration::seconds(30));
        let config = KafkaConfig {
            kafka_hosts: "localhost:9092".to_string(),
            kafka_topic: "create-posts".to_string(),
            kafka_tls: false,
            kafka_producer_linger_ms: 0,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_string(),
        };
        let consumer_config = ConsumerConfig {
            kafka_consumer_group: "posts-consumer".to_string(),
            kafka_consumer_offset_reset: "sideways".to_string(),
        };

        match KafkaSource::new(&config, &consumer_config, liveness) {
            Err(ConsumerError::Kafka(_)) => {}
            Err(err) => panic!("wrong error {}", err),
            Ok(_) => panic!("should have errored"),
        }
    }
}
