use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::counter;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::{error, info_span, instrument, Instrument};

use posts_common::envelope::Post;
use posts_common::kafka::{create_kafka_producer, KafkaConfig, KafkaContext};
use posts_common::queue::{PublishError, Publisher};

/// Publishes each post as one JSON message, keyed by post id.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<Self, KafkaError> {
        let producer = create_kafka_producer(config, liveness)?;
        Ok(Self {
            producer,
            topic: config.kafka_topic.clone(),
        })
    }

    /// Wait for in-flight messages to be delivered, called on shutdown.
    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::new(30, 0))
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    #[instrument(skip_all, fields(post_id = post.id))]
    async fn publish(&self, post: &Post) -> Result<(), PublishError> {
        let payload = serde_json::to_string(post)?;
        let key = post.key();

        let delivery = self
            .producer
            .send_result(FutureRecord::to(&self.topic).key(&key).payload(&payload))
            .map_err(|(err, _)| {
                counter!("posts_kafka_produce_errors_total").increment(1);
                error!("failed to produce post: {}", err);
                PublishError::Rejected(err)
            })?;

        match delivery.instrument(info_span!("ack_wait_one")).await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                counter!("posts_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka before write timeout");
                Err(PublishError::Canceled)
            }
            Ok(Err((err, _))) => {
                counter!("posts_kafka_produce_errors_total").increment(1);
                error!("failed to produce to Kafka: {}", err);
                Err(PublishError::Rejected(err))
            }
            Ok(Ok(_)) => {
                counter!("posts_published_total").increment(1);
                Ok(())
            }
        }
    }
}

/// Logs posts instead of publishing them, for running without Kafka.
pub struct PrintPublisher {}

#[async_trait]
impl Publisher for PrintPublisher {
    async fn publish(&self, post: &Post) -> Result<(), PublishError> {
        tracing::info!("published post: {:?}", post);
        counter!("posts_published_total").increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use health::HealthRegistry;
    use posts_common::test_utils::test_post;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;
    use rdkafka::types::{RDKafkaApiKey, RDKafkaRespErr};

    fn start_on_mocked_publisher() -> (MockCluster<'static, DefaultProducerContext>, KafkaPublisher)
    {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("one".to_string(), time::Duration::seconds(30));
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let config = KafkaConfig {
            kafka_hosts: cluster.bootstrap_servers(),
            kafka_topic: "create-posts".to_string(),
            kafka_tls: false,
            kafka_producer_linger_ms: 0,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_string(),
        };
        let publisher = KafkaPublisher::new(&config, handle).expect("failed to create publisher");
        (cluster, publisher)
    }

    #[tokio::test]
    async fn kafka_publisher_error_handling() {
        // A mocked broker lets us inject produce errors. The cases share one producer to
        // amortize its startup cost.
        let (cluster, publisher) = start_on_mocked_publisher();
        let post = test_post(1_000);

        // Wait for the producer to be ready, kafka_message_timeout_ms is short
        for _ in 0..20 {
            if publisher.publish(&post).await.is_ok() {
                break;
            }
        }

        publisher
            .publish(&post)
            .await
            .expect("failed to publish initial post");

        // Transient errors are retried by the producer within the message timeout
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_BROKER_NOT_AVAILABLE; 2];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        publisher
            .publish(&post)
            .await
            .expect("failed to publish after recovery");

        // A sustained outage surfaces as an error instead of a silent drop
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_BROKER_NOT_AVAILABLE; 50];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        match publisher.publish(&post).await {
            Err(PublishError::Rejected(_)) | Err(PublishError::Canceled) => {}
            Err(err) => panic!("wrong error {}", err),
            Ok(()) => panic!("should have errored"),
        };

        // Non-retriable broker errors are reported right away
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_INVALID_PARTITIONS; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        match publisher.publish(&post).await {
            Err(PublishError::Rejected(_)) => {}
            Err(err) => panic!("wrong error {}", err),
            Ok(()) => panic!("should have errored"),
        };
    }
}
