use std::time::Duration;

use envconfig::Envconfig;
use health::HealthHandle;
use metrics::gauge;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, info};

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "create-posts")]
    pub kafka_topic: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "10000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    #[envconfig(default = "posts-consumer")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(liveness: HealthHandle) -> Self {
        KafkaContext { liveness }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("posts_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("posts_kafka_producer_queue_depth").set(stats.msg_cnt as f64);

        for (topic, topic_stats) in stats.topics {
            for (partition, partition_stats) in topic_stats.partitions {
                // -1 is librdkafka's internal unassigned partition
                if partition < 0 || partition_stats.consumer_lag < 0 {
                    continue;
                }
                gauge!(
                    "posts_kafka_consumer_lag",
                    "topic" => topic.clone(),
                    "partition" => partition.to_string()
                )
                .set(partition_stats.consumer_lag as f64);
            }
        }
    }
}

impl ConsumerContext for KafkaContext {}

fn base_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };
    client_config
}

pub fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

    let mut client_config = base_client_config(config);
    client_config
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        );

    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(liveness.into())?;

    // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
    drop(
        producer
            .client()
            .fetch_metadata(None, Timeout::After(Duration::new(10, 0)))?,
    );
    info!("connected to Kafka brokers");

    Ok(producer)
}

/// Creates a consumer that never commits or stores offsets on its own: offsets only move
/// when the owner commits them explicitly.
pub fn create_kafka_consumer(
    config: &KafkaConfig,
    consumer_config: &ConsumerConfig,
    liveness: HealthHandle,
) -> Result<StreamConsumer<KafkaContext>, KafkaError> {
    info!(
        group = consumer_config.kafka_consumer_group,
        "connecting to Kafka brokers at {}...", config.kafka_hosts
    );

    let mut client_config = base_client_config(config);
    client_config
        .set("group.id", &consumer_config.kafka_consumer_group)
        .set(
            "auto.offset.reset",
            &consumer_config.kafka_consumer_offset_reset,
        )
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false");

    debug!("rdkafka configuration: {:?}", client_config);
    let consumer: StreamConsumer<KafkaContext> =
        client_config.create_with_context(liveness.into())?;

    drop(consumer.fetch_metadata(
        Some(&config.kafka_topic),
        Timeout::After(Duration::new(10, 0)),
    )?);
    info!("connected to Kafka brokers");

    Ok(consumer)
}
