use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use health::HealthRegistry;
use time::Duration;
use tokio::net::TcpListener;

use posts_common::queue::Publisher;
use posts_common::store::{DocumentSink, PostgresSink, PrintSink};

use crate::config::Config;
use crate::publisher::{KafkaPublisher, PrintPublisher};
use crate::router;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut kafka_publisher = None;

    let app = if config.print_sink {
        router::router(
            posts_common::time::SystemTime {},
            Arc::new(PrintSink {}),
            Arc::new(PrintPublisher {}),
            None,
            config.export_prometheus,
        )
    } else {
        let liveness = HealthRegistry::new("liveness");
        let kafka_liveness = liveness.register("rdkafka".to_string(), Duration::seconds(30));

        let publisher = KafkaPublisher::new(&config.kafka, kafka_liveness)
            .context("failed to create kafka producer")?;
        let sink = PostgresSink::new(
            &config.direct_table,
            &config.database_url,
            config.max_pg_connections,
            config.write_timeout.0,
        )
        .await
        .context("failed to connect to postgres")?;

        kafka_publisher = Some(publisher.clone());
        let sink: Arc<dyn DocumentSink + Send + Sync> = Arc::new(sink);
        let publisher: Arc<dyn Publisher + Send + Sync> = Arc::new(publisher);
        router::router(
            posts_common::time::SystemTime {},
            sink,
            publisher,
            Some(liveness),
            config.export_prometheus,
        )
    };

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("failed to serve the api")?;

    if let Some(publisher) = kafka_publisher {
        // Posts answered with a success must reach the queue
        publisher
            .flush()
            .context("failed to flush pending posts to kafka")?;
    }

    Ok(())
}
