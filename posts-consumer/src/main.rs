use std::future::ready;
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal;
use tracing::info;

use posts_common::logging::setup_tracing;
use posts_common::metrics::setup_metrics_routes;
use posts_common::store::PostgresSink;
use posts_consumer::config::Config;
use posts_consumer::consumer::BatchingConsumer;
use posts_consumer::source::KafkaSource;

pub async fn index() -> &'static str {
    "posts consumer"
}

async fn shutdown_signal() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = signal::ctrl_c() => {},
    };
}

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();
    info!("Starting posts consumer...");

    let config = Config::init_from_env()?;
    info!(
        topic = config.kafka.kafka_topic,
        group_id = config.consumer.kafka_consumer_group,
        table = config.queued_table,
        "Configuration loaded"
    );

    let liveness = HealthRegistry::new("liveness");
    let kafka_liveness = liveness.register("rdkafka".to_string(), time::Duration::seconds(30));
    let loop_liveness = liveness.register("consumer".to_string(), config.liveness_deadline());

    // Health check server
    let bind = config.bind();
    let health_router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let health_router = setup_metrics_routes(health_router);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("serving probes and metrics on {}", bind);
    tokio::task::spawn(async move {
        if let Err(err) = axum::serve(listener, health_router).await {
            tracing::error!("probe server stopped: {}", err);
        }
    });

    let sink = PostgresSink::new(
        &config.queued_table,
        &config.database_url,
        config.max_pg_connections,
        config.write_timeout.0,
    )
    .await?;
    let source = KafkaSource::new(&config.kafka, &config.consumer, kafka_liveness)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        _ = shutdown_tx.send(true);
    });

    let consumer = BatchingConsumer::new(
        Arc::new(source),
        Arc::new(sink),
        config.batch_config(),
        loop_liveness,
    )?;
    consumer.run(shutdown_rx).await?;

    info!("Posts consumer shut down");
    Ok(())
}
