use envconfig::Envconfig;
use tokio::signal;

use posts_api::config::Config;
use posts_api::server::serve;
use posts_common::logging::setup_tracing;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let listener = tokio::net::TcpListener::bind(config.bind())
        .await
        .expect("could not bind port");

    serve(config, listener, shutdown()).await
}
