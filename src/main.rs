//! kafka-lite server entry point.

use kafka_lite::config::Config;
use kafka_lite::server::{Server, ServerError};
use kafka_lite::shutdown::Shutdown;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        read_buffer_size = config.read_buffer_size,
        max_connections = config.max_connections,
        workers = ?config.workers,
        shutdown_timeout_secs = config.shutdown_timeout.as_secs(),
        "Starting kafka-lite server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build().map_err(ServerError::Runtime)?;

    if let Err(e) = runtime.block_on(run(config)) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }

    Ok(())
}

async fn run(config: Config) -> Result<(), ServerError> {
    let shutdown = Shutdown::new();
    shutdown.arm_on_signals().map_err(ServerError::Signal)?;

    let server = Server::bind(config).await?;
    server.run(shutdown).await;

    info!("Shutting down");
    Ok(())
}
