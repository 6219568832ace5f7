//! Hayate - request-accelerating upload proxy
//!
//! Streams upload bodies to disk and object storage and forwards a rewritten
//! request to the application backend.

use clap::Parser;
use hayate::{config::Config, logging, objectstore::ObjectStoreClients, server::Server};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Hayate - upload-accelerating reverse proxy
#[derive(Parser, Debug)]
#[command(name = "hayate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    logging::init_subscriber(&config.logging, args.log_level.as_deref())?;

    info!("Starting Hayate v{}", hayate::VERSION);
    info!("Loaded configuration from {:?}", args.config);

    let shutdown = CancellationToken::new();

    if cfg!(feature = "metrics") && config.metrics.enabled {
        let metrics_server = hayate::metrics::server::MetricsServer::builder()
            .port(config.metrics.port)
            .build()?;
        metrics_server.start(shutdown.clone()).await?;
    }

    let clients = Arc::new(ObjectStoreClients::new(config.upload.pipe_buffer_size)?);
    let server = Server::bind(config, clients).await?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Cannot listen for shutdown signal"),
        }
    });

    server.run(shutdown).await?;
    Ok(())
}
