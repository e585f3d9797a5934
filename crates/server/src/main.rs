use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use trove_api::{Notification, TcpFanout};
use trove_store::{LocalFiles, MemoryStorage};

use trove_server::config::Config;
use trove_server::error::ServerError;
use trove_server::{api, build_state, telemetry};

/// Trove personal-data server.
#[derive(Debug, Parser)]
#[command(name = "trove-server", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    telemetry::init();

    let storage = Arc::new(MemoryStorage::new());
    let files = Arc::new(LocalFiles::new(&config.attachments.directory).await?);

    let transport: Option<Arc<dyn trove_api::Transport>> = if config.messaging.enabled {
        let fanout = TcpFanout::bind(&config.messaging.host, config.messaging.port).await?;
        info!(
            host = %config.messaging.host,
            port = config.messaging.port,
            "TCP messaging enabled"
        );
        Some(fanout)
    } else {
        None
    };

    let state = build_state(&config, storage, files, transport)?;
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout_seconds);

    // Webhook deliveries run alongside the request handlers.
    let runner = trove_api::runner::spawn_webhook_runner(state.services.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "server listening");
    state.services.bus.publish(Notification::server_ready());

    let bus = state.services.bus.clone();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    drop(bus);
    if tokio::time::timeout(shutdown_timeout, runner).await.is_err() {
        warn!("webhook runner did not drain before the shutdown timeout");
    }
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for shutdown signal");
    }
}
