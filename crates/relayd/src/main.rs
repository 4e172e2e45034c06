//! relayd - guild log relay daemon
//!
//! Accepts signed publishes over WebSocket, sequences them per guild,
//! persists the logs, and fans events out to subscribers.

use clap::Parser;
use relayd::config::Config;
use relayd::server::RelayServer;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let default_directive = if config.verbose { "relayd=debug" } else { "relayd=info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(default_directive.parse().expect("static directive"));
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    info!("relayd v{}", env!("CARGO_PKG_VERSION"));

    if config.clean && !config.memory && config.db.exists() {
        info!(db = %config.db.display(), "wiping database path");
        if let Err(e) = std::fs::remove_dir_all(&config.db) {
            error!("failed to wipe database path: {e}");
            return ExitCode::FAILURE;
        }
    }

    let server = match RelayServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to initialize relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown.send(());
    });

    if let Err(e) = server.run().await {
        error!("server error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
