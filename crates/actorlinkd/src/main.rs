//! actorlinkd - actorlink bridge node daemon
//!
//! Joins an actor cluster over TCP, keeps connections to the configured
//! peers and routes envelopes between them. With `--echo` every inbound
//! envelope is sent back to its sender.

use actorlinkd::config::Config;
use actorlinkd::server::Server;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    let default_directive = if config.verbose {
        "actorlinkd=debug,actorlink_net=debug"
    } else {
        "actorlinkd=info,actorlink_net=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!(
        "actorlinkd v{} - actorlink bridge node",
        env!("CARGO_PKG_VERSION")
    );

    // Create and run server
    let server = match Server::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Install signal handler
    tokio::spawn({
        let server = server.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                server.shutdown();
            }
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
