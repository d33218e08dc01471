//! fitrelayd - relay daemon for signed health and fitness events.
//!
//! Accepts PUBLISH/SUBSCRIBE/UNSUBSCRIBE over a WebSocket wire protocol,
//! validates and classifies incoming events, stores and indexes them,
//! and routes PRIVATE events to registered satellite nodes.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fitrelayd::config::Config;
use fitrelayd::server::Server;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let filter = EnvFilter::from_default_env().add_directive(
        if config.verbose { "fitrelayd=debug" } else { "fitrelayd=info" }
            .parse()
            .unwrap(),
    );
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        "fitrelayd v{} - fitness-event relay daemon",
        env!("CARGO_PKG_VERSION")
    );

    let server = match Server::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("failed to initialize server: {e}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown_handle = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        shutdown_handle.shutdown();
    });

    if let Err(e) = server.run().await {
        error!("server error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
