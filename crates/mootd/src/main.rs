//! mootd - moot community overlay daemon
//!
//! This daemon maintains replicated, partially-ordered message logs for the
//! communities the embedding application registers, and keeps them
//! converging through Bloom-window anti-entropy.

use clap::Parser;
use mootd::config::Config;
use mootd::server::Server;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    // Initialize logging
    let filter = EnvFilter::from_default_env().add_directive(
        if config.verbose { "mootd=debug" } else { "mootd=info" }
            .parse()
            .expect("static directive"),
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

    if let Err(error) = config.validate() {
        error!("Invalid configuration: {error}");
        return ExitCode::FAILURE;
    }

    info!(
        "mootd v{} - moot community overlay daemon",
        env!("CARGO_PKG_VERSION")
    );

    let server = match Server::new(config) {
        Ok(server) => Arc::new(server),
        Err(error) => {
            error!("Failed to initialize server: {error}");
            return ExitCode::FAILURE;
        }
    };

    {
        let server = server.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received shutdown signal");
            server.shutdown();
        });
    }

    if let Err(error) = server.run().await {
        error!("Server error: {error}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
