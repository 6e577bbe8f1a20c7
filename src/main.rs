//! mata: a TCP relay with traffic duplication
//!
//! Accepts client connections and relays them to backend targets:
//! - Echo mode: bytes are sent straight back to the client
//! - One target: bytes are relayed in both directions
//! - Several targets: client bytes are mirrored to every target, replies
//!   come from the first (primary) target only
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod copy;
mod error;
mod handlers;
mod server;
mod target;

use config::Config;
use handlers::Handler;
use server::Server;
use tokio_util::sync::CancellationToken;
use tracing::info;
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
        listen = %config.listen,
        echo = config.echo,
        max_connections = config.max_connections,
        "Starting mata relay"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let handler = Handler::from_config(&config);
    let server = Server::bind(&config, handler).await?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    server.run(cancel).await?;
    Ok(())
}

/// Cancel `cancel` on SIGINT or SIGTERM.
async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutting down...");
    cancel.cancel();
}
