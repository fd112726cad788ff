pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod signaling;
pub mod utils;

pub use error::{Error, Result};

use anyhow::Context;
use clap::Parser;
use config::{ServerArgs, ServerConfig};
use signaling::SignalingServer;
use tracing::{error, info};

/// Signaling server entry point: parses flags, serves until SIGINT or SIGTERM
pub fn run() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    logger::init_tracing(args.log.as_deref());

    let config = ServerConfig::from_args(&args).context("invalid server configuration")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        let server = SignalingServer::bind(config)
            .await
            .context("failed to bind signaling server")?;
        server.run_until(shutdown_signal()).await?;
        Ok::<(), anyhow::Error>(())
    })
}

/// Resolves on the first SIGINT or SIGTERM. A signal that cannot be
/// registered is logged and never fires.
async fn shutdown_signal() {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT. Graceful shutdown..."),
            Err(e) => {
                error!("Failed to listen for SIGINT: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                info!("Received SIGTERM. Graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}
