//! `fieldos broker serve` – the native broker process.

use std::path::PathBuf;

use fieldos_middleware::BrokerServer;
use fieldos_middleware::ws_server::BrokerServerConfig;
use fieldos_types::FieldError;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serve until SIGTERM or SIGINT.
pub async fn serve(config_path: PathBuf) -> Result<(), FieldError> {
    let config = BrokerServerConfig::load(&config_path)?;
    info!(config = %config_path.display(), listeners = ?config.listeners, "starting broker");
    let server = BrokerServer::new(config)?;

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received"),
                _ = sigint.recv() => info!("SIGINT received"),
            }
            shutdown.cancel();
        });
    }
    server.run(shutdown).await?;
    info!("broker stopped");
    Ok(())
}
