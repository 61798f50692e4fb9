//! Camera Relay Application
//!
//! Serves the viewer page and control API, and relays the camera to every
//! connected WebSocket viewer. The transcoder only runs while someone watches.
//!
//! Usage: `relay [config.toml]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camera_relay::{
    alerts::AlertStore,
    config::AppConfig,
    stream::{FfmpegTranscoder, StreamSupervisor},
    web::{AppState, WebServer},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting camera relay");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load_or_default(config_path.as_deref())
        .context("Failed to load configuration")?;

    tracing::info!(
        source = %config.source.url,
        quality = config.transcoder.quality,
        fps = config.transcoder.frame_rate,
        "Camera source configured"
    );

    let transcoder = Arc::new(FfmpegTranscoder::new(
        config.source.clone(),
        config.transcoder.clone(),
    ));
    let supervisor = StreamSupervisor::new(
        config.supervisor.clone(),
        transcoder,
        config.transcoder.read_chunk_size,
    );

    let alerts = AlertStore::open(&config.alerts.path)
        .await
        .with_context(|| format!("Failed to open alert log {}", config.alerts.path.display()))?;
    tracing::info!(path = %alerts.path().display(), "Alert log ready");

    let state = Arc::new(AppState::new(supervisor.clone(), Arc::new(alerts)));
    let web_server = WebServer::new(config.server.clone(), state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = tokio::spawn(web_server.run(shutdown_rx));

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutting down");
        }
        result = &mut server => {
            // Listener failed before any signal; still leave no transcoder behind
            supervisor.shutdown();
            result
                .context("Web server task panicked")?
                .context("Web server failed")?;
            return Ok(());
        }
    }

    // Kill the transcoder and close viewer sockets before the listeners stop
    supervisor.shutdown();
    let _ = shutdown_tx.send(true);

    server
        .await
        .context("Web server task panicked")?
        .context("Web server failed")?;

    tracing::info!("Server closed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
