//! HTTP and WebSocket listeners
//!
//! | Path | Description |
//! |------|-------------|
//! | `GET /stream-status` | `{status, clients, message}` |
//! | `POST /restart-stream` | Stop, pause, start the transcoder |
//! | `GET /api/status` | Full relay status |
//! | `GET/POST /api/alerts` | Alert log |
//! | `POST /api/alerts/:id/acknowledge` | Acknowledge an alert |
//! | `DELETE /api/alerts/:id` | Delete an alert |
//! | `GET /ws` | Viewer WebSocket |
//! | everything else | Static viewer files |
//!
//! When `ws_port` is set, a second listener upgrades WebSocket requests on
//! any path, for viewers that connect straight to `ws://host:9999`.

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::alerts::AlertStore;
use crate::config::ServerConfig;
use crate::error::Error;
use crate::stream::StreamSupervisor;
use crate::web::{handlers, websocket};

/// Shared state passed to all request handlers
pub struct AppState {
    pub supervisor: StreamSupervisor,
    pub alerts: Arc<AlertStore>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(supervisor: StreamSupervisor, alerts: Arc<AlertStore>) -> Self {
        Self {
            supervisor,
            alerts,
            started_at: Instant::now(),
        }
    }
}

/// Web server for the control API, viewer page and viewer sockets
pub struct WebServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: ServerConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Router for the main HTTP port
    pub fn router(&self) -> Router {
        let api = Router::new()
            .route("/status", get(handlers::get_status))
            .route(
                "/alerts",
                get(handlers::list_alerts).post(handlers::create_alert),
            )
            .route("/alerts/:id", delete(handlers::delete_alert))
            .route("/alerts/:id/acknowledge", post(handlers::acknowledge_alert));

        let static_files =
            ServeDir::new(&self.config.static_dir).append_index_html_on_directories(true);

        Router::new()
            .route("/stream-status", get(handlers::stream_status))
            .route("/restart-stream", post(handlers::restart_stream))
            .route("/ws", get(websocket::ws_handler))
            .nest("/api", api)
            .fallback_service(static_files)
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Router for the dedicated WebSocket port
    pub fn ws_router(&self) -> Router {
        Router::new()
            .fallback(websocket::ws_handler)
            .with_state(self.state.clone())
    }

    fn addr(&self, port: u16) -> Result<SocketAddr, Error> {
        format!("{}:{}", self.config.bind_address, port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid bind address: {}", e)))
    }

    /// Serve until `shutdown` flips to true
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let http_addr = self.addr(self.config.http_port)?;
        let http_listener = TcpListener::bind(http_addr).await?;
        tracing::info!("Web UI available at http://{}", http_addr);

        let http = axum::serve(http_listener, self.router())
            .with_graceful_shutdown(wait_for(shutdown.clone()));

        match self.config.ws_port {
            Some(port) => {
                let ws_addr = self.addr(port)?;
                let ws_listener = TcpListener::bind(ws_addr).await?;
                tracing::info!("WebSocket server listening on ws://{}", ws_addr);

                let ws = axum::serve(ws_listener, self.ws_router())
                    .with_graceful_shutdown(wait_for(shutdown));

                tokio::try_join!(
                    async { http.await.map_err(Error::from) },
                    async { ws.await.map_err(Error::from) },
                )?;
            }
            None => http.await?,
        }

        tracing::info!("Web server stopped");
        Ok(())
    }
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
