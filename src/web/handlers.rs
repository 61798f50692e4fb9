//! HTTP API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::alerts::{Alert, NewAlert};
use crate::error::AlertError;
use crate::stream::broadcaster::SubscriberInfo;
use crate::stream::{RestartOutcome, StreamStatus};
use crate::web::server::AppState;

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// `GET /stream-status` body
#[derive(Serialize)]
pub struct StreamStatusResponse {
    /// `"active"` while a transcoder process exists
    pub status: &'static str,
    pub clients: usize,
    pub message: String,
}

/// `POST /restart-stream` body
#[derive(Serialize)]
pub struct RestartResponse {
    pub success: bool,
    pub message: String,
}

/// Full relay status
#[derive(Serialize)]
pub struct SystemStatus {
    pub stream: StreamStatus,
    pub subscribers: Vec<SubscriberInfo>,
    pub uptime_seconds: u64,
}

/// Get stream status
pub async fn stream_status(State(state): State<Arc<AppState>>) -> Json<StreamStatusResponse> {
    let status = state.supervisor.status();
    let (label, running) = if status.active {
        ("active", "running")
    } else {
        ("inactive", "not running")
    };

    Json(StreamStatusResponse {
        status: label,
        clients: status.clients,
        message: format!(
            "Stream service {}, {} client(s) connected",
            running, status.clients
        ),
    })
}

/// Restart the transcoder
pub async fn restart_stream(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RestartResponse>) {
    match state.supervisor.restart().await {
        RestartOutcome::Restarted => (
            StatusCode::OK,
            Json(RestartResponse {
                success: true,
                message: "Stream service restarted".to_string(),
            }),
        ),
        RestartOutcome::NoSubscribers => (
            StatusCode::OK,
            Json(RestartResponse {
                success: true,
                message: "Stream service stopped; it starts again when a viewer connects"
                    .to_string(),
            }),
        ),
        RestartOutcome::Stopped => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(RestartResponse {
                success: false,
                message: "Relay is shutting down".to_string(),
            }),
        ),
    }
}

/// Get full relay status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    let status = SystemStatus {
        stream: state.supervisor.status(),
        subscribers: state.supervisor.broadcaster().subscribers(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    };

    Json(ApiResponse::ok(status))
}

/// Get all alerts
pub async fn list_alerts(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<Alert>>> {
    Json(ApiResponse::ok(state.alerts.list().await))
}

/// Record a new alert
pub async fn create_alert(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewAlert>,
) -> (StatusCode, Json<ApiResponse<Alert>>) {
    if new.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("message must not be empty")),
        );
    }

    match state.alerts.create(new).await {
        Ok(alert) => (StatusCode::CREATED, Json(ApiResponse::ok(alert))),
        Err(e) => alert_failure(e),
    }
}

/// Acknowledge an alert
pub async fn acknowledge_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse<Alert>>) {
    match state.alerts.acknowledge(id).await {
        Ok(alert) => (StatusCode::OK, Json(ApiResponse::ok(alert))),
        Err(e) => alert_failure(e),
    }
}

/// Delete an alert
pub async fn delete_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state.alerts.delete(id).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Err(e) => alert_failure(e),
    }
}

fn alert_failure<T>(e: AlertError) -> (StatusCode, Json<ApiResponse<T>>) {
    let status = match e {
        AlertError::NotFound(_) => StatusCode::NOT_FOUND,
        AlertError::Persistence(_) | AlertError::Serialization(_) => {
            tracing::error!(error = %e, "Alert log operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ApiResponse::error(e.to_string())))
}
