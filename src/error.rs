//! Error types for the camera relay

use thiserror::Error;
use uuid::Uuid;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Subscriber error: {0}")]
    Subscriber(#[from] SubscriberError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transcode session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to launch transcoder: {0}")]
    Spawn(String),

    #[error("Transcoder output stream is not available")]
    MissingOutput,

    #[error("Frame buffer overflow: {size} bytes without a frame boundary (limit {limit})")]
    BufferOverflow { size: usize, limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-subscriber delivery failures
///
/// These never leave the broadcaster; they only decide whether a subscriber
/// is dropped or merely skips a frame.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberError {
    #[error("Subscriber connection closed")]
    Closed,

    #[error("Subscriber queue full")]
    Lagging,
}

/// Stream supervisor errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Relay is shutting down")]
    ShuttingDown,
}

/// Alert log errors
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Alert not found: {0}")]
    NotFound(Uuid),

    #[error("Failed to persist alerts: {0}")]
    Persistence(String),

    #[error("Invalid alert data: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
