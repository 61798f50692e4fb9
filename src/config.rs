//! Relay configuration
//!
//! Loaded from a TOML file. Every section has defaults, so a file only needs
//! to name what it changes:
//!
//! ```toml
//! [source]
//! url = "rtsp://10.0.0.12:8554/front-door"
//!
//! [supervisor]
//! restart_delay_ms = 2000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::Error;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub transcoder: TranscoderConfig,
    pub supervisor: SupervisorConfig,
    pub server: ServerConfig,
    pub alerts: AlertsConfig,
}

/// Camera source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Stream URL handed to the transcoder as its input
    pub url: String,
    /// RTSP lower transport (`tcp` keeps frames intact on lossy links)
    pub rtsp_transport: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SOURCE_URL.to_string(),
            rtsp_transport: "tcp".to_string(),
        }
    }
}

/// External transcoder invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    /// Path or name of the ffmpeg executable
    pub ffmpeg_path: PathBuf,
    /// MJPEG quality scale, 2 (best) to 31 (worst)
    pub quality: u8,
    /// Output frames per second
    pub frame_rate: u32,
    /// ffmpeg `-loglevel`
    pub log_level: String,
    /// Bytes requested per stdout read
    pub read_chunk_size: usize,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            quality: DEFAULT_QUALITY,
            frame_rate: DEFAULT_FRAME_RATE,
            log_level: "error".to_string(),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

/// Session lifecycle and fan-out tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Backoff before re-spawning after an unexpected exit or spawn failure
    pub restart_delay_ms: u64,
    /// Pause between stop and start for `POST /restart-stream`
    pub manual_restart_delay_ms: u64,
    /// Accumulation buffer cap in bytes
    pub max_frame_buffer: usize,
    /// Frames queued per subscriber
    pub subscriber_queue_depth: usize,
    /// Capacity of the session event channel
    pub event_queue_depth: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
            manual_restart_delay_ms: DEFAULT_MANUAL_RESTART_DELAY_MS,
            max_frame_buffer: DEFAULT_MAX_FRAME_BUFFER,
            subscriber_queue_depth: DEFAULT_SUBSCRIBER_QUEUE_DEPTH,
            event_queue_depth: DEFAULT_EVENT_QUEUE_DEPTH,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn manual_restart_delay(&self) -> Duration {
        Duration::from_millis(self.manual_restart_delay_ms)
    }

    /// Set the crash backoff
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the operator restart pause
    pub fn with_manual_restart_delay(mut self, delay: Duration) -> Self {
        self.manual_restart_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the accumulation buffer cap
    pub fn with_max_frame_buffer(mut self, bytes: usize) -> Self {
        self.max_frame_buffer = bytes;
        self
    }

    /// Set the per-subscriber queue depth
    pub fn with_subscriber_queue_depth(mut self, depth: usize) -> Self {
        self.subscriber_queue_depth = depth;
        self
    }
}

/// HTTP and WebSocket listeners
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub http_port: u16,
    /// Dedicated WebSocket listener; `None` leaves only the `/ws` route
    pub ws_port: Option<u16>,
    /// Directory served as the viewer UI
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: DEFAULT_HTTP_PORT,
            ws_port: Some(DEFAULT_WS_PORT),
            static_dir: PathBuf::from("public"),
        }
    }
}

/// Alert log persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub path: PathBuf,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("alerts.json"),
        }
    }
}

impl AppConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Load from `path` if given, else from the per-user config file if it
    /// exists, else fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, Error> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!(path = %path.display(), "Loading configuration");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Per-user config location, e.g. `~/.config/camera-relay/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "camera-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.source.url.trim().is_empty() {
            return Err(Error::Config("source.url must not be empty".into()));
        }
        if self.transcoder.frame_rate == 0 {
            return Err(Error::Config("transcoder.frame_rate must be positive".into()));
        }
        if !(2..=31).contains(&self.transcoder.quality) {
            return Err(Error::Config(format!(
                "transcoder.quality must be within 2..=31, got {}",
                self.transcoder.quality
            )));
        }
        if self.transcoder.read_chunk_size == 0 {
            return Err(Error::Config("transcoder.read_chunk_size must be positive".into()));
        }
        if self.supervisor.max_frame_buffer == 0 {
            return Err(Error::Config("supervisor.max_frame_buffer must be positive".into()));
        }
        if self.supervisor.subscriber_queue_depth == 0 || self.supervisor.event_queue_depth == 0 {
            return Err(Error::Config("supervisor queue depths must be positive".into()));
        }
        if self.server.ws_port == Some(self.server.http_port) {
            return Err(Error::Config(
                "server.ws_port must differ from server.http_port".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.http_port, 3000);
        assert_eq!(config.server.ws_port, Some(9999));
        assert_eq!(config.supervisor.restart_delay(), Duration::from_secs(5));
        assert_eq!(config.source.rtsp_transport, "tcp");
    }

    #[test]
    fn test_partial_toml() {
        let config = AppConfig::from_toml(
            r#"
            [source]
            url = "rtsp://10.0.0.12:8554/cam"

            [supervisor]
            restart_delay_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.source.url, "rtsp://10.0.0.12:8554/cam");
        assert_eq!(config.source.rtsp_transport, "tcp");
        assert_eq!(config.supervisor.restart_delay(), Duration::from_millis(250));
        assert_eq!(config.transcoder.frame_rate, DEFAULT_FRAME_RATE);
    }

    #[test]
    fn test_rejects_bad_quality() {
        let result = AppConfig::from_toml("[transcoder]\nquality = 40\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_port_clash() {
        let result = AppConfig::from_toml("[server]\nhttp_port = 8080\nws_port = 8080\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
