//! # Camera Relay
//!
//! On-demand relay of a network camera to any number of live viewers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐  RTSP/TCP   ┌──────────────────────────────────────────────┐
//! │ IP camera    │────────────▶│ ffmpeg (stream::transcoder)                  │
//! └──────────────┘             │   -an -c:v mjpeg -q:v 5 -r 15 image2pipe     │
//!                              └──────────────────────┬───────────────────────┘
//!                                                     │ stdout byte chunks
//!                                                     ▼
//!                              ┌──────────────────────────────────────────────┐
//!                              │ TranscodeSession reader task                 │
//!                              │   FrameDemuxer: FFD8 ... FFD9 → Frame        │
//!                              └──────────────────────┬───────────────────────┘
//!                                                     │ SessionEvent (mpsc)
//!                                                     ▼
//!   subscribe / unsubscribe    ┌──────────────────────────────────────────────┐
//!  ───────────────────────────▶│ StreamSupervisor                             │
//!                              │   Idle → Starting → Streaming → Restarting   │
//!                              │   Broadcaster (DashMap of bounded queues)    │
//!                              └──────┬───────────────┬───────────────┬───────┘
//!                                     ▼               ▼               ▼
//!                               [WebSocket]     [WebSocket]     [WebSocket]
//! ```
//!
//! The transcoder runs only while at least one viewer is attached. Every
//! WebSocket message is exactly one JPEG image, start marker through end
//! marker, with no extra framing.

pub mod alerts;
pub mod config;
pub mod error;
pub mod stream;
pub mod web;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Camera source used when no configuration is given
    pub const DEFAULT_SOURCE_URL: &str = "rtsp://192.168.0.110:8554/ID001";

    /// Default HTTP port for the control API and viewer page
    pub const DEFAULT_HTTP_PORT: u16 = 3000;

    /// Default dedicated WebSocket port
    pub const DEFAULT_WS_PORT: u16 = 9999;

    /// Default motion-JPEG quality (`-q:v`, lower is better)
    pub const DEFAULT_QUALITY: u8 = 5;

    /// Default output frame rate
    pub const DEFAULT_FRAME_RATE: u32 = 15;

    /// Delay before re-spawning a transcoder that exited on its own
    pub const DEFAULT_RESTART_DELAY_MS: u64 = 5_000;

    /// Pause between stop and start for an operator-requested restart
    pub const DEFAULT_MANUAL_RESTART_DELAY_MS: u64 = 1_000;

    /// Accumulation buffer cap before a session is declared broken
    pub const DEFAULT_MAX_FRAME_BUFFER: usize = 8 * 1024 * 1024;

    /// Frames queued per subscriber before frames are dropped for it
    pub const DEFAULT_SUBSCRIBER_QUEUE_DEPTH: usize = 8;

    /// Capacity of the session → supervisor event channel
    pub const DEFAULT_EVENT_QUEUE_DEPTH: usize = 64;

    /// Size of a single read from the transcoder's stdout
    pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;
}
