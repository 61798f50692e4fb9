//! Transcode session
//!
//! A session is one live transcoder invocation: the process handle, its
//! output stream and the demuxer reading that stream. The output is read on
//! a dedicated task which pushes [`SessionEvent`]s, tagged with the session
//! id, to the supervisor. A session is never restarted; the supervisor
//! creates a fresh one with an empty buffer instead.

use std::fmt;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::demux::FrameDemuxer;
use super::frame::Frame;
use crate::error::SessionError;

/// Monotonic session identifier, unique for the supervisor's lifetime
pub type SessionId = u64;

/// Byte stream produced by the transcoder
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Something that can launch the external transcoder
pub trait Transcoder: Send + Sync + 'static {
    fn spawn(&self) -> Result<SpawnedTranscoder, SessionError>;
}

/// Control over a launched transcoder process
pub trait ProcessHandle: Send {
    /// OS process id, if known
    fn pid(&self) -> Option<u32>;

    /// Forcibly terminate the process. Must be safe to call more than once.
    fn kill(&mut self);
}

/// A freshly launched transcoder
pub struct SpawnedTranscoder {
    pub output: OutputStream,
    pub process: Box<dyn ProcessHandle>,
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Process launched, no frame seen yet
    Starting,
    /// Frames are flowing
    Running,
    Stopping,
    Terminated,
}

/// Why a session's output ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The transcoder closed its output
    EndOfStream,
    /// Reading the output failed
    ReadFailed(String),
    /// No frame boundary within the buffer limit
    BufferOverflow { size: usize, limit: usize },
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::EndOfStream => write!(f, "output stream ended"),
            ExitReason::ReadFailed(e) => write!(f, "read failed: {}", e),
            ExitReason::BufferOverflow { size, limit } => {
                write!(f, "frame buffer overflow ({} of {} bytes)", size, limit)
            }
        }
    }
}

/// Events sent from a session's reader task
#[derive(Debug)]
pub enum SessionEvent {
    /// Frames completed by one output chunk, in stream order
    Frames {
        session: SessionId,
        frames: Vec<Frame>,
    },
    /// The session is dead. Sent at most once per session.
    Exited {
        session: SessionId,
        reason: ExitReason,
    },
}

impl SessionEvent {
    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::Frames { session, .. } | SessionEvent::Exited { session, .. } => *session,
        }
    }
}

/// One live transcoder invocation
pub struct TranscodeSession {
    id: SessionId,
    status: SessionStatus,
    process: Option<Box<dyn ProcessHandle>>,
    reader: Option<JoinHandle<()>>,
    started_at: Instant,
}

impl TranscodeSession {
    /// Launch the transcoder and start reading its output.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        id: SessionId,
        transcoder: &dyn Transcoder,
        events: mpsc::Sender<SessionEvent>,
        max_buffer: usize,
        read_chunk_size: usize,
    ) -> Result<Self, SessionError> {
        let SpawnedTranscoder { output, process } = transcoder.spawn()?;

        tracing::info!(session = id, pid = ?process.pid(), "Transcode session started");

        let demuxer = FrameDemuxer::new(max_buffer);
        let reader = tokio::spawn(read_output(id, output, demuxer, events, read_chunk_size));

        Ok(Self {
            id,
            status: SessionStatus::Starting,
            process: Some(process),
            reader: Some(reader),
            started_at: Instant::now(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_terminated(&self) -> bool {
        self.status == SessionStatus::Terminated
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Record that frames are flowing
    pub fn mark_running(&mut self) {
        if self.status == SessionStatus::Starting {
            self.status = SessionStatus::Running;
        }
    }

    /// Kill the process and release its output. No-op once terminated.
    pub fn stop(&mut self) {
        if self.status == SessionStatus::Terminated {
            return;
        }
        self.status = SessionStatus::Stopping;

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut process) = self.process.take() {
            process.kill();
        }

        self.status = SessionStatus::Terminated;
        tracing::info!(
            session = self.id,
            uptime_secs = self.started_at.elapsed().as_secs(),
            "Transcode session stopped"
        );
    }
}

impl Drop for TranscodeSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reader task: stdout chunks → demuxer → session events
async fn read_output(
    id: SessionId,
    mut output: OutputStream,
    mut demuxer: FrameDemuxer,
    events: mpsc::Sender<SessionEvent>,
    read_chunk_size: usize,
) {
    let mut buf = vec![0u8; read_chunk_size.max(1)];
    let mut chunks = 0u64;

    let reason = loop {
        match output.read(&mut buf).await {
            Ok(0) => break ExitReason::EndOfStream,
            Ok(n) => {
                chunks += 1;
                match demuxer.push(&buf[..n]) {
                    Ok(frames) if frames.is_empty() => {}
                    Ok(frames) => {
                        let event = SessionEvent::Frames {
                            session: id,
                            frames,
                        };
                        if events.send(event).await.is_err() {
                            tracing::debug!(session = id, "Supervisor gone, stopping reader");
                            return;
                        }
                    }
                    Err(SessionError::BufferOverflow { size, limit }) => {
                        break ExitReason::BufferOverflow { size, limit };
                    }
                    Err(e) => break ExitReason::ReadFailed(e.to_string()),
                }
            }
            Err(e) => break ExitReason::ReadFailed(e.to_string()),
        }
    };

    let stats = demuxer.stats();
    tracing::debug!(
        session = id,
        chunks,
        frames = stats.frames_emitted,
        discarded = stats.bytes_discarded,
        "Transcoder output closed"
    );

    let _ = events.send(SessionEvent::Exited { session: id, reason }).await;
}
