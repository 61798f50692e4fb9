//! Stream relay core
//!
//! Transcoder supervision, frame demultiplexing and subscriber fan-out.

pub mod broadcaster;
pub mod demux;
pub mod frame;
pub mod session;
pub mod supervisor;
pub mod transcoder;

pub use broadcaster::{Broadcaster, SubscriberId, Subscription};
pub use demux::FrameDemuxer;
pub use frame::Frame;
pub use session::{SessionEvent, TranscodeSession, Transcoder};
pub use supervisor::{RestartOutcome, StreamStatus, StreamSupervisor, SupervisorState};
pub use transcoder::FfmpegTranscoder;
