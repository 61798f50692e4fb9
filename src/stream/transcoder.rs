//! ffmpeg transcoder
//!
//! Pulls the camera stream over RTSP/TCP and writes a motion-JPEG image
//! stream (`image2pipe`) to stdout. Audio is disabled, frame rate and quality
//! are pinned by configuration.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use super::session::{ProcessHandle, SpawnedTranscoder, Transcoder};
use crate::config::{SourceConfig, TranscoderConfig};
use crate::error::SessionError;

/// Launches ffmpeg with a fixed MJPEG output profile
pub struct FfmpegTranscoder {
    source: SourceConfig,
    config: TranscoderConfig,
}

impl FfmpegTranscoder {
    pub fn new(source: SourceConfig, config: TranscoderConfig) -> Self {
        Self { source, config }
    }

    /// Command-line arguments, in order
    pub fn args(&self) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            self.config.log_level.clone(),
            "-rtsp_transport".to_string(),
            self.source.rtsp_transport.clone(),
            "-i".to_string(),
            self.source.url.clone(),
            "-an".to_string(), // No audio
            "-c:v".to_string(),
            "mjpeg".to_string(),
            "-q:v".to_string(),
            self.config.quality.to_string(),
            "-r".to_string(),
            self.config.frame_rate.to_string(),
            "-f".to_string(),
            "image2pipe".to_string(),
            "pipe:1".to_string(), // Write to stdout
        ]
    }
}

impl Transcoder for FfmpegTranscoder {
    fn spawn(&self) -> Result<SpawnedTranscoder, SessionError> {
        let args = self.args();
        tracing::debug!(
            program = %self.config.ffmpeg_path.display(),
            ?args,
            "Launching transcoder"
        );

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SessionError::Spawn(format!(
                    "{}: {}. Is ffmpeg installed?",
                    self.config.ffmpeg_path.display(),
                    e
                ))
            })?;

        let stdout = child.stdout.take().ok_or(SessionError::MissingOutput)?;

        // Drain stderr so ffmpeg never blocks on a full pipe
        if let Some(stderr) = child.stderr.take() {
            let pid = child.id();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(pid = ?pid, "ffmpeg: {}", line);
                }
            });
        }

        Ok(SpawnedTranscoder {
            output: Box::new(stdout),
            process: Box::new(ChildProcess { child: Some(child) }),
        })
    }
}

/// A running ffmpeg child
struct ChildProcess {
    child: Option<Child>,
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }

    fn kill(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "Transcoder already exited");
        }

        // Reap in the background so no zombie is left behind. Outside a
        // runtime, kill_on_drop and Tokio's orphan reaper take over.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                match child.wait().await {
                    Ok(status) => tracing::debug!(%status, "Transcoder reaped"),
                    Err(e) => tracing::warn!(error = %e, "Failed to reap transcoder"),
                }
            });
        }
    }
}
