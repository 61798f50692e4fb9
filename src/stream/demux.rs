//! Motion-JPEG frame demultiplexer
//!
//! Turns the transcoder's raw stdout chunks into discrete frames. Chunk
//! boundaries are arbitrary: a frame, or even a two-byte marker, may be split
//! across any number of reads.
//!
//! Frame boundaries are found with a literal scan for `FF D8` followed by the
//! first `FF D9` after it. An `FF D9` pair inside compressed image data would
//! end the frame early; ffmpeg's MJPEG output byte-stuffs `FF` in entropy-coded
//! data, so in practice the pair only appears as a real marker.

use bytes::{Buf, BytesMut};

use super::frame::{Frame, END_MARKER, START_MARKER};
use crate::error::SessionError;

/// Incremental frame scanner with a bounded accumulation buffer
pub struct FrameDemuxer {
    /// Unprocessed bytes. When `in_frame` is set this begins with a start marker.
    buffer: BytesMut,
    in_frame: bool,
    /// Where the end-marker search resumes inside `buffer`
    scan_from: usize,
    max_buffer: usize,
    next_sequence: u64,
    bytes_discarded: u64,
}

impl FrameDemuxer {
    /// Create a demuxer that fails once `max_buffer` bytes accumulate
    /// without completing a frame
    pub fn new(max_buffer: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            in_frame: false,
            scan_from: 0,
            max_buffer,
            next_sequence: 0,
            bytes_discarded: 0,
        }
    }

    /// Append a chunk and extract every frame it completes, in stream order.
    ///
    /// After this returns the buffer holds at most one trailing partial
    /// frame. On overflow the buffer is cleared and the error is returned;
    /// the owning session treats that as fatal.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, SessionError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if !self.in_frame {
                match find_marker(&self.buffer, 0, &START_MARKER) {
                    Some(start) => {
                        self.discard(start);
                        self.in_frame = true;
                        self.scan_from = START_MARKER.len();
                    }
                    None => {
                        // A lone trailing 0xFF may be the first half of a start marker.
                        let keep = usize::from(self.buffer.last() == Some(&START_MARKER[0]));
                        self.discard(self.buffer.len() - keep);
                        break;
                    }
                }
            }

            match find_marker(&self.buffer, self.scan_from, &END_MARKER) {
                Some(end) => {
                    let data = self.buffer.split_to(end + END_MARKER.len()).freeze();
                    frames.push(Frame::new(data, self.next_sequence));
                    self.next_sequence += 1;
                    self.in_frame = false;
                    self.scan_from = 0;
                }
                None => {
                    // Re-check the last byte next time in case the end marker is split.
                    self.scan_from = self
                        .buffer
                        .len()
                        .saturating_sub(END_MARKER.len() - 1)
                        .max(START_MARKER.len());
                    break;
                }
            }
        }

        if self.buffer.len() > self.max_buffer {
            let size = self.buffer.len();
            self.reset();
            return Err(SessionError::BufferOverflow {
                size,
                limit: self.max_buffer,
            });
        }

        Ok(frames)
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.bytes_discarded += self.buffer.len() as u64;
        self.buffer.clear();
        self.in_frame = false;
        self.scan_from = 0;
    }

    /// Bytes currently held for the next call
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> DemuxStats {
        DemuxStats {
            frames_emitted: self.next_sequence,
            bytes_buffered: self.buffer.len(),
            bytes_discarded: self.bytes_discarded,
        }
    }

    fn discard(&mut self, count: usize) {
        if count > 0 {
            self.buffer.advance(count);
            self.bytes_discarded += count as u64;
        }
    }
}

/// Demuxer statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemuxStats {
    pub frames_emitted: u64,
    pub bytes_buffered: usize,
    /// Bytes outside any frame, plus partial frames lost to a reset
    pub bytes_discarded: u64,
}

/// First occurrence of `marker` at or after `from`
fn find_marker(haystack: &[u8], from: usize, marker: &[u8; 2]) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|pos| pos + from)
}
