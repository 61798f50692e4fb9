//! Motion-JPEG frame type

use bytes::Bytes;

/// JPEG start-of-image marker
pub const START_MARKER: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker
pub const END_MARKER: [u8; 2] = [0xFF, 0xD9];

/// One complete JPEG image, start marker through end marker inclusive.
///
/// Cloning is cheap: every subscriber shares the same allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
    /// Position in the emitting session's output, starting at 0
    sequence: u64,
}

impl Frame {
    pub fn new(data: Bytes, sequence: u64) -> Self {
        Self { data, sequence }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
