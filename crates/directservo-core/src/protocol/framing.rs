//! Line framing for the reply stream

use super::{FRAME_DELIMITER, MAX_LINE_LENGTH};

/// Buffers input and emits a line whenever a newline is encountered.
///
/// Emitted lines exclude the delimiter. A run of bytes longer than
/// `MAX_LINE_LENGTH` with no delimiter is emitted as-is so the decoder can
/// flag it as malformed instead of the buffer growing forever.
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    /// Framer with nothing buffered
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_LINE_LENGTH),
        }
    }

    /// Feed received bytes, returning every completed line
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();

        for &b in bytes {
            if b == FRAME_DELIMITER {
                lines.push(std::mem::take(&mut self.buffer));
                continue;
            }
            self.buffer.push(b);
            if self.buffer.len() >= MAX_LINE_LENGTH {
                lines.push(std::mem::take(&mut self.buffer));
            }
        }

        lines
    }

    /// Drop any partial line
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes waiting for a delimiter
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}
