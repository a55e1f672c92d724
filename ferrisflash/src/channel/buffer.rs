//! Pattern buffer with tail-search optimization.
//!
//! Only the last N bytes of the buffer are searched for prompt patterns,
//! rather than the entire output. Firmware transfers print long progress
//! logs, so searching the whole buffer on every chunk would be quadratic.

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;

/// Buffer for accumulating shell output and searching it for patterns.
///
/// Matched output is split off the front with [`take_through`](Self::take_through);
/// anything the device sent after the match stays buffered for the next read.
#[derive(Debug)]
pub struct PatternBuffer {
    /// The accumulated output buffer.
    buffer: BytesMut,

    /// How many bytes from the end to search for patterns.
    search_depth: usize,
}

impl PatternBuffer {
    /// Create a new pattern buffer with the specified search depth.
    pub fn new(search_depth: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            search_depth,
        }
    }

    /// Extend the buffer with new data, stripping ANSI escape codes.
    pub fn extend(&mut self, data: &[u8]) {
        let cleaned = strip_ansi_escapes::strip(data);
        self.buffer.extend_from_slice(&cleaned);
    }

    /// Search the tail of the buffer for the pattern.
    ///
    /// Returns the absolute end offset of the first match in the tail.
    pub fn search_tail(&self, pattern: &Regex) -> Option<usize> {
        let mut start = self.buffer.len().saturating_sub(self.search_depth);
        // A tail cut mid-line would let `^` match a line fragment
        if start > 0 && self.buffer[start - 1] != b'\n' {
            if let Some(pos) = memchr::memchr(b'\n', &self.buffer[start..]) {
                start += pos + 1;
            }
        }
        pattern.find(&self.buffer[start..]).map(|m| start + m.end())
    }

    /// Split off everything up to `end`, leaving the rest buffered.
    pub fn take_through(&mut self, end: usize) -> Bytes {
        let end = end.min(self.buffer.len());
        self.buffer.split_to(end).freeze()
    }

    /// Take ownership of the buffer contents and reset.
    pub fn take(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    /// Get the buffer contents as a string (lossy UTF-8 conversion).
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.buffer)
    }

    /// Get the current buffer length.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for PatternBuffer {
    fn default() -> Self {
        Self::new(1000)
    }
}
