//! Reply buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` to hold the unconsumed tail between socket reads.
//! Every push re-runs [`decode`] from the start of the tail, so a reply split
//! across any number of reads is produced exactly once, when its last byte
//! arrives.
//!
//! # Example
//!
//! ```
//! use origami_client::protocol::{ReplyBuffer, Reply};
//!
//! let mut buffer = ReplyBuffer::new();
//!
//! assert!(buffer.push(b":4").unwrap().is_empty());
//! let replies = buffer.push(b"2\r\n").unwrap();
//! assert_eq!(replies, vec![Reply::Integer(42)]);
//! ```

use bytes::{Buf, BytesMut};

use super::resp::{decode, Reply};
use crate::error::{OrigamiError, Result};

/// Default maximum number of bytes held while waiting for a reply to complete (512 MB).
pub const DEFAULT_MAX_BUFFERED: usize = 512 * 1024 * 1024;

/// Buffer for accumulating incoming bytes and extracting complete replies.
pub struct ReplyBuffer {
    /// Accumulated bytes not yet consumed by a complete reply.
    buffer: BytesMut,
    /// Maximum allowed size of an incomplete tail.
    max_buffered: usize,
}

impl ReplyBuffer {
    /// Create a new reply buffer with default settings.
    ///
    /// Default capacity: 64KB, max buffered: 512MB.
    pub fn new() -> Self {
        Self::with_max_buffered(DEFAULT_MAX_BUFFERED)
    }

    /// Create a new reply buffer with a custom limit on the incomplete tail.
    pub fn with_max_buffered(max_buffered: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_buffered,
        }
    }

    /// Push data into the buffer and extract all complete replies.
    ///
    /// Returns the replies in wire order (may be empty if still waiting for
    /// data). Incomplete data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns error if the stream contains data that can never decode, or
    /// if the incomplete tail grows past the configured limit. The buffer is
    /// cleared in both cases since its position in the stream is lost.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Reply>> {
        self.buffer.extend_from_slice(data);

        let mut replies = Vec::new();

        loop {
            match decode(&self.buffer) {
                Ok(Some((reply, consumed))) => {
                    self.buffer.advance(consumed);
                    replies.push(reply);
                }
                Ok(None) => break,
                Err(e) => {
                    self.clear();
                    return Err(e);
                }
            }
        }

        if self.buffer.len() > self.max_buffered {
            let len = self.buffer.len();
            self.clear();
            return Err(OrigamiError::Protocol(format!(
                "Incomplete reply of {} bytes exceeds maximum {}",
                len, self.max_buffered
            )));
        }

        Ok(replies)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop any buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for ReplyBuffer {
    fn default() -> Self {
        Self::new()
    }
}
