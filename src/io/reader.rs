//! Sequential reader over a [`Buffer`].

use std::sync::Arc;

use bytes::{Buf, Bytes};

use crate::error::{FcgiError, Result};
use crate::memory::Buffer;
use crate::protocol::ByteSource;

/// Consumes a [`Buffer`] chunk by chunk, keeping the unread tail of the
/// last chunk.
///
/// As a [`ByteSource`] it is what the record codec reads from; running into
/// the end of the stream mid-record is a framing error there.
#[derive(Debug)]
pub struct BufferReader {
    buffer: Arc<Buffer>,
    pending: Bytes,
}

impl BufferReader {
    pub fn new(buffer: Arc<Buffer>) -> Self {
        Self {
            buffer,
            pending: Bytes::new(),
        }
    }

    /// The buffer being read.
    #[inline]
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Unread bytes, fetching the next chunk when none are left.
    ///
    /// Empty at end of stream.
    pub fn fill_buf(&mut self) -> Result<&[u8]> {
        if self.pending.is_empty() {
            self.pending = self.buffer.wait_for_input()?;
        }
        Ok(&self.pending)
    }

    /// Mark `n` bytes from [`fill_buf`](Self::fill_buf) as read.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.pending.len());
        self.pending.advance(n);
    }

    /// Up to `max` bytes, without copying. Empty at end of stream.
    pub fn next_chunk(&mut self, max: usize) -> Result<Bytes> {
        if max == 0 {
            return Ok(Bytes::new());
        }
        if self.pending.is_empty() {
            self.pending = self.buffer.wait_for_input()?;
        }
        let n = max.min(self.pending.len());
        Ok(self.pending.split_to(n))
    }
}

impl ByteSource for BufferReader {
    fn fill(&mut self, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            let chunk = self.chunk(buf.len())?;
            let (head, tail) = buf.split_at_mut(chunk.len());
            head.copy_from_slice(&chunk);
            buf = tail;
        }
        Ok(())
    }

    fn chunk(&mut self, max: usize) -> Result<Bytes> {
        let chunk = self.next_chunk(max)?;
        if chunk.is_empty() && max > 0 {
            return Err(FcgiError::Framing(format!(
                "stream ended with {} bytes outstanding",
                max
            )));
        }
        Ok(chunk)
    }
}
