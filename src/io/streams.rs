//! `std::io` adapters handed to request handlers.
//!
//! - [`InputStream`] reads STDIN or DATA from a request buffer
//! - [`OutputStream`] turns writes into STDOUT or STDERR records, one page
//!   per record, through the connection's output pipeline

use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::sync::Arc;

use bytes::Bytes;

use super::output::OutputPipeline;
use super::reader::BufferReader;
use crate::memory::{Buffer, Page};
use crate::protocol::RecordType;

/// Handler-side view of an input stream.
pub struct InputStream {
    reader: BufferReader,
}

impl InputStream {
    pub fn new(buffer: Arc<Buffer>) -> Self {
        Self {
            reader: BufferReader::new(buffer),
        }
    }

    /// Next chunk of at most `max` bytes without copying. Empty at end of stream.
    pub fn read_chunk(&mut self, max: usize) -> io::Result<Bytes> {
        self.reader.next_chunk(max).map_err(|e| e.into_io())
    }

    /// Length the stream is currently bounded by.
    pub fn expected_len(&self) -> usize {
        self.reader.buffer().max_size()
    }
}

impl Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let chunk = self.read_chunk(buf.len())?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}

impl BufRead for InputStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.reader.fill_buf().map_err(|e| e.into_io())
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt);
    }
}

impl fmt::Debug for InputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputStream")
            .field("buffer", self.reader.buffer())
            .finish()
    }
}

/// Handler-side view of an output stream.
///
/// Bytes collect in a page from the pipeline's page pool. A full page (or a
/// flush) becomes one record: the page is shared with the write task and
/// freed back to the pool with that task's completion flag.
pub struct OutputStream {
    pipeline: Arc<OutputPipeline>,
    record_type: RecordType,
    request_id: u16,
    page: Option<Page>,
    filled: usize,
}

impl OutputStream {
    pub fn new(pipeline: Arc<OutputPipeline>, record_type: RecordType, request_id: u16) -> Self {
        Self {
            pipeline,
            record_type,
            request_id,
            page: None,
            filled: 0,
        }
    }

    /// Record type this stream emits.
    #[inline]
    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    fn send_page(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };
        let len = std::mem::take(&mut self.filled);
        let shared = page.share();
        let task_page = shared.clone();
        let (record_type, request_id) = (self.record_type, self.request_id);

        let completion = self.pipeline.add(move |writer| {
            writer.write_record(record_type, request_id, &task_page.as_slice()[..len])
        });
        self.pipeline.page_pool().free_page(shared, Some(completion));
    }

    /// Flush and send the empty record that ends this stream.
    pub fn finish(&mut self) {
        self.send_page();
        self.pipeline
            .send_record(self.record_type, self.request_id, Bytes::new());
    }
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let pool = self.pipeline.page_pool();
        let page = self.page.get_or_insert_with(|| pool.new_page());
        let room = page.len() - self.filled;
        let n = room.min(buf.len());
        page.as_mut_slice()[self.filled..self.filled + n].copy_from_slice(&buf[..n]);
        self.filled += n;

        if self.filled == page.len() {
            self.send_page();
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.filled > 0 {
            self.send_page();
        }
        Ok(())
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        if self.filled > 0 {
            self.send_page();
        } else if let Some(page) = self.page.take() {
            self.pipeline.page_pool().free_page(page, None);
        }
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("record_type", &self.record_type)
            .field("request_id", &self.request_id)
            .field("buffered", &self.filled)
            .finish()
    }
}
