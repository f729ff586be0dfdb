//! Record reading and writing.
//!
//! A record is a header followed by `content_length` bytes of content and
//! `padding_length` bytes of padding. Reading pulls from any [`ByteSource`];
//! writing goes to any `std::io::Write` sink.
//!
//! # Example
//!
//! ```
//! use fcgi_mux::protocol::{encode_record, read_record, RecordType};
//!
//! let wire = encode_record(RecordType::Stdout, 7, b"hello").unwrap();
//! assert_eq!(wire.len(), 16);
//!
//! let record = read_record(&mut &wire[..]).unwrap();
//! assert_eq!(record.header.request_id, 7);
//! assert_eq!(record.content(), b"hello");
//! ```

use std::io::Write;

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{RecordHeader, RecordType, HEADER_SIZE, MAX_CONTENT_LENGTH};
use crate::error::{FcgiError, Result};

/// Zero padding source; no record pads by more than 255 bytes.
const PADDING: [u8; 256] = [0u8; 256];

/// A pull-based source of record bytes.
///
/// Every method fails with [`FcgiError::Framing`] when the source runs dry
/// before the requested amount was produced.
pub trait ByteSource {
    /// Fill `buf` completely.
    fn fill(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Next contiguous chunk of at most `max` bytes. Never empty unless `max` is 0.
    fn chunk(&mut self, max: usize) -> Result<Bytes>;

    /// Discard exactly `n` bytes.
    fn skip_bytes(&mut self, mut n: usize) -> Result<()> {
        while n > 0 {
            n -= self.chunk(n)?.len();
        }
        Ok(())
    }

    /// Bytes the source can still deliver, when that is known up front.
    fn known_len(&self) -> Option<usize> {
        None
    }

    /// Read exactly `n` bytes into one contiguous buffer.
    ///
    /// Memory grows with the bytes actually delivered, so a length claimed
    /// by the peer never drives a large allocation on its own.
    fn take(&mut self, n: usize) -> Result<Bytes> {
        if let Some(available) = self.known_len() {
            if available < n {
                return Err(short_read(n, available));
            }
        }
        let first = self.chunk(n)?;
        if first.len() == n {
            return Ok(first);
        }
        let mut out = BytesMut::with_capacity(n.min(MAX_CONTENT_LENGTH));
        out.extend_from_slice(&first);
        while out.len() < n {
            let chunk = self.chunk(n - out.len())?;
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }
}

fn short_read(wanted: usize, available: usize) -> FcgiError {
    FcgiError::Framing(format!(
        "short read: wanted {} bytes, {} available",
        wanted, available
    ))
}

impl ByteSource for &[u8] {
    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.len() < buf.len() {
            return Err(short_read(buf.len(), self.len()));
        }
        let (head, tail) = self.split_at(buf.len());
        buf.copy_from_slice(head);
        *self = tail;
        Ok(())
    }

    fn chunk(&mut self, max: usize) -> Result<Bytes> {
        if max == 0 {
            return Ok(Bytes::new());
        }
        if self.is_empty() {
            return Err(short_read(max, 0));
        }
        let n = max.min(self.len());
        let (head, tail) = self.split_at(n);
        *self = tail;
        Ok(Bytes::copy_from_slice(head))
    }

    fn known_len(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl ByteSource for Bytes {
    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.len() < buf.len() {
            return Err(short_read(buf.len(), self.len()));
        }
        buf.copy_from_slice(&self.split_to(buf.len()));
        Ok(())
    }

    fn chunk(&mut self, max: usize) -> Result<Bytes> {
        if max == 0 {
            return Ok(Bytes::new());
        }
        if self.is_empty() {
            return Err(short_read(max, 0));
        }
        let n = max.min(self.len());
        Ok(self.split_to(n))
    }

    fn known_len(&self) -> Option<usize> {
        Some(self.len())
    }
}

/// A complete record with its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Decoded header.
    pub header: RecordHeader,
    /// Content bytes, padding stripped.
    pub content: Bytes,
}

impl Record {
    /// Get a reference to the content bytes.
    #[inline]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Record type.
    #[inline]
    pub fn record_type(&self) -> RecordType {
        self.header.record_type
    }
}

/// Read one record header.
pub fn read_header<S: ByteSource + ?Sized>(src: &mut S) -> Result<RecordHeader> {
    let mut buf = [0u8; HEADER_SIZE];
    src.fill(&mut buf)?;
    // decode only fails on short input, which fill already rules out
    RecordHeader::decode(&buf).ok_or_else(|| short_read(HEADER_SIZE, 0))
}

/// Read one full record, consuming its padding.
pub fn read_record<S: ByteSource + ?Sized>(src: &mut S) -> Result<Record> {
    let header = read_header(src)?;
    let content = src.take(header.content_length as usize)?;
    src.skip_bytes(header.padding_length as usize)?;
    Ok(Record { header, content })
}

fn checked_header(record_type: RecordType, request_id: u16, len: usize) -> Result<RecordHeader> {
    if len > MAX_CONTENT_LENGTH {
        return Err(FcgiError::Framing(format!(
            "record content of {} bytes exceeds {}",
            len, MAX_CONTENT_LENGTH
        )));
    }
    Ok(RecordHeader::new(record_type, request_id, len as u16))
}

/// Write one record: header, content, zero padding.
///
/// Content longer than 65535 bytes is rejected; callers split streams
/// into several records.
pub fn write_record<W: Write + ?Sized>(
    sink: &mut W,
    record_type: RecordType,
    request_id: u16,
    content: &[u8],
) -> Result<()> {
    let header = checked_header(record_type, request_id, content.len())?;
    sink.write_all(&header.encode())?;
    sink.write_all(content)?;
    sink.write_all(&PADDING[..header.padding_length as usize])?;
    Ok(())
}

/// Encode one record into a fresh buffer.
pub fn encode_record(record_type: RecordType, request_id: u16, content: &[u8]) -> Result<Bytes> {
    let header = checked_header(record_type, request_id, content.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + header.body_len());
    buf.put_slice(&header.encode());
    buf.put_slice(content);
    buf.put_bytes(0, header.padding_length as usize);
    Ok(buf.freeze())
}
