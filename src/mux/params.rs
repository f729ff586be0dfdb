//! Request parameters decoded from the PARAMS stream.
//!
//! Names and values are raw bytes; the engine only frames and stores them.
//! Insertion order is kept and a repeated name overwrites the earlier value
//! in place.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use crate::error::{FcgiError, Result};
use crate::io::BufferReader;
use crate::protocol::read_pair;

/// Well-known parameter names.
pub mod keys {
    pub const CONTENT_LENGTH: &str = "CONTENT_LENGTH";
    pub const CONTENT_TYPE: &str = "CONTENT_TYPE";
    /// Length of the DATA stream for the filter role.
    pub const FCGI_DATA_LENGTH: &str = "FCGI_DATA_LENGTH";
    pub const REQUEST_URI: &str = "REQUEST_URI";
    pub const QUERY_STRING: &str = "QUERY_STRING";
    pub const DOCUMENT_URI: &str = "DOCUMENT_URI";
    pub const DOCUMENT_ROOT: &str = "DOCUMENT_ROOT";
    pub const REMOTE_ADDR: &str = "REMOTE_ADDR";
    pub const REMOTE_PORT: &str = "REMOTE_PORT";
    pub const SCRIPT_FILENAME: &str = "SCRIPT_FILENAME";
    pub const HTTP_HOST: &str = "HTTP_HOST";
    pub const REQUEST_METHOD: &str = "REQUEST_METHOD";
}

/// Ordered name to value map.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(Bytes, Bytes)>,
    index: HashMap<Bytes, usize>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode every pair in a complete PARAMS body.
    ///
    /// A truncated trailing pair is dropped with a warning.
    pub fn parse(mut body: Bytes) -> Self {
        let mut params = Self::new();
        while !body.is_empty() {
            match read_pair(&mut body) {
                Ok((name, value)) => params.insert(name, value),
                Err(e) => {
                    tracing::warn!("truncated params stream: {}", e);
                    break;
                }
            }
        }
        params
    }

    /// Decode pairs from a PARAMS buffer until its end of stream.
    ///
    /// Pairs cut short because the buffer overflowed are dropped with a
    /// warning; interruption is returned as an error.
    pub fn read_from(reader: &mut BufferReader) -> Result<Self> {
        let mut params = Self::new();
        loop {
            if reader.fill_buf()?.is_empty() {
                return Ok(params);
            }
            match read_pair(reader) {
                Ok((name, value)) => params.insert(name, value),
                Err(FcgiError::Framing(e)) => {
                    tracing::warn!("truncated params stream: {}", e);
                    return Ok(params);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Insert a pair, overwriting an earlier value of the same name.
    pub fn insert(&mut self, name: Bytes, value: Bytes) {
        match self.index.get(&name) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, value));
            }
        }
    }

    /// Raw value of `name`.
    pub fn get(&self, name: impl AsRef<[u8]>) -> Option<&[u8]> {
        self.index
            .get(name.as_ref())
            .map(|&i| self.entries[i].1.as_ref())
    }

    /// Value of `name`, if present and valid UTF-8.
    pub fn get_str(&self, name: impl AsRef<[u8]>) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, name: impl AsRef<[u8]>) -> bool {
        self.index.contains_key(name.as_ref())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pairs in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(n, v)| (n.as_ref(), v.as_ref()))
    }

    /// Decimal length announced by `name`.
    ///
    /// Missing means 0. An unparsable value is logged and also means 0.
    pub fn length(&self, name: &str) -> usize {
        let Some(raw) = self.get(name) else {
            return 0;
        };
        match std::str::from_utf8(raw).ok().and_then(|s| s.trim().parse().ok()) {
            Some(len) => len,
            None => {
                tracing::warn!(
                    "invalid {} value {:?}; assuming 0",
                    name,
                    String::from_utf8_lossy(raw)
                );
                0
            }
        }
    }

    /// Length of STDIN announced by CONTENT_LENGTH.
    pub fn content_length(&self) -> usize {
        self.length(keys::CONTENT_LENGTH)
    }

    /// Length of DATA announced by FCGI_DATA_LENGTH.
    pub fn data_length(&self) -> usize {
        self.length(keys::FCGI_DATA_LENGTH)
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.iter()
                    .map(|(n, v)| (String::from_utf8_lossy(n), String::from_utf8_lossy(v))),
            )
            .finish()
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = (&'a [u8], &'a [u8]);
    type IntoIter = Box<dyn Iterator<Item = (&'a [u8], &'a [u8])> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Buffer;
    use crate::protocol::encode_pairs;
    use std::sync::Arc;

    fn body(pairs: &[(&str, &str)]) -> Bytes {
        encode_pairs(pairs.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes()))).unwrap()
    }

    #[test]
    fn test_parse_keeps_order() {
        let params = Params::parse(body(&[("B", "2"), ("A", "1"), ("C", "3")]));
        let names: Vec<&[u8]> = params.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec![&b"B"[..], &b"A"[..], &b"C"[..]]);
    }

    #[test]
    fn test_duplicate_overwrites_in_place() {
        let params = Params::parse(body(&[("A", "1"), ("B", "2"), ("A", "3")]));
        assert_eq!(params.len(), 2);
        assert_eq!(params.get_str("A"), Some("3"));
        assert_eq!(params.iter().next().unwrap().0, b"A");
    }

    #[test]
    fn test_truncated_tail_dropped() {
        let full = body(&[("KEEP", "yes"), ("LOST", "value")]);
        let params = Params::parse(full.slice(..full.len() - 2));
        assert_eq!(params.len(), 1);
        assert!(params.contains("KEEP"));
        assert!(!params.contains("LOST"));
    }

    #[test]
    fn test_content_length() {
        let params = Params::parse(body(&[(keys::CONTENT_LENGTH, "42")]));
        assert_eq!(params.content_length(), 42);
        assert_eq!(params.data_length(), 0);

        let bad = Params::parse(body(&[(keys::CONTENT_LENGTH, "lots")]));
        assert_eq!(bad.content_length(), 0);
    }

    #[test]
    fn test_read_from_buffer() {
        let buffer = Arc::new(Buffer::new(4, 1024));
        buffer
            .begin_writing()
            .write(&body(&[(keys::REQUEST_METHOD, "GET"), (keys::QUERY_STRING, "")]));
        buffer.close();

        let params = Params::read_from(&mut BufferReader::new(buffer)).unwrap();
        assert_eq!(params.get_str(keys::REQUEST_METHOD), Some("GET"));
        assert_eq!(params.get(keys::QUERY_STRING), Some(&b""[..]));
    }

    #[test]
    fn test_read_from_overflowed_buffer() {
        let encoded = body(&[("FIRST", "1"), ("SECOND", "a long value")]);
        let buffer = Arc::new(Buffer::new(4, 10));
        buffer.begin_writing().write(&encoded);
        buffer.close();

        let params = Params::read_from(&mut BufferReader::new(buffer)).unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params.get_str("FIRST"), Some("1"));
    }

    #[test]
    fn test_read_from_oversized_length_claim() {
        let buffer = Arc::new(Buffer::new(4, 1024));
        buffer
            .begin_writing()
            .write(&[0xFF, 0xFF, 0xFF, 0xFF, 0x00, b'a', b'b', b'c']);
        buffer.close();

        let params = Params::read_from(&mut BufferReader::new(buffer)).unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn test_read_from_interrupted() {
        let buffer = Arc::new(Buffer::new(4, 10));
        buffer.interrupt_all_waiting();
        assert!(matches!(
            Params::read_from(&mut BufferReader::new(buffer)),
            Err(FcgiError::Interrupted)
        ));
    }
}
