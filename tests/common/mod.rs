//! Shared helpers for the integration tests: an in-memory connection and
//! record builders.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use fcgi_mux::protocol::{
    encode_pairs, encode_record, read_record, BeginRequestBody, EndRequestBody, Record,
    RecordType, Role,
};
use fcgi_mux::Connection;

/// In-memory connection: serves scripted input, captures output.
pub struct MockConnection {
    input: Mutex<(Vec<u8>, usize)>,
    /// Report end of stream once the script is drained.
    eof_after_script: bool,
    output: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl MockConnection {
    /// Peer sends `script`, then closes its side.
    pub fn scripted(script: Vec<u8>) -> Arc<Self> {
        Self::new(script, true)
    }

    /// Peer sends `script` and then waits for the server to close.
    pub fn held_open(script: Vec<u8>) -> Arc<Self> {
        Self::new(script, false)
    }

    fn new(script: Vec<u8>, eof_after_script: bool) -> Arc<Self> {
        Arc::new(Self {
            input: Mutex::new((script, 0)),
            eof_after_script,
            output: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Append more peer input.
    pub fn feed(&self, bytes: &[u8]) {
        self.input.lock().0.extend_from_slice(bytes);
    }

    pub fn written(&self) -> Vec<u8> {
        self.output.lock().clone()
    }

    /// Every record the server wrote, in order.
    pub fn records(&self) -> Vec<Record> {
        parse_records(&self.written())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Connection for MockConnection {
    fn read(&self, buf: &mut [u8], _at_least: usize) -> io::Result<usize> {
        let mut input = self.input.lock();
        let (script, pos) = &mut *input;
        let n = buf.len().min(script.len() - *pos);
        buf[..n].copy_from_slice(&script[*pos..*pos + n]);
        *pos += n;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"));
        }
        self.output.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn bytes_available(&self) -> io::Result<usize> {
        let input = self.input.lock();
        let pending = input.0.len() - input.1;
        if pending > 0 {
            Ok(pending)
        } else if self.eof_after_script || self.is_closed() {
            // lets the next read observe end of stream
            Ok(1)
        } else {
            Ok(0)
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Builds a client-side byte script.
#[derive(Default)]
pub struct Script {
    bytes: Vec<u8>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(mut self, record_type: RecordType, id: u16, content: &[u8]) -> Self {
        let wire = encode_record(record_type, id, content).unwrap();
        self.bytes.extend_from_slice(&wire);
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn begin(self, id: u16, role: Role, keep_conn: bool) -> Self {
        let body = BeginRequestBody {
            role: role.code(),
            flags: if keep_conn { 1 } else { 0 },
        };
        self.record(RecordType::BeginRequest, id, &body.encode())
    }

    /// One PARAMS record with `pairs`, then the empty terminator.
    pub fn params(self, id: u16, pairs: &[(&str, &str)]) -> Self {
        let body = encode_pairs(pairs.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes()))).unwrap();
        self.record(RecordType::Params, id, &body)
            .record(RecordType::Params, id, b"")
    }

    /// STDIN content split into records of at most 65535 bytes, then the terminator.
    pub fn stdin(self, id: u16, body: &[u8]) -> Self {
        self.stream(RecordType::Stdin, id, body)
    }

    pub fn data(self, id: u16, body: &[u8]) -> Self {
        self.stream(RecordType::Data, id, body)
    }

    fn stream(mut self, record_type: RecordType, id: u16, body: &[u8]) -> Self {
        for chunk in body.chunks(u16::MAX as usize) {
            self = self.record(record_type, id, chunk);
        }
        self.record(record_type, id, b"")
    }

    pub fn abort(self, id: u16) -> Self {
        self.record(RecordType::AbortRequest, id, b"")
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

pub fn parse_records(mut wire: &[u8]) -> Vec<Record> {
    let mut records = Vec::new();
    while !wire.is_empty() {
        records.push(read_record(&mut wire).unwrap());
    }
    records
}

/// Concatenated content of every `record_type` record for `id`.
pub fn stream_of(records: &[Record], record_type: RecordType, id: u16) -> Vec<u8> {
    records
        .iter()
        .filter(|r| r.record_type() == record_type && r.header.request_id == id)
        .flat_map(|r| r.content().to_vec())
        .collect()
}

pub fn stdout_of(records: &[Record], id: u16) -> String {
    String::from_utf8(stream_of(records, RecordType::Stdout, id)).unwrap()
}

pub fn end_requests(records: &[Record], id: u16) -> Vec<EndRequestBody> {
    records
        .iter()
        .filter(|r| r.record_type() == RecordType::EndRequest && r.header.request_id == id)
        .map(|r| EndRequestBody::decode(r.content()).unwrap())
        .collect()
}

pub fn pairs(body: &Bytes) -> Vec<(String, String)> {
    let mut body = body.clone();
    let mut out = Vec::new();
    while !body.is_empty() {
        let (name, value) = fcgi_mux::protocol::read_pair(&mut body).unwrap();
        out.push((
            String::from_utf8_lossy(&name).into_owned(),
            String::from_utf8_lossy(&value).into_owned(),
        ));
    }
    out
}

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
