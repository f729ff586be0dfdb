//! Demultiplexing of request records by request id.
//!
//! Per id the lifecycle is `absent -> active -> finished -> removed`. The
//! registry is only touched by the demux thread; handler threads report
//! back through their request's atomic flags.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use super::request::{ConnectionShared, Request};
use crate::config::EngineConfig;
use crate::error::{FcgiError, Result};
use crate::handler::RoleRegistry;
use crate::io::BufferReader;
use crate::protocol::{
    BeginRequestBody, ByteSource, EndRequestBody, ProtocolStatus, RecordHeader, RecordType, Role,
    NULL_REQUEST_ID,
};

/// What happened to a record handed to the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// Acted on; its content has been consumed.
    Handled,
    /// Dropped because of the request state; its content has been consumed.
    Ignored,
    /// Not a request record; its content is untouched.
    Unsupported,
}

/// How to stop requests that are still running at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    /// Input ended: close their streams and let the handlers finish.
    Graceful,
    /// Connection failed: interrupt their reads and cancel them.
    Abort,
}

pub(crate) struct Multiplexer {
    registry: Arc<RoleRegistry>,
    config: Arc<EngineConfig>,
    shared: ConnectionShared,
    requests: HashMap<u16, Request>,
}

impl Multiplexer {
    pub(crate) fn new(
        registry: Arc<RoleRegistry>,
        config: Arc<EngineConfig>,
        shared: ConnectionShared,
    ) -> Self {
        Self {
            registry,
            config,
            shared,
            requests: HashMap::new(),
        }
    }

    /// Route one request record whose header has just been read.
    ///
    /// Consumes the record content unless the result is
    /// [`Dispatch::Unsupported`]; never touches the padding.
    pub(crate) fn handle_record(
        &mut self,
        header: &RecordHeader,
        reader: &mut BufferReader,
    ) -> Result<Dispatch> {
        let record_type = header.record_type;
        let len = header.content_length as usize;
        if !matches!(
            record_type,
            RecordType::BeginRequest
                | RecordType::AbortRequest
                | RecordType::Params
                | RecordType::Stdin
                | RecordType::Data
        ) {
            return Ok(Dispatch::Unsupported);
        }

        let id = header.request_id;
        if id == NULL_REQUEST_ID {
            reader.skip_bytes(len)?;
            tracing::warn!("ignoring {:?} record with the management request id", record_type);
            return Ok(Dispatch::Ignored);
        }

        self.reap(id);
        match record_type {
            RecordType::BeginRequest => self.begin(id, len, reader),
            RecordType::AbortRequest => self.abort(id, len, reader),
            _ => self.forward(id, record_type, len, reader),
        }
    }

    /// True once a closing request finished and nothing else is running.
    pub(crate) fn should_terminate(&self) -> bool {
        self.shared.is_terminating() && self.requests.values().all(Request::is_finished)
    }

    /// Requests still registered, finished or not.
    #[cfg(test)]
    pub(crate) fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Requests whose handler has not finished.
    pub(crate) fn active_count(&self) -> usize {
        self.requests.values().filter(|r| !r.is_finished()).count()
    }

    /// Stop unfinished requests and join every handler thread.
    pub(crate) fn shutdown(&mut self, mode: Teardown) {
        for request in self.requests.values().filter(|r| !r.is_finished()) {
            tracing::debug!(
                "stopping {:?} request {} ({:?})",
                request.role(),
                request.id(),
                mode
            );
            match mode {
                Teardown::Graceful => request.close_streams(),
                Teardown::Abort => {
                    request.cancel();
                    request.interrupt_streams();
                }
            }
        }
        for (_, mut request) in self.requests.drain() {
            request.join();
        }
    }

    /// Remove `id` if its handler already finished, freeing the id for reuse.
    fn reap(&mut self, id: u16) {
        if !self.requests.get(&id).is_some_and(Request::is_finished) {
            return;
        }
        if let Some(mut request) = self.requests.remove(&id) {
            request.join();
            tracing::debug!("request {} removed", id);
        }
    }

    fn begin(&mut self, id: u16, len: usize, reader: &mut BufferReader) -> Result<Dispatch> {
        let content = reader.take(len)?;
        let body = BeginRequestBody::decode(&content).ok_or_else(|| {
            FcgiError::Framing(format!("BEGIN_REQUEST body of {} bytes", content.len()))
        })?;

        if self.requests.contains_key(&id) {
            tracing::warn!("ignoring BEGIN_REQUEST for active request {}", id);
            return Ok(Dispatch::Ignored);
        }
        if self.shared.is_terminating() {
            tracing::warn!("ignoring BEGIN_REQUEST {}: connection is closing", id);
            return Ok(Dispatch::Ignored);
        }

        let handler = Role::from_code(body.role)
            .and_then(|role| self.registry.create(role).map(|handler| (role, handler)));
        let Some((role, handler)) = handler else {
            tracing::warn!("request {}: {}", id, FcgiError::UnknownRole(body.role));
            self.end_request(id, ProtocolStatus::UnknownRole);
            return Ok(Dispatch::Handled);
        };

        match Request::spawn(id, role, !body.keep_conn(), handler, &self.shared, &self.config) {
            Ok(request) => {
                tracing::debug!("request {} started as {:?}", id, role);
                self.requests.insert(id, request);
            }
            Err(e) => {
                tracing::error!("cannot start request {}: {}", id, e);
                self.end_request(id, ProtocolStatus::Overloaded);
            }
        }
        Ok(Dispatch::Handled)
    }

    fn abort(&mut self, id: u16, len: usize, reader: &mut BufferReader) -> Result<Dispatch> {
        reader.skip_bytes(len)?;
        match self.requests.get(&id) {
            Some(request) if !request.is_finished() => {
                tracing::debug!("request {} aborted by peer", id);
                request.cancel();
                Ok(Dispatch::Handled)
            }
            _ => {
                tracing::warn!("ignoring ABORT_REQUEST for unknown request {}", id);
                Ok(Dispatch::Ignored)
            }
        }
    }

    /// Copy a stream record into the request's buffer.
    ///
    /// A full buffer discards the rest of the record; the demux thread never
    /// waits on a handler.
    fn forward(
        &mut self,
        id: u16,
        record_type: RecordType,
        len: usize,
        reader: &mut BufferReader,
    ) -> Result<Dispatch> {
        let buffer = match self.requests.get(&id) {
            Some(request) if !request.is_finished() => request.stream(record_type).cloned(),
            _ => None,
        };
        let Some(buffer) = buffer else {
            reader.skip_bytes(len)?;
            tracing::warn!("ignoring {:?} record for unknown request {}", record_type, id);
            return Ok(Dispatch::Ignored);
        };

        if len == 0 {
            tracing::trace!("request {} {:?} stream ended", id, record_type);
            buffer.close();
            return Ok(Dispatch::Handled);
        }

        let mut remaining = len;
        while remaining > 0 {
            let chunk = reader.chunk(remaining)?;
            remaining -= chunk.len();
            let accepted = buffer.begin_writing().write(&chunk);
            if accepted < chunk.len() {
                reader.skip_bytes(remaining)?;
                tracing::warn!(
                    "request {} {:?} buffer full, dropped {} bytes",
                    id,
                    record_type,
                    chunk.len() - accepted + remaining
                );
                break;
            }
        }
        tracing::trace!("request {} {:?} +{} bytes", id, record_type, len);
        Ok(Dispatch::Handled)
    }

    fn end_request(&self, id: u16, status: ProtocolStatus) {
        let body = EndRequestBody::new(0, status);
        self.shared.pipeline.send_record(
            RecordType::EndRequest,
            id,
            Bytes::copy_from_slice(&body.encode()),
        );
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if !self.requests.is_empty() {
            self.shutdown(Teardown::Abort);
        }
    }
}
