//! One multiplexed request and the thread that runs its handler.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;

use super::params::{keys, Params};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::handler::{CancellationToken, ErasedHandler, RequestParts, FAILURE_STATUS};
use crate::io::{BufferReader, InputStream, OutputPipeline, OutputStream};
use crate::memory::Buffer;
use crate::protocol::{EndRequestBody, ProtocolStatus, RecordType, Role};

/// Connection-wide state every request thread reports back to.
#[derive(Clone)]
pub(crate) struct ConnectionShared {
    pub(crate) pipeline: Arc<OutputPipeline>,
    /// The connection's input buffer, interrupted to stop the demux loop.
    pub(crate) input: Arc<Buffer>,
    /// Set once a request without KEEP_CONN finishes.
    pub(crate) terminate: Arc<AtomicBool>,
}

impl ConnectionShared {
    pub(crate) fn is_terminating(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }
}

/// Registry entry for one request id.
pub(crate) struct Request {
    id: u16,
    role: Role,
    params: Arc<Buffer>,
    stdin: Arc<Buffer>,
    data: Arc<Buffer>,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    close_connection: bool,
    handle: Option<JoinHandle<()>>,
}

impl Request {
    /// Allocate the request's buffers and start its handler thread.
    pub(crate) fn spawn(
        id: u16,
        role: Role,
        close_connection: bool,
        handler: Box<dyn ErasedHandler>,
        shared: &ConnectionShared,
        config: &EngineConfig,
    ) -> Result<Self> {
        let mut request = Self {
            id,
            role,
            params: Arc::new(Buffer::new(config.page_size, config.params_limit)),
            stdin: Arc::new(Buffer::new(config.page_size, config.stdin_limit)),
            data: Arc::new(Buffer::new(config.page_size, config.data_limit)),
            cancel: CancellationToken::new(),
            finished: Arc::new(AtomicBool::new(false)),
            close_connection,
            handle: None,
        };

        let task = RequestTask {
            id,
            role,
            params: request.params.clone(),
            stdin: request.stdin.clone(),
            data: request.data.clone(),
            cancel: request.cancel.clone(),
            finished: request.finished.clone(),
            close_connection,
            shared: shared.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("fcgi-request-{}", id))
            .spawn(move || task.run(handler))?;
        request.handle = Some(handle);
        Ok(request)
    }

    #[inline]
    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    #[inline]
    pub(crate) fn role(&self) -> Role {
        self.role
    }

    /// Buffer fed by records of `record_type`.
    pub(crate) fn stream(&self, record_type: RecordType) -> Option<&Arc<Buffer>> {
        match record_type {
            RecordType::Params => Some(&self.params),
            RecordType::Stdin => Some(&self.stdin),
            RecordType::Data => Some(&self.data),
            _ => None,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// End every input stream at what has arrived so far.
    pub(crate) fn close_streams(&self) {
        self.params.close();
        self.stdin.close();
        self.data.close();
    }

    /// Fail every blocked read with an interruption.
    pub(crate) fn interrupt_streams(&self) {
        self.params.interrupt_all_waiting();
        self.stdin.interrupt_all_waiting();
        self.data.interrupt_all_waiting();
    }

    /// Wait for the handler thread.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::debug!("joining request {} thread", self.id);
            if handle.join().is_err() {
                tracing::error!("request {} thread panicked", self.id);
            }
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("finished", &self.is_finished())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("close_connection", &self.close_connection)
            .finish()
    }
}

/// Everything the handler thread owns.
struct RequestTask {
    id: u16,
    role: Role,
    params: Arc<Buffer>,
    stdin: Arc<Buffer>,
    data: Arc<Buffer>,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    close_connection: bool,
    shared: ConnectionShared,
}

impl RequestTask {
    fn run(self, handler: Box<dyn ErasedHandler>) {
        let pipeline = &self.shared.pipeline;
        let mut stdout = OutputStream::new(pipeline.clone(), RecordType::Stdout, self.id);
        let mut stderr = OutputStream::new(pipeline.clone(), RecordType::Stderr, self.id);

        let status = match self.prepare() {
            Ok(params) => handler.serve(RequestParts {
                request_id: self.id,
                role: self.role,
                params,
                stdout,
                stderr,
                stdin: InputStream::new(self.stdin.clone()),
                data: InputStream::new(self.data.clone()),
                cancel: self.cancel.clone(),
            }),
            Err(e) => {
                if e.is_interrupted() {
                    tracing::debug!("request {} interrupted before its handler ran", self.id);
                } else {
                    tracing::warn!("request {} setup failed: {}", self.id, e);
                }
                stdout.finish();
                stderr.finish();
                FAILURE_STATUS
            }
        };
        tracing::info!("request {} finished with status {}", self.id, status);

        // the peer may reuse the id as soon as it sees END_REQUEST
        self.finished.store(true, Ordering::Release);
        let end = EndRequestBody::new(status as u32, ProtocolStatus::RequestComplete);
        pipeline.send_record(
            RecordType::EndRequest,
            self.id,
            Bytes::copy_from_slice(&end.encode()),
        );

        if self.close_connection {
            tracing::debug!("request {} closes the connection", self.id);
            self.shared.terminate.store(true, Ordering::Release);
            self.shared.input.interrupt_all_waiting();
        }
    }

    /// Read the params and bound the input streams.
    fn prepare(&self) -> Result<Params> {
        let params = Params::read_from(&mut BufferReader::new(self.params.clone()))?;
        tracing::debug!("request {} params: {:?}", self.id, params);

        if !params.contains(keys::CONTENT_LENGTH) {
            tracing::debug!("request {} has no {}; stdin is empty", self.id, keys::CONTENT_LENGTH);
        }
        self.stdin.set_max_size(params.content_length());

        if self.role == Role::Filter {
            self.data.set_max_size(params.data_length());
            self.stdin.wait_for_all_input()?;
        } else {
            self.data.close();
        }
        Ok(params)
    }
}
