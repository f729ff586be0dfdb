//! Service builder and per-connection demux loop.
//!
//! The [`ServiceBuilder`] provides a fluent API for registering role
//! handlers and tuning buffers. The [`Service`] runs connections:
//! 1. Start the output pipeline and the input pump
//! 2. Read record headers from the input buffer
//! 3. Answer management records, hand request records to the multiplexer
//! 4. Tear down once the peer closes or a closing request finishes
//!
//! # Example
//!
//! ```no_run
//! use std::io::Write;
//! use std::net::TcpListener;
//! use fcgi_mux::{Service, SocketConnection};
//!
//! let service = Service::builder()
//!     .responder(|ctx| {
//!         ctx.stdout().write_all(b"Content-Type: text/plain\r\n\r\nhello")?;
//!         Ok(0)
//!     })
//!     .build()
//!     .unwrap();
//!
//! let listener = TcpListener::bind("127.0.0.1:9000").unwrap();
//! service
//!     .run(listener.incoming().map(|s| s.and_then(SocketConnection::new)))
//!     .unwrap();
//! ```

use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;

use crate::config::EngineConfig;
use crate::error::{FcgiError, Result};
use crate::handler::{
    FilterContext, Handler, HandlerResult, RequestContext, ResponderContext, RoleRegistry,
};
use crate::io::{spawn_input_pump, BufferReader, OutputPipeline, PumpConfig};
use crate::memory::{Allocator, Buffer, PagePool, SystemAllocator};
use crate::mux::{ConnectionShared, Dispatch, Multiplexer, Teardown};
use crate::protocol::{
    encode_pairs, read_header, read_pair, values, ByteSource, RecordHeader, RecordType,
    UnknownTypeBody, NULL_REQUEST_ID,
};
use crate::transport::Connection;

/// Longest GET_VALUES name worth looking at; every known name is shorter.
const MAX_VALUE_NAME_LEN: usize = 15;

/// Builder for configuring and creating a [`Service`].
pub struct ServiceBuilder {
    registry: RoleRegistry,
    config: EngineConfig,
    allocator: Arc<dyn Allocator>,
    /// First registration failure, reported by `build()`.
    error: Option<FcgiError>,
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self {
            registry: RoleRegistry::new(),
            config: EngineConfig::default(),
            allocator: Arc::new(SystemAllocator),
            error: None,
        }
    }

    /// Register a handler type; its context type picks the role.
    ///
    /// `factory` is called once per request.
    pub fn handler<H, F>(mut self, factory: F) -> Self
    where
        H: Handler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        if let Err(e) = self.registry.register(factory) {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Register a closure for the responder role.
    pub fn responder<F>(self, f: F) -> Self
    where
        F: Fn(&mut ResponderContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_fn(f)
    }

    /// Register a closure for the authorizer role.
    pub fn authorizer<F>(self, f: F) -> Self
    where
        F: Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_fn(f)
    }

    /// Register a closure for the filter role.
    pub fn filter<F>(self, f: F) -> Self
    where
        F: Fn(&mut FilterContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_fn(f)
    }

    fn register_fn<C, F>(mut self, f: F) -> Self
    where
        C: crate::handler::RoleContext,
        F: Fn(&mut C) -> HandlerResult + Send + Sync + 'static,
    {
        if let Err(e) = self.registry.register_fn(f) {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Replace every tunable at once.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Page size of the per-request and input buffers.
    ///
    /// Default: 4096
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    /// Page size of the output pool; also the largest STDOUT/STDERR record.
    ///
    /// Default: 4096
    pub fn output_page_size(mut self, size: usize) -> Self {
        self.config.output_page_size = size;
        self
    }

    /// Bytes read from the transport per call.
    ///
    /// Default: 4096
    pub fn input_chunk_size(mut self, size: usize) -> Self {
        self.config.input_chunk_size = size;
        self
    }

    /// Sleep between availability polls of an idle transport.
    ///
    /// Millisecond resolution; shorter intervals round up to 1ms.
    ///
    /// Default: 1ms
    pub fn input_poll_interval(mut self, interval: Duration) -> Self {
        self.config.input_poll_interval_ms =
            u64::try_from(interval.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    /// Unconsumed input bytes at which the pump stops reading.
    ///
    /// Default: 1 MiB
    pub fn input_high_water(mut self, bytes: usize) -> Self {
        self.config.input_high_water = bytes;
        self
    }

    /// Bound of each request's PARAMS buffer.
    pub fn params_limit(mut self, bytes: usize) -> Self {
        self.config.params_limit = bytes;
        self
    }

    /// Initial bound of each request's STDIN buffer, until CONTENT_LENGTH is known.
    pub fn stdin_limit(mut self, bytes: usize) -> Self {
        self.config.stdin_limit = bytes;
        self
    }

    /// Initial bound of each request's DATA buffer, until FCGI_DATA_LENGTH is known.
    pub fn data_limit(mut self, bytes: usize) -> Self {
        self.config.data_limit = bytes;
        self
    }

    /// Allocator backing the output page pools.
    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Validate the configuration and build the service.
    pub fn build(self) -> Result<Service> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.config.validate()?;
        if self.registry.roles().next().is_none() {
            tracing::warn!("service built without any role handler");
        }
        Ok(Service {
            registry: Arc::new(self.registry),
            config: Arc::new(self.config),
            allocator: self.allocator,
        })
    }
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A configured server engine. Cheap to clone; clones share handlers.
#[derive(Clone)]
pub struct Service {
    registry: Arc<RoleRegistry>,
    config: Arc<EngineConfig>,
    allocator: Arc<dyn Allocator>,
}

impl Service {
    /// Create a new service builder.
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    /// Serve one connection on the calling thread until it ends.
    ///
    /// Returns `Ok` when the peer closes or a request without KEEP_CONN
    /// finishes; framing errors and version mismatches are returned after
    /// the connection has been torn down.
    pub fn serve_connection<C: Connection>(&self, conn: C) -> Result<()> {
        let conn: Arc<dyn Connection> = Arc::new(conn);
        tracing::debug!("connection opened");

        let pool = PagePool::new(self.config.output_page_size, self.allocator.clone());
        let pipeline = Arc::new(OutputPipeline::start(conn.clone(), pool)?);
        let input = Arc::new(Buffer::new(self.config.page_size, usize::MAX));
        let pump_config = PumpConfig::from(&*self.config);
        let pump = match spawn_input_pump(conn.clone(), input.clone(), pump_config) {
            Ok(pump) => pump,
            Err(e) => {
                pipeline.shutdown();
                conn.close();
                return Err(e);
            }
        };

        let shared = ConnectionShared {
            pipeline: pipeline.clone(),
            input: input.clone(),
            terminate: Arc::new(AtomicBool::new(false)),
        };
        let mut mux = Multiplexer::new(self.registry.clone(), self.config.clone(), shared);
        let mut reader = BufferReader::new(input.clone());

        let outcome = match demux_loop(&mut mux, &mut reader, &pipeline) {
            Err(e) if e.is_interrupted() => Ok(()),
            other => other,
        };
        let mode = match &outcome {
            Ok(()) => Teardown::Graceful,
            Err(e) => {
                tracing::error!("connection failed: {}", e);
                Teardown::Abort
            }
        };

        if mux.active_count() > 0 {
            tracing::debug!("waiting for {} running requests", mux.active_count());
        }
        input.interrupt_all_waiting();
        mux.shutdown(mode);
        pipeline.shutdown();
        conn.close();
        if pump.join().is_err() {
            tracing::error!("input pump thread panicked");
        }
        tracing::debug!("connection closed");
        outcome
    }

    /// Serve one connection on a new thread. Failures are logged.
    pub fn spawn_connection<C: Connection>(&self, conn: C) -> Result<JoinHandle<()>> {
        let service = self.clone();
        let handle = thread::Builder::new()
            .name("fcgi-connection".to_string())
            .spawn(move || {
                if let Err(e) = service.serve_connection(conn) {
                    tracing::warn!("connection ended with error: {}", e);
                }
            })?;
        Ok(handle)
    }

    /// Serve every connection `incoming` yields, one thread each.
    ///
    /// Accept errors are logged and skipped. Returns once `incoming` is
    /// exhausted and every connection thread has ended.
    pub fn run<I, C>(&self, incoming: I) -> Result<()>
    where
        I: IntoIterator<Item = io::Result<C>>,
        C: Connection,
    {
        let mut connections: Vec<JoinHandle<()>> = Vec::new();
        for conn in incoming {
            match conn {
                Ok(conn) => {
                    tracing::info!("connection accepted");
                    connections.retain(|handle| !handle.is_finished());
                    connections.push(self.spawn_connection(conn)?);
                }
                Err(e) => tracing::warn!("accept failed: {}", e),
            }
        }

        for handle in connections {
            if handle.join().is_err() {
                tracing::error!("connection thread panicked");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

/// Read records until the peer closes or the connection should terminate.
fn demux_loop(
    mux: &mut Multiplexer,
    reader: &mut BufferReader,
    pipeline: &OutputPipeline,
) -> Result<()> {
    loop {
        if mux.should_terminate() {
            tracing::debug!("closing connection after final request");
            return Ok(());
        }
        if reader.fill_buf()?.is_empty() {
            tracing::debug!("peer closed the connection");
            return Ok(());
        }

        let header = read_header(reader)?;
        if let Err(e) = header.validate() {
            tracing::error!("dropping connection: {}", e);
            return Err(e);
        }
        tracing::trace!(
            "record {:?} id={} len={}",
            header.record_type,
            header.request_id,
            header.content_length
        );

        match header.record_type {
            RecordType::GetValues => {
                let content = reader.take(header.content_length as usize)?;
                pipeline.send_record(
                    RecordType::GetValuesResult,
                    NULL_REQUEST_ID,
                    get_values_reply(content)?,
                );
            }
            _ => {
                if mux.handle_record(&header, reader)? == Dispatch::Unsupported {
                    reject_unknown_type(&header, reader, pipeline)?;
                }
            }
        }
        reader.skip_bytes(header.padding_length as usize)?;
    }
}

fn reject_unknown_type(
    header: &RecordHeader,
    reader: &mut BufferReader,
    pipeline: &OutputPipeline,
) -> Result<()> {
    reader.skip_bytes(header.content_length as usize)?;
    tracing::warn!(
        "unsupported record type {:?} (id {})",
        header.record_type,
        header.request_id
    );
    let body = UnknownTypeBody {
        record_type: header.record_type.code(),
    };
    pipeline.send_record(
        RecordType::UnknownType,
        NULL_REQUEST_ID,
        Bytes::copy_from_slice(&body.encode()),
    );
    Ok(())
}

/// Answer a GET_VALUES query. Only multiplexing support is reported.
fn get_values_reply(mut content: Bytes) -> Result<Bytes> {
    let mut answers: Vec<(&[u8], &[u8])> = Vec::new();
    while !content.is_empty() {
        let (name, _) = match read_pair(&mut content) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("malformed GET_VALUES record: {}", e);
                break;
            }
        };
        if name.len() > MAX_VALUE_NAME_LEN {
            tracing::debug!("skipping GET_VALUES name of {} bytes", name.len());
            continue;
        }
        if name.as_ref() == values::MPXS_CONNS.as_bytes() {
            answers.push((values::MPXS_CONNS.as_bytes(), &b"1"[..]));
        } else {
            tracing::debug!("not answering GET_VALUES {:?}", String::from_utf8_lossy(&name));
        }
    }
    encode_pairs(answers)
}
