//! Dedicated writer thread for a connection's output.
//!
//! Every record a connection sends goes through one FIFO task queue drained
//! by one thread, so records never interleave below record granularity.
//!
//! # Architecture
//!
//! ```text
//! Handler 1 ─┐
//! Handler 2 ─┼─► add(task) ─► VecDeque<task> ─► Writer Thread ─► BufWriter ─► Connection
//! Demux     ─┘       │                               │
//!                    └──────── Completion ◄──────────┘
//! ```
//!
//! The writer flushes whenever the queue runs empty, so bursts of small
//! records share one transport write. On shutdown it drains the queue
//! before exiting.

use std::collections::VecDeque;
use std::io::{self, BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use super::completion::Completion;
use crate::error::Result;
use crate::memory::PagePool;
use crate::protocol::{self, RecordType};
use crate::transport::{Connection, ConnectionSink};

/// Default capacity of the writer-side buffer in front of the transport.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// A queued unit of output work.
pub type OutputTask = Box<dyn FnOnce(&mut RecordWriter) -> Result<()> + Send>;

/// The serializing writer handed to each output task.
pub struct RecordWriter {
    inner: BufWriter<ConnectionSink>,
}

impl RecordWriter {
    fn new(conn: Arc<dyn Connection>) -> Self {
        Self {
            inner: BufWriter::with_capacity(DEFAULT_WRITE_BUFFER_SIZE, ConnectionSink::new(conn)),
        }
    }

    /// Write one complete record.
    pub fn write_record(
        &mut self,
        record_type: RecordType,
        request_id: u16,
        content: &[u8],
    ) -> Result<()> {
        protocol::write_record(&mut self.inner, record_type, request_id, content)
    }
}

impl Write for RecordWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct QueueState {
    tasks: VecDeque<(OutputTask, Completion)>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    cond: Condvar,
}

/// Single writer thread draining a FIFO of output tasks.
pub struct OutputPipeline {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    pool: PagePool,
}

impl OutputPipeline {
    /// Start the writer thread for `conn`. The pipeline owns `pool`.
    pub fn start(conn: Arc<dyn Connection>, pool: PagePool) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let writer = RecordWriter::new(conn);
        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("fcgi-output".to_string())
                .spawn(move || writer_loop(shared, writer))?
        };

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
            pool,
        })
    }

    /// Enqueue a task. The returned flag turns true once it has run.
    ///
    /// After [`shutdown`](Self::shutdown) the task is dropped unrun and the
    /// returned flag is already complete.
    pub fn add<F>(&self, task: F) -> Completion
    where
        F: FnOnce(&mut RecordWriter) -> Result<()> + Send + 'static,
    {
        let completion = Completion::new();
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                drop(queue);
                tracing::warn!("output task added after shutdown; dropping it");
                completion.complete();
                return completion;
            }
            queue.tasks.push_back((Box::new(task), completion.clone()));
        }
        self.shared.cond.notify_one();
        completion
    }

    /// Enqueue one record with owned content.
    pub fn send_record(
        &self,
        record_type: RecordType,
        request_id: u16,
        content: impl Into<Bytes>,
    ) -> Completion {
        let content = content.into();
        self.add(move |writer| writer.write_record(record_type, request_id, &content))
    }

    /// Pool of output pages for stream adapters.
    #[inline]
    pub fn page_pool(&self) -> &PagePool {
        &self.pool
    }

    /// Tasks waiting to run.
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Drain the queue, stop the writer thread and wait for it.
    pub fn shutdown(&self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.cond.notify_all();

        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!("output writer thread panicked");
            }
        }
    }
}

impl Drop for OutputPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Main writer loop - runs tasks in order, flushing when idle.
fn writer_loop(shared: Arc<Shared>, mut writer: RecordWriter) {
    let mut failed = false;
    loop {
        let next = {
            let mut queue = shared.queue.lock();
            if queue.tasks.is_empty() {
                drop(queue);
                if let Err(e) = writer.flush() {
                    log_failure(&mut failed, format_args!("flush failed: {}", e));
                }
                queue = shared.queue.lock();
                while queue.tasks.is_empty() && !queue.shutdown {
                    shared.cond.wait(&mut queue);
                }
            }
            queue.tasks.pop_front()
        };

        // empty queue after wakeup means shutdown with nothing left
        let Some((task, completion)) = next else {
            break;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| task(&mut writer))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log_failure(&mut failed, format_args!("output task failed: {}", e)),
            Err(_) => tracing::error!("output task panicked"),
        }
        completion.complete();
    }

    if let Err(e) = writer.flush() {
        log_failure(&mut failed, format_args!("final flush failed: {}", e));
    }
    tracing::debug!("output writer thread exiting");
}

/// The first transport failure is an error; the ones that follow it are noise.
fn log_failure(failed: &mut bool, message: std::fmt::Arguments<'_>) {
    if *failed {
        tracing::debug!("{}", message);
    } else {
        tracing::error!("{}", message);
        *failed = true;
    }
}
