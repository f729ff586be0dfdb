//! Bounded, page-chunked stream buffer.
//!
//! One producer appends through a [`WriterToken`], one consumer drains with
//! [`Buffer::wait_for_input`]. The logical stream ends when everything up
//! to `max_size` has been consumed; [`Buffer::close`] freezes `max_size` at
//! the bytes written so far.
//!
//! Pages are `BytesMut` slabs. A read hands out a frozen `Bytes` split off
//! the front page, so the consumer keeps its chunk alive independently of
//! later reads and the producer keeps appending into the same allocation.
//!
//! # Example
//!
//! ```
//! use fcgi_mux::memory::Buffer;
//!
//! let buffer = Buffer::new(4096, 16);
//! {
//!     let mut token = buffer.begin_writing();
//!     assert_eq!(token.write(b"hello"), 5);
//! }
//! buffer.close();
//!
//! assert_eq!(&buffer.wait_for_input().unwrap()[..], b"hello");
//! assert!(buffer.wait_for_input().unwrap().is_empty());
//! ```

use std::collections::VecDeque;
use std::fmt;

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{FcgiError, Result};

struct PageSlot {
    /// Written but not yet consumed bytes of this page.
    data: BytesMut,
    /// Bytes ever written into this page.
    filled: usize,
}

struct BufferState {
    pages: VecDeque<PageSlot>,
    written: usize,
    consumed: usize,
    max_size: usize,
    closed: bool,
    interrupted: bool,
}

impl BufferState {
    #[inline]
    fn at_end(&self) -> bool {
        self.consumed >= self.max_size
    }

    #[inline]
    fn fully_written(&self) -> bool {
        self.written >= self.max_size
    }

    #[inline]
    fn unconsumed(&self) -> usize {
        self.written - self.consumed
    }
}

/// Single-producer, single-consumer byte stream made of fixed-size pages.
pub struct Buffer {
    page_size: usize,
    state: Mutex<BufferState>,
    /// Signalled when data arrives, the bound changes, or on interrupt.
    readable: Condvar,
    /// Signalled when the consumer frees space, or on interrupt.
    drained: Condvar,
}

impl Buffer {
    /// Create an empty buffer bounded by `max_size` bytes.
    pub fn new(page_size: usize, max_size: usize) -> Self {
        debug_assert!(page_size > 0);
        Self {
            page_size,
            state: Mutex::new(BufferState {
                pages: VecDeque::new(),
                written: 0,
                consumed: 0,
                max_size,
                closed: false,
                interrupted: false,
            }),
            readable: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    /// Acquire exclusive write access. Blocks while another token is live.
    ///
    /// The token holds the buffer lock; do not wait on this same buffer
    /// while holding it.
    pub fn begin_writing(&self) -> WriterToken<'_> {
        WriterToken {
            buffer: self,
            state: self.state.lock(),
        }
    }

    /// Next unconsumed range of bytes.
    ///
    /// Blocks until data is available. Returns an empty `Bytes` once
    /// everything up to `max_size` has been consumed, and
    /// [`FcgiError::Interrupted`] after [`interrupt_all_waiting`](Self::interrupt_all_waiting).
    pub fn wait_for_input(&self) -> Result<Bytes> {
        let mut state = self.state.lock();
        loop {
            if state.interrupted {
                return Err(FcgiError::Interrupted);
            }

            let page_size = self.page_size;
            while state
                .pages
                .front()
                .map_or(false, |page| page.filled == page_size && page.data.is_empty())
            {
                state.pages.pop_front();
            }

            if let Some(page) = state.pages.front_mut() {
                if !page.data.is_empty() {
                    let len = page.data.len();
                    let chunk = page.data.split_to(len).freeze();
                    if page.filled == page_size {
                        state.pages.pop_front();
                    }
                    state.consumed += len;
                    self.drained.notify_all();
                    return Ok(chunk);
                }
            }

            if state.at_end() {
                return Ok(Bytes::new());
            }

            self.readable.wait(&mut state);
        }
    }

    /// Block until `written_total == max_size`.
    ///
    /// Returns immediately once closed, since closing pins `max_size` to
    /// the written total.
    pub fn wait_for_all_input(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.interrupted {
                return Err(FcgiError::Interrupted);
            }
            if state.fully_written() {
                return Ok(());
            }
            self.readable.wait(&mut state);
        }
    }

    /// Block until at most `high_water` bytes wait unconsumed.
    ///
    /// Used by producers that must not run arbitrarily far ahead of the
    /// consumer.
    pub fn wait_until_drained_below(&self, high_water: usize) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.interrupted {
                return Err(FcgiError::Interrupted);
            }
            if state.closed || state.unconsumed() <= high_water {
                return Ok(());
            }
            self.drained.wait(&mut state);
        }
    }

    /// Freeze `max_size` at the bytes written so far (end of stream).
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.max_size = state.written;
        state.closed = true;
        drop(state);
        self.readable.notify_all();
        self.drained.notify_all();
    }

    /// Set the stream length once it becomes known.
    ///
    /// Ignored after [`close`](Self::close). Never drops below the bytes
    /// already written.
    pub fn set_max_size(&self, max_size: usize) {
        let mut state = self.state.lock();
        if state.closed {
            tracing::debug!("ignoring max size {} on a closed buffer", max_size);
            return;
        }
        state.max_size = max_size.max(state.written);
        drop(state);
        self.readable.notify_all();
    }

    /// Wake every blocked waiter with [`FcgiError::Interrupted`]. Sticky.
    pub fn interrupt_all_waiting(&self) {
        self.state.lock().interrupted = true;
        self.readable.notify_all();
        self.drained.notify_all();
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn max_size(&self) -> usize {
        self.state.lock().max_size
    }

    pub fn written_total(&self) -> usize {
        self.state.lock().written
    }

    pub fn consumed_total(&self) -> usize {
        self.state.lock().consumed
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }

    /// True once no more bytes can be written.
    pub fn is_full(&self) -> bool {
        let state = self.state.lock();
        state.closed || state.fully_written()
    }

    /// Pages currently held.
    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Buffer")
            .field("written", &state.written)
            .field("consumed", &state.consumed)
            .field("max_size", &state.max_size)
            .field("closed", &state.closed)
            .field("interrupted", &state.interrupted)
            .finish()
    }
}

/// Exclusive, scope-bound permission to append to a [`Buffer`].
///
/// Readers are woken when the token is dropped.
pub struct WriterToken<'a> {
    buffer: &'a Buffer,
    state: MutexGuard<'a, BufferState>,
}

impl WriterToken<'_> {
    /// Reserve up to `desired` bytes and return them for filling.
    ///
    /// The window is limited by the room left in the current page and by
    /// `max_size`. An empty window means the buffer is closed or full and
    /// the caller must stop writing. Reserved bytes count as written.
    pub fn request_buffer(&mut self, desired: usize) -> &mut [u8] {
        let page_size = self.buffer.page_size;
        let state = &mut *self.state;
        if state.closed || state.fully_written() || desired == 0 {
            return &mut [];
        }

        let needs_page = state
            .pages
            .back()
            .map_or(true, |page| page.filled == page_size);
        if needs_page {
            state.pages.push_back(PageSlot {
                data: BytesMut::with_capacity(page_size),
                filled: 0,
            });
        }

        let room = state.max_size - state.written;
        let Some(page) = state.pages.back_mut() else {
            return &mut [];
        };
        let len = desired.min(page_size - page.filled).min(room);
        let start = page.data.len();
        page.data.resize(start + len, 0);
        page.filled += len;
        state.written += len;
        &mut page.data[start..]
    }

    /// Copy as much of `data` as fits. Returns the bytes accepted.
    pub fn write(&mut self, mut data: &[u8]) -> usize {
        let mut accepted = 0;
        while !data.is_empty() {
            let window = self.request_buffer(data.len());
            if window.is_empty() {
                break;
            }
            let len = window.len();
            window.copy_from_slice(&data[..len]);
            data = &data[len..];
            accepted += len;
        }
        accepted
    }

    /// True once no more bytes can be written.
    pub fn is_full(&self) -> bool {
        self.state.closed || self.state.fully_written()
    }
}

impl Drop for WriterToken<'_> {
    fn drop(&mut self) {
        self.buffer.readable.notify_all();
    }
}
