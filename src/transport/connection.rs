//! The byte-stream collaborator the engine runs on.

use std::io;
use std::sync::Arc;

/// A bidirectional transport connection.
///
/// All methods take `&self`: the Input Pump reads, the output writer thread
/// writes, and the demux thread closes, each from its own thread.
pub trait Connection: Send + Sync + 'static {
    /// Read at least `at_least` and at most `buf.len()` bytes.
    ///
    /// Returns fewer than `at_least` bytes only at end of stream; `Ok(0)`
    /// means the peer closed.
    fn read(&self, buf: &mut [u8], at_least: usize) -> io::Result<usize>;

    /// Write some prefix of `buf`, returning its length.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Push buffered bytes to the peer.
    fn flush(&self) -> io::Result<()>;

    /// Bytes that can be read without blocking.
    ///
    /// A closed peer must report a non-zero count so the next `read`
    /// observes end of stream.
    fn bytes_available(&self) -> io::Result<usize>;

    /// Shut the connection down. Idempotent.
    fn close(&self);
}

impl<C: Connection + ?Sized> Connection for Arc<C> {
    fn read(&self, buf: &mut [u8], at_least: usize) -> io::Result<usize> {
        (**self).read(buf, at_least)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn flush(&self) -> io::Result<()> {
        (**self).flush()
    }

    fn bytes_available(&self) -> io::Result<usize> {
        (**self).bytes_available()
    }

    fn close(&self) {
        (**self).close()
    }
}

/// `io::Write` view of a shared connection, for buffered writers.
pub struct ConnectionSink {
    conn: Arc<dyn Connection>,
}

impl ConnectionSink {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self { conn }
    }
}

impl io::Write for ConnectionSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.flush()
    }
}
