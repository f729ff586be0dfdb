//! Blocking socket adapter.
//!
//! - TCP: `std::net::TcpStream`
//! - Unix: `std::os::unix::net::UnixStream`
//!
//! Availability is probed with a short read timeout; probed bytes are
//! staged and served by the next `read`.
//!
//! # Example
//!
//! ```no_run
//! use std::net::TcpListener;
//! use fcgi_mux::transport::SocketConnection;
//!
//! let listener = TcpListener::bind("127.0.0.1:9000").unwrap();
//! for stream in listener.incoming() {
//!     let conn = SocketConnection::new(stream.unwrap()).unwrap();
//!     // hand `conn` to a Service
//! #   drop(conn);
//! }
//! ```

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;

use super::connection::Connection;

/// Read timeout used while probing for available bytes.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1);

const PROBE_CHUNK: usize = 4096;

/// Blocking stream sockets usable by [`SocketConnection`].
pub trait Socket: Send + Sync + 'static {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;
    fn read_from(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_to(&self, buf: &[u8]) -> io::Result<usize>;
    fn flush_to(&self) -> io::Result<()>;
}

macro_rules! impl_socket {
    ($ty:ty) => {
        impl Socket for $ty {
            fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
                <$ty>::set_read_timeout(self, timeout)
            }

            fn shutdown(&self, how: Shutdown) -> io::Result<()> {
                <$ty>::shutdown(self, how)
            }

            fn read_from(&self, buf: &mut [u8]) -> io::Result<usize> {
                (&mut &*self).read(buf)
            }

            fn write_to(&self, buf: &[u8]) -> io::Result<usize> {
                (&mut &*self).write(buf)
            }

            fn flush_to(&self) -> io::Result<()> {
                (&mut &*self).flush()
            }
        }
    };
}

impl_socket!(TcpStream);
#[cfg(unix)]
impl_socket!(std::os::unix::net::UnixStream);

#[derive(Default)]
struct Staged {
    bytes: BytesMut,
    eof: bool,
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// [`Connection`] over a blocking stream socket.
pub struct SocketConnection<S: Socket> {
    socket: S,
    staged: Mutex<Staged>,
}

impl<S: Socket> SocketConnection<S> {
    /// Wrap a connected socket.
    pub fn new(socket: S) -> io::Result<Self> {
        Self::with_probe_timeout(socket, DEFAULT_PROBE_TIMEOUT)
    }

    /// Wrap a connected socket with a custom availability probe timeout.
    pub fn with_probe_timeout(socket: S, timeout: Duration) -> io::Result<Self> {
        socket.set_read_timeout(Some(timeout))?;
        Ok(Self {
            socket,
            staged: Mutex::new(Staged::default()),
        })
    }

    /// Get a reference to the underlying socket.
    pub fn inner(&self) -> &S {
        &self.socket
    }
}

impl<S: Socket> Connection for SocketConnection<S> {
    fn read(&self, buf: &mut [u8], at_least: usize) -> io::Result<usize> {
        let at_least = at_least.min(buf.len());
        let mut staged = self.staged.lock();
        let mut filled = staged.bytes.len().min(buf.len());
        staged.bytes.copy_to_slice(&mut buf[..filled]);

        while filled < at_least && !staged.eof {
            match self.socket.read_from(&mut buf[filled..]) {
                Ok(0) => staged.eof = true,
                Ok(n) => filled += n,
                Err(e) if is_timeout(&e) => continue,
                Err(e) if filled > 0 => {
                    tracing::debug!("socket read failed after {} bytes: {}", filled, e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.write_to(buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.socket.flush_to()
    }

    fn bytes_available(&self) -> io::Result<usize> {
        let mut staged = self.staged.lock();
        if staged.eof {
            return Ok(staged.bytes.len().max(1));
        }
        if !staged.bytes.is_empty() {
            return Ok(staged.bytes.len());
        }

        let mut probe = [0u8; PROBE_CHUNK];
        match self.socket.read_from(&mut probe) {
            Ok(0) => {
                staged.eof = true;
                Ok(1)
            }
            Ok(n) => {
                staged.bytes.extend_from_slice(&probe[..n]);
                Ok(n)
            }
            Err(e) if is_timeout(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn close(&self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::debug!("socket shutdown failed: {}", e);
            }
        }
    }
}

// ============================================================================
// Unix listener helpers
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use std::io;
    use std::os::unix::net::UnixListener;
    use std::path::{Path, PathBuf};

    /// Removes the socket file on drop.
    pub struct SocketCleanup {
        path: PathBuf,
    }

    impl Drop for SocketCleanup {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Bind a Unix listener, replacing any stale socket file at `path`.
    pub fn bind_unix(path: impl AsRef<Path>) -> io::Result<(UnixListener, SocketCleanup)> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        Ok((
            listener,
            SocketCleanup {
                path: path.to_path_buf(),
            },
        ))
    }
}

#[cfg(unix)]
pub use unix_impl::{bind_unix, SocketCleanup};
