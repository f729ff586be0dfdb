//! Transport module - the connection collaborator and socket adapters.
//!
//! Provides:
//! - [`Connection`] - what the engine needs from a byte stream
//! - [`SocketConnection`] - blocking TCP / Unix Domain Socket adapter

mod connection;
mod socket;

pub use connection::{Connection, ConnectionSink};
#[cfg(unix)]
pub use socket::{bind_unix, SocketCleanup};
pub use socket::{Socket, SocketConnection, DEFAULT_PROBE_TIMEOUT};
