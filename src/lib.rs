//! # fcgi-mux
//!
//! Multiplexing FastCGI server engine built on OS threads.
//!
//! One connection carries many concurrent requests, told apart by request
//! id. Each request runs its role handler on its own thread and reads its
//! PARAMS/STDIN/DATA streams from bounded buffers fed by the demux thread.
//!
//! ## Architecture
//!
//! ```text
//! transport ─► Input Pump ─► input Buffer ─► demux loop ─► Multiplexer ─► request Buffers
//!                                                                              │
//! transport ◄─ Output Pipeline ◄─ OutputStream (Page Pool pages) ◄─ handler ◄──┘
//! ```
//!
//! - **Input Pump** (thread): moves transport bytes into the input buffer
//! - **demux loop** (the calling thread): decodes records and routes them
//! - **handler threads**: one per active request
//! - **Output Pipeline** (thread): writes every record of the connection in order
//!
//! ## Example
//!
//! ```no_run
//! use std::io::Write;
//! use std::net::TcpListener;
//! use fcgi_mux::{Service, SocketConnection};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = Service::builder()
//!         .responder(|ctx| {
//!             let uri = ctx.param("REQUEST_URI").unwrap_or("/").to_string();
//!             write!(ctx.stdout(), "Content-Type: text/plain\r\n\r\n{}", uri)?;
//!             Ok(0)
//!         })
//!         .build()?;
//!
//!     let listener = TcpListener::bind("127.0.0.1:9000")?;
//!     service.run(listener.incoming().map(|s| s.and_then(SocketConnection::new)))?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod io;
pub mod memory;
pub mod mux;
pub mod protocol;
pub mod transport;

mod service;

pub use config::EngineConfig;
pub use error::{FcgiError, Result};
pub use handler::{
    FilterContext, Handler, HandlerResult, RequestContext, ResponderContext, RoleRegistry,
};
pub use mux::Params;
pub use protocol::Role;
pub use service::{Service, ServiceBuilder};
pub use transport::{Connection, SocketConnection};
