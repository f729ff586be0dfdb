//! Request multiplexing.
//!
//! The demux thread hands every request record to the multiplexer,
//! which tracks requests by id, feeds their PARAMS/STDIN/DATA buffers and
//! runs each request's handler on its own thread.

mod multiplexer;
mod params;
mod request;

pub(crate) use multiplexer::{Dispatch, Multiplexer, Teardown};
pub use params::{keys, Params};
pub(crate) use request::ConnectionShared;
