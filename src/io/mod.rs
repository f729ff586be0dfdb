//! I/O module - connection-side threads and handler stream adapters.
//!
//! - [`OutputPipeline`] - single writer thread draining a task queue
//! - [`spawn_input_pump`] - background reader feeding the input buffer
//! - [`BufferReader`] - record codec source over a buffer
//! - [`InputStream`] / [`OutputStream`] - `std::io` views for handlers

mod completion;
mod input_pump;
mod output;
mod reader;
mod streams;

pub use completion::Completion;
pub use input_pump::{spawn_input_pump, PumpConfig};
pub use output::{OutputPipeline, OutputTask, RecordWriter, DEFAULT_WRITE_BUFFER_SIZE};
pub use reader::BufferReader;
pub use streams::{InputStream, OutputStream};
