//! Memory module - stream buffers and the output page pool.
//!
//! - [`Buffer`] - bounded page-chunked byte stream used for every input stream
//! - [`PagePool`] - fixed-size output pages reused only after their write ran
//! - [`Allocator`] - where the page pool gets its memory

mod allocator;
mod buffer;
mod page_pool;

pub use allocator::{Allocator, SystemAllocator};
pub use buffer::{Buffer, WriterToken};
pub use page_pool::{Page, PageId, PagePool, SharedPage};
