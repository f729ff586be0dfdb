//! Allocator capability used by the page pool.

/// Source of raw memory blocks.
///
/// Blocks are owned boxed slices, so handing one back is an explicit
/// ownership transfer rather than a pointer.
pub trait Allocator: Send + Sync {
    /// Allocate a zeroed block of `size` bytes aligned to at least `align`.
    ///
    /// The page pool only ever asks for byte alignment.
    fn allocate(&self, size: usize, align: usize) -> Box<[u8]>;

    /// Return a block previously produced by `allocate`.
    fn deallocate(&self, block: Box<[u8]>, size: usize);
}

/// Allocator backed by the global heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn allocate(&self, size: usize, align: usize) -> Box<[u8]> {
        debug_assert!(align <= 1, "SystemAllocator only hands out byte-aligned blocks");
        vec![0u8; size].into_boxed_slice()
    }

    fn deallocate(&self, block: Box<[u8]>, size: usize) {
        debug_assert_eq!(block.len(), size);
        drop(block);
    }
}
