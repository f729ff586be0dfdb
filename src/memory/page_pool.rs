//! Fixed-size output pages with deferred reclamation.
//!
//! A handler fills a [`Page`], shares it with an output task and frees it
//! together with that task's [`Completion`]. The pool only hands the block
//! out again once the completion is done and the task has dropped its
//! share, so queued bytes are never overwritten.
//!
//! ```text
//! new_page() ──► Page ──share()──► SharedPage ──► output task
//!                                      │
//!                      free_page(page, Some(completion))
//!                                      │
//!          reuse once completion.is_done() and no share is alive
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::allocator::Allocator;
use crate::io::Completion;

/// Generation id of a page loan. Every `new_page` call gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(u64);

/// A page exclusively owned by its producer.
pub struct Page {
    id: PageId,
    block: Box<[u8]>,
}

impl Page {
    #[inline]
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Page size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.block.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.block
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.block
    }

    /// Give up exclusive access so the page can travel to an output task.
    pub fn share(self) -> SharedPage {
        SharedPage {
            id: self.id,
            block: Arc::new(self.block),
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("len", &self.block.len())
            .finish()
    }
}

/// A read-only, reference-counted view of a page.
#[derive(Clone)]
pub struct SharedPage {
    id: PageId,
    block: Arc<Box<[u8]>>,
}

impl SharedPage {
    #[inline]
    pub fn id(&self) -> PageId {
        self.id
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.block
    }
}

impl From<Page> for SharedPage {
    fn from(page: Page) -> Self {
        page.share()
    }
}

impl fmt::Debug for SharedPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPage")
            .field("id", &self.id)
            .field("shares", &Arc::strong_count(&self.block))
            .finish()
    }
}

struct FreePage {
    block: Arc<Box<[u8]>>,
    completion: Option<Completion>,
}

impl FreePage {
    fn reclaimable(&self) -> bool {
        self.completion.as_ref().map_or(true, Completion::is_done)
            && Arc::strong_count(&self.block) == 1
    }
}

#[derive(Default)]
struct PoolState {
    in_use: HashSet<PageId>,
    free: Vec<FreePage>,
    next_id: u64,
    allocated: usize,
}

/// Page allocator with completion-gated reuse.
pub struct PagePool {
    page_size: usize,
    allocator: Arc<dyn Allocator>,
    state: Mutex<PoolState>,
}

impl PagePool {
    /// Create an empty pool. Pages are allocated lazily.
    pub fn new(page_size: usize, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            page_size,
            allocator,
            state: Mutex::new(PoolState::default()),
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Hand out a page, reusing a free one if its write has completed.
    pub fn new_page(&self) -> Page {
        let mut state = self.state.lock();

        let reusable = state.free.iter().position(FreePage::reclaimable);
        let block = match reusable {
            Some(index) => {
                let free = state.free.swap_remove(index);
                match Arc::try_unwrap(free.block) {
                    Ok(block) => Some(block),
                    // strong_count was checked under the lock and shares
                    // are never created from a free page
                    Err(_) => None,
                }
            }
            None => None,
        };
        let block = block.unwrap_or_else(|| {
            state.allocated += 1;
            self.allocator.allocate(self.page_size, 1)
        });

        let id = PageId(state.next_id);
        state.next_id += 1;
        state.in_use.insert(id);
        Page { id, block }
    }

    /// Return a page. It becomes reusable once `completion` (if any) is done.
    pub fn free_page(&self, page: impl Into<SharedPage>, completion: Option<Completion>) {
        let page = page.into();
        let mut state = self.state.lock();
        if !state.in_use.remove(&page.id) {
            tracing::error!("free of unknown page {:?}; ignoring", page.id);
            return;
        }
        state.free.push(FreePage {
            block: page.block,
            completion,
        });
    }

    /// Pages currently lent out.
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use.len()
    }

    /// Pages waiting in the free set.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Blocks ever requested from the allocator.
    pub fn allocated(&self) -> usize {
        self.state.lock().allocated
    }
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PagePool")
            .field("page_size", &self.page_size)
            .field("in_use", &state.in_use.len())
            .field("free", &state.free.len())
            .finish()
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.in_use.is_empty() {
            tracing::error!("page pool dropped with {} pages in use", state.in_use.len());
        }

        let mut leaked = 0;
        for free in state.free.drain(..) {
            let complete = free.completion.as_ref().map_or(true, Completion::is_done);
            match Arc::try_unwrap(free.block) {
                Ok(block) if complete => self.allocator.deallocate(block, self.page_size),
                _ => leaked += 1,
            }
        }
        if leaked > 0 {
            tracing::error!("page pool leaked {} pages with unfinished writes", leaked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAllocator {
        allocated: AtomicUsize,
        released: AtomicUsize,
    }

    impl Allocator for CountingAllocator {
        fn allocate(&self, size: usize, _align: usize) -> Box<[u8]> {
            self.allocated.fetch_add(1, Ordering::SeqCst);
            vec![0u8; size].into_boxed_slice()
        }

        fn deallocate(&self, _block: Box<[u8]>, _size: usize) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool() -> (PagePool, Arc<CountingAllocator>) {
        let allocator = Arc::new(CountingAllocator::default());
        (PagePool::new(64, allocator.clone()), allocator)
    }

    #[test]
    fn test_new_page_allocates() {
        let (pool, allocator) = pool();
        let page = pool.new_page();
        assert_eq!(page.len(), 64);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(allocator.allocated.load(Ordering::SeqCst), 1);
        pool.free_page(page, None);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_free_without_completion_is_reused() {
        let (pool, allocator) = pool();
        let page = pool.new_page();
        let first_id = page.id();
        pool.free_page(page, None);

        let again = pool.new_page();
        assert_ne!(again.id(), first_id);
        assert_eq!(allocator.allocated.load(Ordering::SeqCst), 1);
        pool.free_page(again, None);
    }

    #[test]
    fn test_pending_completion_blocks_reuse() {
        let (pool, allocator) = pool();
        let completion = Completion::new();

        let page = pool.new_page();
        pool.free_page(page, Some(completion.clone()));

        let second = pool.new_page();
        assert_eq!(allocator.allocated.load(Ordering::SeqCst), 2);

        completion.complete();
        let third = pool.new_page();
        assert_eq!(allocator.allocated.load(Ordering::SeqCst), 2);

        pool.free_page(second, None);
        pool.free_page(third, None);
    }

    #[test]
    fn test_live_share_blocks_reuse() {
        let (pool, allocator) = pool();
        let shared = pool.new_page().share();
        let task_share = shared.clone();
        pool.free_page(shared, Some(Completion::done()));

        let fresh = pool.new_page();
        assert_eq!(allocator.allocated.load(Ordering::SeqCst), 2);

        drop(task_share);
        let reused = pool.new_page();
        assert_eq!(allocator.allocated.load(Ordering::SeqCst), 2);

        pool.free_page(fresh, None);
        pool.free_page(reused, None);
    }

    #[test]
    fn test_double_free_is_ignored() {
        let (pool, _) = pool();
        let shared = pool.new_page().share();
        pool.free_page(shared.clone(), None);
        pool.free_page(shared, None);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_drop_releases_completed_pages() {
        let allocator = Arc::new(CountingAllocator::default());
        {
            let pool = PagePool::new(32, allocator.clone());
            let a = pool.new_page();
            let b = pool.new_page();
            pool.free_page(a, Some(Completion::done()));
            pool.free_page(b, Some(Completion::new()));
        }
        assert_eq!(allocator.allocated.load(Ordering::SeqCst), 2);
        // the page whose write never completed is leaked, not released
        assert_eq!(allocator.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pages_are_writable() {
        let (pool, _) = pool();
        let mut page = pool.new_page();
        page.as_mut_slice()[..3].copy_from_slice(b"abc");
        let shared = page.share();
        assert_eq!(&shared.as_slice()[..3], b"abc");
        pool.free_page(shared, None);
    }
}
