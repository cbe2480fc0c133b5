use std::{
    cell::RefCell,
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{class::{PageClass, SEGMENT_CLASSES}, page::Page};

/// Threads currently holding a live cache. Maintained by the cache's
/// construction and destruction so the heap can detect multi-threaded
/// mode without a syscall.
static LIVE_THREADS: AtomicU32 = AtomicU32::new(0);

/// Returns a small id unique to the calling thread. Ids start at 1; 0
/// means "no owner" in page metadata.
#[inline]
pub(crate) fn current_tid() -> u32 {
    thread_local! {
        static TID: u32 = {
            static COUNTER: AtomicU32 = AtomicU32::new(1);
            COUNTER.fetch_add(1, Ordering::Relaxed)
        };
    }
    TID.with(|&id| id)
}

/// True when more than one thread currently has a live cache. Reloaded on
/// every top-level heap call; the single-threaded fast path skips page
/// lock acquisition based on this.
#[inline]
pub(crate) fn is_multi_threaded() -> bool {
    LIVE_THREADS.load(Ordering::Relaxed) > 1
}

/// Per-thread allocation hints. One cached page per non-XL class, with
/// its address bounds, and one preferred segment index per class. The
/// cache is strictly a hint: it holds no freelist and no chunk state, so
/// there is nothing to drain when a thread exits.
pub(crate) struct ThreadCache {
    cached_pages: [Option<NonNull<Page>>; SEGMENT_CLASSES],
    cached_bases: [usize; SEGMENT_CLASSES],
    cached_ends: [usize; SEGMENT_CLASSES],
    preferred_segments: [Option<u32>; SEGMENT_CLASSES],
}

impl ThreadCache {
    fn new() -> Self {
        LIVE_THREADS.fetch_add(1, Ordering::Relaxed);
        Self {
            cached_pages: [None; SEGMENT_CLASSES],
            cached_bases: [0; SEGMENT_CLASSES],
            cached_ends: [0; SEGMENT_CLASSES],
            preferred_segments: [None; SEGMENT_CLASSES],
        }
    }

    /// Runs `f` with the calling thread's cache.
    pub fn with<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> R {
        thread_local! {
            static CACHE: RefCell<ThreadCache> = RefCell::new(ThreadCache::new());
        }
        CACHE.with(|cache| f(&mut cache.borrow_mut()))
    }

    /// Cached page together with its span bounds, so the caller can pick
    /// the page's lock stripe without touching the page itself.
    #[inline]
    pub fn cached_page(&self, class: PageClass) -> Option<(NonNull<Page>, usize, usize)> {
        let idx = class.index();
        self.cached_pages[idx].map(|page| (page, self.cached_bases[idx], self.cached_ends[idx]))
    }

    #[inline]
    pub fn cache_page(&mut self, class: PageClass, page: NonNull<Page>, base: usize, end: usize) {
        let idx = class.index();
        self.cached_pages[idx] = Some(page);
        self.cached_bases[idx] = base;
        self.cached_ends[idx] = end;
    }

    /// Clears the cached page for `class` if it is `page`. Idempotent.
    #[inline]
    pub fn clear_cached_page(&mut self, class: PageClass, page: NonNull<Page>) {
        let idx = class.index();
        if self.cached_pages[idx] == Some(page) {
            self.cached_pages[idx] = None;
            self.cached_bases[idx] = 0;
            self.cached_ends[idx] = 0;
        }
    }

    #[inline]
    pub fn preferred_segment(&self, class: PageClass) -> Option<u32> {
        self.preferred_segments[class.index()]
    }

    #[inline]
    pub fn set_preferred_segment(&mut self, class: PageClass, index: u32) {
        self.preferred_segments[class.index()] = Some(index);
    }

    /// Drops every hint. Used when the heap tears its metadata down.
    pub fn clear(&mut self) {
        self.cached_pages = [None; SEGMENT_CLASSES];
        self.cached_bases = [0; SEGMENT_CLASSES];
        self.cached_ends = [0; SEGMENT_CLASSES];
        self.preferred_segments = [None; SEGMENT_CLASSES];
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        LIVE_THREADS.fetch_sub(1, Ordering::Relaxed);
    }
}
