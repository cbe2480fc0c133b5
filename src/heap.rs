use std::{
    collections::VecDeque,
    mem,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, OnceLock, PoisonError, RwLock,
    },
};

use crate::{
    chunk::{ChunkHeader, XlHeader, CHUNK_MAGIC, XL_HEADER_SIZE, XL_MAGIC},
    class::{bucket_for, PageClass, SEGMENT_ALIGN, SEGMENT_CLASSES, SEGMENT_SIZE},
    page::{Page, PageStatus},
    platform,
    ring::RING_CAPACITY,
    segment::{generate_canary, Segment},
    stats,
    stripe::PAGE_LOCKS,
    tcache::{self, ThreadCache},
};

/// Segments popped off a class shard's non-full queue per allocation
/// before giving up on the queue.
const NON_FULL_PROBES: usize = 64;
/// Prefix of the shard's full segment list scanned when the queue came
/// up empty.
const SCAN_PREFIX: usize = 128;

/// The reserved virtual region and the bump cursor into it. The cursor
/// never decreases; it is bumped only under the growth lock.
struct Reserved {
    /// What `reserve` actually returned; this is what gets unmapped.
    raw_base: NonNull<u8>,
    raw_size: usize,
    /// First segment-aligned address inside the raw range.
    aligned_base: usize,
    /// Bytes available starting at `aligned_base`.
    usable_size: usize,
    cursor: usize,
}

unsafe impl Send for Reserved {}

/// Per-class shard: the membership list and the FIFO of segments
/// believed to have free space. Both hold indices into the heap-wide
/// registry; the `enqueued` flag on the segment keeps the deque a set.
#[derive(Default)]
struct Shard {
    members: Vec<u32>,
    non_full: VecDeque<u32>,
}

/// Process-wide allocator root. Owns the reserved region, all segments,
/// the class shards and the XL bookkeeping. Created once and kept for
/// the process lifetime; `clear_metadata` returns the memory but leaves
/// the struct reusable for a later `init_reserved`.
pub(crate) struct Heap {
    /// Guards growth (reserved cursor, new segments) and teardown.
    growth: Mutex<Option<Reserved>>,
    /// All live segments. Readers resolve shard indices here; writers
    /// only append, under the growth lock.
    segments: RwLock<Vec<Arc<Segment>>>,
    shards: [Mutex<Shard>; SEGMENT_CLASSES],
    /// Live XL mappings `(base, mapping_size)`. Free dispatch never
    /// consults this; it exists so teardown can unmap stragglers.
    xl_mappings: Mutex<Vec<(usize, usize)>>,
    canary: AtomicU64,
    initialized: AtomicBool,
    /// Wipe user bytes on free. Init-time toggle, default off.
    zero_on_free: AtomicBool,
    /// Verify recycled chunks are still zero at allocation time. Only
    /// meaningful together with `zero_on_free`. Default off.
    uaf_check: AtomicBool,
    /// Back XL mappings with huge pages when possible. Default off.
    huge_xl: AtomicBool,
}

pub(crate) fn heap() -> &'static Heap {
    static HEAP: OnceLock<Heap> = OnceLock::new();
    HEAP.get_or_init(Heap::new)
}

impl Heap {
    fn new() -> Self {
        Self {
            growth: Mutex::new(None),
            segments: RwLock::new(Vec::new()),
            shards: [(); SEGMENT_CLASSES].map(|_| Mutex::new(Shard::default())),
            xl_mappings: Mutex::new(Vec::new()),
            canary: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            zero_on_free: AtomicBool::new(false),
            uaf_check: AtomicBool::new(false),
            huge_xl: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn set_zero_on_free(&self, enabled: bool) {
        self.zero_on_free.store(enabled, Ordering::Relaxed);
    }

    pub fn set_uaf_check(&self, enabled: bool) {
        self.uaf_check.store(enabled, Ordering::Relaxed);
    }

    pub fn set_huge_pages_for_xl(&self, enabled: bool) {
        self.huge_xl.store(enabled, Ordering::Relaxed);
    }

    /// Reserves the virtual region and bootstraps one segment per non-XL
    /// class so the first allocations don't pay the growth path. Returns
    /// false when the OS refuses the reservation.
    pub fn init_reserved(&self, size: usize) -> bool {
        // Heap locks are poison-tolerant throughout: a thread that
        // panicked while holding one must not turn every later malloc
        // into a panic, and the guarded state stays consistent because
        // nothing here unwinds between related updates.
        let mut growth = self.growth.lock().unwrap_or_else(PoisonError::into_inner);
        if self.initialized.load(Ordering::Relaxed) {
            return true;
        }

        // Over-reserve by one alignment so every segment carved out of
        // the region is segment-aligned regardless of where the kernel
        // put the mapping.
        let raw_size = size + SEGMENT_ALIGN;
        let Some(raw_base) = (unsafe { platform::reserve(raw_size) }) else {
            return false;
        };

        let aligned_base = crate::class::align_up(raw_base.as_ptr() as usize, SEGMENT_ALIGN);
        let usable_size = raw_size - (aligned_base - raw_base.as_ptr() as usize);

        *growth = Some(Reserved {
            raw_base,
            raw_size,
            aligned_base,
            usable_size,
            cursor: 0,
        });
        self.canary.store(generate_canary(), Ordering::Relaxed);

        // Keep one small, one medium and one large segment active from
        // the start.
        for class in [PageClass::Small, PageClass::Medium, PageClass::Large] {
            if self.add_segment_from_reserved(&mut growth, class).is_none() {
                return false;
            }
        }

        self.initialized.store(true, Ordering::Release);
        true
    }

    /// Bumps the reserved cursor by one segment, commits the range and
    /// registers a segment of `class` over it. `None` when the reserved
    /// region is exhausted or commit fails.
    fn add_segment_from_reserved(
        &self,
        growth: &mut Option<Reserved>,
        class: PageClass,
    ) -> Option<Arc<Segment>> {
        let reserved = growth.as_mut()?;
        if reserved.cursor + SEGMENT_SIZE > reserved.usable_size {
            return None;
        }

        let seg_base = reserved.aligned_base + reserved.cursor;
        let base = NonNull::new(seg_base as *mut u8)?;
        if !unsafe { platform::commit(base, SEGMENT_SIZE) } {
            return None;
        }
        reserved.cursor += SEGMENT_SIZE;

        Some(self.register_segment(base, class, false))
    }

    /// Appends a segment to the registry and its class shard, wiring the
    /// page back-references before anyone can see it.
    fn register_segment(&self, base: NonNull<u8>, class: PageClass, standalone: bool) -> Arc<Segment> {
        let mut registry = self.segments.write().unwrap_or_else(PoisonError::into_inner);
        let index = registry.len() as u32;
        let segment = Arc::new(Segment::new(base, class, index, standalone));
        segment.wire_page_back_refs();
        registry.push(Arc::clone(&segment));
        drop(registry);

        stats::record_mmap(SEGMENT_SIZE);
        stats::record_metadata(
            mem::size_of::<Segment>()
                + segment.page_count() * (mem::size_of::<Page>() + RING_CAPACITY * 16),
        );

        let mut shard = self.shards[class.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        shard.members.push(index);
        if segment.try_mark_enqueued() {
            shard.non_full.push_back(index);
        }

        segment
    }

    fn segment_by_index(&self, index: u32) -> Option<Arc<Segment>> {
        self.segments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index as usize)
            .cloned()
    }

    /// The 7-step allocation path of the segmented heap. Returns a
    /// pointer aligned to at least 16 bytes, or `None` on exhaustion.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let class = PageClass::for_size(size);
        if class == PageClass::Xl {
            return self.allocate_xl(size);
        }

        let bucketed = bucket_for(class, size);

        let (cached, preferred) = ThreadCache::with(|tc| {
            (tc.cached_page(class), tc.preferred_segment(class))
        });
        // Read only after the cache above registered this thread, so a
        // freshly started thread never takes the lockless path while an
        // older thread is still running.
        let multi = tcache::is_multi_threaded();

        // 1. Hot page cached by this thread.
        if let Some((page, page_base, _)) = cached {
            if let Some(ptr) = self.allocate_from_cached(page, page_base, size, multi) {
                self.finish_segment_alloc(class, page, ptr);
                return Some(ptr);
            }
        }

        // 2. The segment that last served this thread and class.
        if let Some(index) = preferred {
            if let Some(segment) = self.segment_by_index(index) {
                if segment.class() == class && segment.can_hold_request(size) {
                    if let Some((ptr, page)) = segment.allocate(size, bucketed, multi) {
                        self.finish_segment_alloc(class, page, ptr);
                        return Some(ptr);
                    }
                }
            }
        }

        // 3. Segments queued as having free space, bounded probes.
        for _ in 0..NON_FULL_PROBES {
            let index = {
                let mut shard = self.shards[class.index()]
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                shard.non_full.pop_front()
            };
            let Some(index) = index else { break };
            let Some(segment) = self.segment_by_index(index) else { continue };
            segment.clear_enqueued();

            let result = if segment.can_hold_request(size) {
                segment.allocate(size, bucketed, multi)
            } else {
                None
            };

            // Whatever happened, a segment that still has room and can
            // still serve this bucket goes back in the queue.
            if segment.has_free_pages() && segment.can_hold_request(size) {
                self.enqueue_non_full(&segment);
            }

            if let Some((ptr, page)) = result {
                self.finish_segment_alloc(class, page, ptr);
                return Some(ptr);
            }
        }

        // 4. Bounded scan of the shard membership, for segments the
        // queue lost track of.
        let candidates: Vec<u32> = {
            let shard = self.shards[class.index()]
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            shard.members.iter().take(SCAN_PREFIX).copied().collect()
        };
        for index in candidates {
            let Some(segment) = self.segment_by_index(index) else { continue };
            if !segment.can_hold_request(size) {
                continue;
            }
            if let Some((ptr, page)) = segment.allocate(size, bucketed, multi) {
                self.finish_segment_alloc(class, page, ptr);
                return Some(ptr);
            }
        }

        // 5. Grow: carve a segment out of the reserved region, falling
        // back to a standalone aligned mapping when it's exhausted.
        let segment = {
            let mut growth = self.growth.lock().unwrap_or_else(PoisonError::into_inner);
            match self.add_segment_from_reserved(&mut growth, class) {
                Some(segment) => Some(segment),
                None => unsafe { platform::map_aligned(SEGMENT_SIZE, SEGMENT_ALIGN) }
                    .map(|base| self.register_segment(base, class, true)),
            }
        };

        if let Some(segment) = segment {
            if let Some((ptr, page)) = segment.allocate(size, bucketed, multi) {
                self.finish_segment_alloc(class, page, ptr);
                return Some(ptr);
            }
        }

        None
    }

    /// Fast path over the thread's cached page: one stripe lock, one
    /// bitmap scan. The lock stripe comes from the cached bounds so the
    /// page itself isn't touched before the lock is held.
    fn allocate_from_cached(
        &self,
        page: NonNull<Page>,
        page_base: usize,
        size: usize,
        multi: bool,
    ) -> Option<NonNull<u8>> {
        unsafe {
            let page_ref = page.as_ref();
            let _guard = PAGE_LOCKS.lock(page_base, multi);
            if !page_ref.can_hold(size) {
                return None;
            }
            let (ptr, change) = page_ref.allocate(size)?;
            let segment = &*(page_ref.owning_segment() as *const Segment);
            segment.note_transition(change);
            Some(ptr)
        }
    }

    /// Success bookkeeping shared by every segment-backed path: verify
    /// the recycle is clean when the UAF check is armed, refresh the
    /// thread hints and stamp the last-alloc usable bytes.
    fn finish_segment_alloc(&self, class: PageClass, page: NonNull<Page>, ptr: NonNull<u8>) {
        unsafe {
            let page_ref = page.as_ref();
            let usable = page_ref.chunk_usable();

            if self.uaf_check.load(Ordering::Relaxed) && self.zero_on_free.load(Ordering::Relaxed)
            {
                // Zero-on-free wiped this chunk when it was released; a
                // dirty byte now means someone wrote through a stale
                // pointer.
                let bytes = std::slice::from_raw_parts(ptr.as_ptr(), usable);
                crate::chunk::integrity_check!(
                    bytes.iter().all(|&b| b == 0),
                    "use after free detected on recycled chunk"
                );
            }

            let segment = &*(page_ref.owning_segment() as *const Segment);
            let base = page_ref.base();
            ThreadCache::with(|tc| {
                tc.cache_page(class, page, base, base + page_ref.span());
                tc.set_preferred_segment(class, segment.index());
            });
            stats::set_last_alloc_usable(usable);
        }
    }

    /// Puts a segment back on its class shard's non-full queue if it is
    /// not already there.
    fn enqueue_non_full(&self, segment: &Segment) {
        if segment.try_mark_enqueued() {
            let mut shard = self.shards[segment.class().index()]
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            shard.non_full.push_back(segment.index());
        }
    }

    /// XL requests bypass classing: one dedicated mapping per chunk,
    /// sized to the request plus the magic-tagged header.
    fn allocate_xl(&self, size: usize) -> Option<NonNull<u8>> {
        let mapping_size = platform::page_align(size.checked_add(XL_HEADER_SIZE)?);

        let base = unsafe {
            if self.huge_xl.load(Ordering::Relaxed) {
                platform::map_huge(mapping_size)
            } else {
                platform::map_aligned(mapping_size, platform::page_size())
            }
        }?;

        let usable = mapping_size - XL_HEADER_SIZE;
        let user = unsafe { XlHeader::stamp(base, mapping_size, usable) };

        stats::record_mmap(mapping_size);
        self.xl_mappings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((base.as_ptr() as usize, mapping_size));
        stats::set_last_alloc_usable(usable);

        Some(user)
    }

    /// O(1) free dispatch: decode the header behind the pointer, route
    /// to the owning page (or the XL unmap), report the usable bytes.
    /// Returns false when the pointer carries neither magic, i.e. was
    /// never issued by this allocator; the caller escalates that.
    ///
    /// # Safety
    ///
    /// `ptr` must be a pointer previously returned by [`Heap::allocate`]
    /// and not freed since, or at minimum an address whose preceding 32
    /// bytes are readable.
    pub unsafe fn free(&self, ptr: NonNull<u8>, usable_out: &mut usize) -> bool {
        // A thread whose first heap call is a free still has to count
        // towards the live-thread total before the single-threaded fast
        // path is consulted.
        ThreadCache::with(|_| {});

        let header = ChunkHeader::from_user_ptr(ptr).as_ptr();
        if (*header).magic == CHUNK_MAGIC && !(*header).owner.is_null() {
            self.free_chunk(ptr, NonNull::new_unchecked((*header).owner), usable_out);
            return true;
        }

        let xl = XlHeader::from_user_ptr(ptr).as_ptr();
        if (*xl).magic == XL_MAGIC {
            self.free_xl(ptr, NonNull::new_unchecked(xl), usable_out);
            return true;
        }

        false
    }

    unsafe fn free_chunk(&self, ptr: NonNull<u8>, page: NonNull<Page>, usable_out: &mut usize) {
        let page_ref = page.as_ref();
        let class = page_ref.class();
        let segment = &*(page_ref.owning_segment() as *const Segment);
        let multi = tcache::is_multi_threaded();
        let zero = self.zero_on_free.load(Ordering::Relaxed);

        // A free from a thread that doesn't own the page goes through
        // the page's ring; the owner applies it later. A full ring falls
        // back to the locked path, a free is never dropped.
        let owner = page_ref.owner_tid();
        if owner != 0 && owner != tcache::current_tid() {
            if zero {
                ptr.as_ptr().write_bytes(0, page_ref.chunk_usable());
            }
            if let Some(usable) = page_ref.enqueue_deferred_free(ptr) {
                *usable_out = usable;
                return;
            }
        }

        let change = segment.free_on_page(page, ptr, zero, multi, usable_out);

        if change.before == PageStatus::Full && change.after != PageStatus::Full {
            self.enqueue_non_full(segment);
        }

        ThreadCache::with(|tc| {
            let base = page_ref.base();
            tc.cache_page(class, page, base, base + page_ref.span());
            if change.after == PageStatus::Empty {
                tc.clear_cached_page(class, page);
            }
        });
    }

    unsafe fn free_xl(&self, ptr: NonNull<u8>, header: NonNull<XlHeader>, usable_out: &mut usize) {
        let mapping_size = header.as_ref().mapping_size;
        let usable = header.as_ref().usable;
        if self.zero_on_free.load(Ordering::Relaxed) {
            ptr.as_ptr().write_bytes(0, usable);
        }

        let base = XlHeader::mapping_base(header);
        {
            let mut mappings = self
                .xl_mappings
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(at) = mappings
                .iter()
                .position(|&(addr, _)| addr == base.as_ptr() as usize)
            {
                mappings.swap_remove(at);
            }
        }

        platform::unmap(base, mapping_size);
        stats::record_munmap(mapping_size);
        *usable_out = usable;
    }

    /// Mirror of [`Heap::free`] that releases nothing. 0 for pointers
    /// that aren't ours.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let header = ChunkHeader::from_user_ptr(ptr).as_ptr();
        if (*header).magic == CHUNK_MAGIC && !(*header).owner.is_null() {
            let page = &*(*header).owner;
            return page.usable_size(ptr);
        }

        let xl = XlHeader::from_user_ptr(ptr).as_ptr();
        if (*xl).magic == XL_MAGIC {
            return (*xl).usable;
        }

        0
    }

    /// Best-effort consistency check over every segment. False means
    /// something is wrong somewhere, not where.
    pub fn validate(&self) -> bool {
        if self.is_initialized() && self.canary.load(Ordering::Relaxed) == 0 {
            return false;
        }
        let multi = tcache::is_multi_threaded();
        let registry = self.segments.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .iter()
            .all(|segment| segment.page_count() > 0 && segment.validate(multi))
    }

    /// Returns every mapping to the OS and drops all bookkeeping. For
    /// process teardown and test fixtures only; calling this with live
    /// allocations in other threads is undefined behaviour.
    pub fn clear_metadata(&self) {
        let mut growth = self.growth.lock().unwrap_or_else(PoisonError::into_inner);

        let segments: Vec<Arc<Segment>> = {
            let mut registry = self.segments.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *registry)
        };
        for segment in &segments {
            if segment.is_standalone() {
                unsafe { platform::unmap(segment.base(), SEGMENT_SIZE) };
            }
            stats::record_munmap(SEGMENT_SIZE);
        }

        if let Some(reserved) = growth.take() {
            unsafe { platform::unmap(reserved.raw_base, reserved.raw_size) };
        }

        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            shard.members.clear();
            shard.non_full.clear();
        }

        let mappings: Vec<(usize, usize)> = std::mem::take(
            &mut *self
                .xl_mappings
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (base, mapping_size) in mappings {
            unsafe {
                platform::unmap(NonNull::new_unchecked(base as *mut u8), mapping_size);
            }
            stats::record_munmap(mapping_size);
        }

        ThreadCache::with(|tc| tc.clear());
        self.canary.store(0, Ordering::Relaxed);
        self.initialized.store(false, Ordering::Release);
    }
}
