use std::{cell::UnsafeCell, ptr::NonNull, sync::atomic::{AtomicU32, Ordering}};

use crate::{
    chunk::{integrity_check, ChunkHeader, CHUNK_MAGIC},
    class::{PageClass, CHUNK_HEADER_SIZE},
    ring::DeferredRing,
    tcache,
};

/// Ring occupancy at which [`Page::allocate`] opportunistically drains
/// deferred frees before scanning the bitmap.
const DRAIN_RING_THRESHOLD: usize = 32;
/// Only drain when the page is this close to running out of slots.
const DRAIN_MIN_FREE_SLOTS: usize = 4;
/// Deferred frees applied per opportunistic drain.
const DRAIN_BATCH: usize = 16;

/// Occupancy of a page as observed by its segment.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PageStatus {
    Empty,
    Active,
    Full,
}

/// Status of a page before and after an operation. The segment uses the
/// Full transitions to maintain its full-page counter and the heap uses
/// the non-Full transition to re-enqueue the segment.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StatusChange {
    pub before: PageStatus,
    pub after: PageStatus,
}

/// State only ever touched by the thread holding the page's stripe lock.
struct PageState {
    /// First byte of the page span. 0 until [`Page::init`] runs.
    base: usize,
    /// Distance between slots: bucketed chunk size plus header.
    stride: usize,
    /// Bytes a chunk of this page can hold (`stride - header`).
    chunk_usable: usize,
    /// Number of slots.
    capacity: usize,
    /// Slots currently handed out (including ones with a pending
    /// deferred free).
    used: usize,
    /// Lowest slot index that may be free. Lowered by frees, raised by
    /// allocations.
    first_hint: usize,
    /// One bit per slot, set while the slot is handed out. Bits past
    /// `capacity` in the last word are permanently set so the scan never
    /// picks them.
    bitmap: Box<[u64]>,
    initialized: bool,
}

/// A fixed-stride slab of chunks inside one segment page span. One page
/// holds exactly one size class and one bucketed chunk stride, decided by
/// the first request routed to it.
///
/// ```text
/// +--------+--------+--------+--------+-----+--------+
/// | slot 0 | slot 1 | slot 2 | slot 3 | ... | slot N |   span bytes
/// +--------+--------+--------+--------+-----+--------+
///  each slot: [ChunkHeader][user bytes .. stride-16]
/// ```
///
/// All fields in [`PageState`] are protected by the page's stripe lock in
/// the [`crate::stripe::PageLocks`] table; they are accessed through raw
/// pointers so the lock-free readers of the remaining fields never alias
/// a Rust reference that is being mutated. The deferred ring is the only
/// state non-owner threads may write.
pub(crate) struct Page {
    class: PageClass,
    /// Page span in bytes, fixed by the class.
    span: usize,
    /// Thread that first allocated from this page; 0 when unowned.
    /// Frees from any other thread go through the deferred ring.
    owner_tid: AtomicU32,
    /// Non-owning back-reference to the segment this page sits in,
    /// wired once before the segment is published and read-only after.
    /// Ownership always flows segment ⊃ page, never the reverse.
    owning_segment: UnsafeCell<*const ()>,
    /// Cross-thread deferred frees.
    pub deferred: DeferredRing,
    state: UnsafeCell<PageState>,
}

// Pages are shared across threads: the ring is lock-free and everything
// in `state` is guarded by the stripe lock table.
unsafe impl Sync for Page {}
unsafe impl Send for Page {}

impl Page {
    pub fn new(class: PageClass) -> Self {
        Self {
            class,
            span: class.page_span(),
            owner_tid: AtomicU32::new(0),
            owning_segment: UnsafeCell::new(std::ptr::null()),
            deferred: DeferredRing::new(),
            state: UnsafeCell::new(PageState {
                base: 0,
                stride: 0,
                chunk_usable: 0,
                capacity: 0,
                used: 0,
                first_hint: 0,
                bitmap: Box::new([]),
                initialized: false,
            }),
        }
    }

    #[inline]
    pub fn class(&self) -> PageClass {
        self.class
    }

    #[inline]
    pub fn span(&self) -> usize {
        self.span
    }

    #[inline]
    pub fn owner_tid(&self) -> u32 {
        self.owner_tid.load(Ordering::Relaxed)
    }

    /// Wires the back-reference to the owning segment. Called exactly
    /// once, before the segment becomes visible to other threads.
    ///
    /// # Safety
    ///
    /// No other thread may be reading the back-reference yet.
    pub unsafe fn set_owning_segment(&self, segment: *const ()) {
        *self.owning_segment.get() = segment;
    }

    /// The segment this page belongs to, as wired at registration. Typed
    /// as an opaque pointer to keep the page below the segment in the
    /// module graph; [`crate::heap`] casts it back.
    #[inline]
    pub fn owning_segment(&self) -> *const () {
        unsafe { *self.owning_segment.get() }
    }

    /// # Safety
    ///
    /// All methods below that read or write [`PageState`] must be called
    /// either under the page's stripe lock or while the process is
    /// provably single threaded, except where noted otherwise.
    #[inline]
    pub unsafe fn initialized(&self) -> bool {
        (*self.state.get()).initialized
    }

    #[inline]
    pub unsafe fn base(&self) -> usize {
        (*self.state.get()).base
    }

    #[inline]
    pub unsafe fn chunk_usable(&self) -> usize {
        (*self.state.get()).chunk_usable
    }

    #[inline]
    pub unsafe fn used(&self) -> usize {
        (*self.state.get()).used
    }

    #[inline]
    pub unsafe fn capacity(&self) -> usize {
        (*self.state.get()).capacity
    }

    #[inline]
    pub unsafe fn status(&self) -> PageStatus {
        let state = self.state.get();
        if !(*state).initialized || (*state).used == 0 {
            PageStatus::Empty
        } else if (*state).used == (*state).capacity {
            PageStatus::Full
        } else {
            PageStatus::Active
        }
    }

    /// Constructs the slab over `[base, base + span)` for chunks of the
    /// given bucketed size. Returns false when the geometry doesn't work
    /// out (a request too big for the span).
    pub unsafe fn init(&self, base: usize, bucketed_size: usize) -> bool {
        if base == 0 || bucketed_size == 0 {
            return false;
        }

        let stride = bucketed_size + CHUNK_HEADER_SIZE;
        if stride > self.span {
            return false;
        }

        // Large pages hold exactly one chunk, which is what makes
        // in-place retuning possible; the other classes pack as many
        // strides as fit.
        let capacity = if self.class == PageClass::Large {
            1
        } else {
            self.span / stride
        };
        if capacity == 0 {
            return false;
        }

        let words = capacity.div_ceil(64);
        let mut bitmap = vec![0u64; words].into_boxed_slice();
        // Mark the slack bits of the last word as used forever.
        let tail = capacity % 64;
        if tail != 0 {
            bitmap[words - 1] = !0u64 << tail;
        }

        let state = self.state.get();
        (*state).base = base;
        (*state).stride = stride;
        (*state).chunk_usable = bucketed_size;
        (*state).capacity = capacity;
        (*state).used = 0;
        (*state).first_hint = 0;
        (*state).bitmap = bitmap;
        (*state).initialized = true;
        self.owner_tid.store(0, Ordering::Relaxed);
        true
    }

    /// Re-derives stride and capacity for a new request without
    /// releasing the page. Permitted only for the Large class and only
    /// while the page is empty; Small and Medium bucket across many
    /// pages per segment, so for them this is a no-op.
    pub unsafe fn retune_if_empty(&self, bucketed_size: usize) -> bool {
        let state = self.state.get();
        if self.class != PageClass::Large || !(*state).initialized || (*state).used != 0 {
            return false;
        }
        let base = (*state).base;
        self.init(base, bucketed_size)
    }

    /// Whether a request of `size` bytes fits a chunk of this page.
    #[inline]
    pub unsafe fn can_hold(&self, size: usize) -> bool {
        let state = self.state.get();
        (*state).initialized && size <= (*state).chunk_usable
    }

    /// Hands out a free slot for a request of `size` bytes. When the
    /// deferred ring has accumulated enough entries and the page is
    /// nearly full, a bounded batch of deferred frees is applied first.
    pub unsafe fn allocate(&self, size: usize) -> Option<(NonNull<u8>, StatusChange)> {
        if !self.can_hold(size) {
            return None;
        }

        let before = self.status();
        let state = self.state.get();

        if self.deferred.len() >= DRAIN_RING_THRESHOLD
            && (*state).capacity - (*state).used < DRAIN_MIN_FREE_SLOTS
        {
            self.drain_deferred(DRAIN_BATCH);
        }

        let slot = self.find_free_slot()?;
        let word = slot / 64;
        (*state).bitmap[word] |= 1u64 << (slot % 64);
        (*state).used += 1;
        (*state).first_hint = slot;

        if self.owner_tid.load(Ordering::Relaxed) == 0 {
            self.owner_tid.store(tcache::current_tid(), Ordering::Relaxed);
        }

        let slot_addr = (*state).base + slot * (*state).stride;
        let user = ChunkHeader::stamp(
            NonNull::new_unchecked(slot_addr as *mut u8),
            self as *const Page as *mut Page,
            slot as u32,
        );

        Some((
            user,
            StatusChange {
                before,
                after: self.status(),
            },
        ))
    }

    /// First clear bit at or above the hint, or `None` when the page is
    /// full. No free slot exists below the hint: allocations move it up
    /// to the slot they take and frees pull it back down.
    unsafe fn find_free_slot(&self) -> Option<usize> {
        let state = self.state.get();
        let bitmap = &(*state).bitmap;
        for word in (*state).first_hint / 64..bitmap.len() {
            let bits = bitmap[word];
            if bits != u64::MAX {
                return Some(word * 64 + (!bits).trailing_zeros() as usize);
            }
        }
        None
    }

    /// Frees a chunk on the owner path. Aborts on a corrupt header or a
    /// double free. Reports the chunk's usable bytes through `usable_out`
    /// so the caller doesn't re-derive them.
    pub unsafe fn free_local(
        &self,
        user_ptr: NonNull<u8>,
        zero_on_free: bool,
        usable_out: &mut usize,
    ) -> StatusChange {
        let slot = self.checked_slot(user_ptr);
        let state = self.state.get();

        if zero_on_free {
            user_ptr.as_ptr().write_bytes(0, (*state).chunk_usable);
        }

        let before = self.status();
        self.apply_free(slot);
        *usable_out = (*state).chunk_usable;

        StatusChange {
            before,
            after: self.status(),
        }
    }

    /// Queues a free performed by a non-owner thread. Validates the
    /// header exactly like the locked path, then pushes onto the ring.
    /// Returns `None` when the ring is full, in which case the caller
    /// falls back to the locked path; a free is never dropped.
    ///
    /// This is safe to call without the stripe lock: it only reads page
    /// geometry that is frozen while any chunk of the page is live, and
    /// the ring itself is lock-free.
    pub unsafe fn enqueue_deferred_free(&self, user_ptr: NonNull<u8>) -> Option<usize> {
        let _ = self.checked_slot(user_ptr);
        let usable = (*self.state.get()).chunk_usable;
        self.deferred
            .push(user_ptr.as_ptr())
            .then_some(usable)
    }

    /// Applies up to `max` queued deferred frees. Caller holds the
    /// stripe lock.
    pub unsafe fn drain_deferred(&self, max: usize) -> usize {
        let mut applied = 0;
        while applied < max {
            let Some(ptr) = self.deferred.pop() else { break };
            let slot = self.checked_slot(NonNull::new_unchecked(ptr));
            self.apply_free(slot);
            applied += 1;
        }
        applied
    }

    /// Validated usable size of the chunk at `user_ptr`.
    pub unsafe fn usable_size(&self, user_ptr: NonNull<u8>) -> usize {
        let _ = self.checked_slot(user_ptr);
        (*self.state.get()).chunk_usable
    }

    /// Clears a slot's bit and lowers the hint. Aborts when the bit is
    /// already clear, which is how double frees surface.
    unsafe fn apply_free(&self, slot: usize) {
        let state = self.state.get();
        let word = slot / 64;
        let mask = 1u64 << (slot % 64);
        integrity_check!((*state).bitmap[word] & mask != 0, "double free");
        (*state).bitmap[word] &= !mask;
        (*state).used -= 1;
        if slot < (*state).first_hint {
            (*state).first_hint = slot;
        }
    }

    /// Validates the header behind `user_ptr` against this page and
    /// returns the slot index. Aborts on any mismatch: magic, ownership,
    /// slot range, or the slot address not reconstructing the pointer.
    unsafe fn checked_slot(&self, user_ptr: NonNull<u8>) -> usize {
        let header = ChunkHeader::from_user_ptr(user_ptr).as_ptr();
        integrity_check!((*header).magic == CHUNK_MAGIC, "corrupt chunk header");
        integrity_check!(
            (*header).owner == self as *const Page as *mut Page,
            "chunk does not belong to this page"
        );

        let slot = (*header).slot as usize;
        let state = self.state.get();
        integrity_check!(slot < (*state).capacity, "chunk slot out of range");

        let expected = (*state).base + slot * (*state).stride + CHUNK_HEADER_SIZE;
        integrity_check!(
            user_ptr.as_ptr() as usize == expected,
            "chunk address does not reconstruct"
        );
        slot
    }

    /// Number of set bits within `[0, capacity)`. Validation hook.
    pub unsafe fn bitmap_popcount(&self) -> usize {
        let state = self.state.get();
        let mut count: usize = 0;
        for word in (*state).bitmap.iter() {
            count += word.count_ones() as usize;
        }
        // The permanently-set slack bits of the last word don't count.
        let tail = (*state).capacity % 64;
        if tail != 0 {
            count -= 64 - tail;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{class::{bucket_for, MEDIUM_PAGE_SIZE, SMALL_PAGE_SIZE}, platform};

    /// Backs a page with an anonymous mapping for unit testing; the
    /// segment normally provides the span.
    struct Span {
        base: NonNull<u8>,
        len: usize,
    }

    impl Span {
        fn as_ptr(&self) -> *mut u8 {
            self.base.as_ptr()
        }
    }

    impl Drop for Span {
        fn drop(&mut self) {
            unsafe { platform::unmap(self.base, self.len) };
        }
    }

    fn spanned(class: PageClass) -> (Page, Span) {
        let page = Page::new(class);
        let len = class.page_span();
        let base = unsafe { platform::map_aligned(len, len).unwrap() };
        (page, Span { base, len })
    }

    #[test]
    fn init_geometry() {
        let (page, backing) = spanned(PageClass::Small);
        unsafe {
            assert!(!page.initialized());
            assert_eq!(page.status(), PageStatus::Empty);

            assert!(page.init(backing.as_ptr() as usize, 256));
            assert!(page.initialized());
            assert_eq!(page.chunk_usable(), 256);
            assert_eq!(page.capacity(), SMALL_PAGE_SIZE / (256 + 16));
            assert_eq!(page.used(), 0);
            assert!(page.can_hold(256));
            assert!(page.can_hold(1));
            assert!(!page.can_hold(257));
        }
    }

    #[test]
    fn init_rejects_oversized_request() {
        let (page, backing) = spanned(PageClass::Small);
        unsafe {
            assert!(!page.init(backing.as_ptr() as usize, SMALL_PAGE_SIZE));
            assert!(!page.init(backing.as_ptr() as usize, 0));
            assert!(!page.init(0, 256));
        }
    }

    #[test]
    fn allocate_and_free_roundtrip() {
        let (page, backing) = spanned(PageClass::Small);
        unsafe {
            page.init(backing.as_ptr() as usize, 64);

            let (ptr, change) = page.allocate(64).unwrap();
            assert_eq!(change.before, PageStatus::Empty);
            assert_eq!(change.after, PageStatus::Active);
            assert_eq!(page.used(), 1);
            assert_eq!(page.owner_tid(), tcache::current_tid());
            assert_eq!(ptr.as_ptr() as usize % 16, 0);

            // The whole usable span must be writable.
            ptr.as_ptr().write_bytes(0xAA, page.chunk_usable());

            let mut usable = 0;
            let change = page.free_local(ptr, false, &mut usable);
            assert_eq!(usable, 64);
            assert_eq!(change.after, PageStatus::Empty);
            assert_eq!(page.used(), 0);
        }
    }

    #[test]
    fn fills_to_capacity_and_reports_full() {
        let (page, backing) = spanned(PageClass::Small);
        unsafe {
            page.init(backing.as_ptr() as usize, 8 * 1024);
            let capacity = page.capacity();
            assert!(capacity >= 2);

            let mut last = None;
            for i in 0..capacity {
                let (ptr, change) = page.allocate(100).unwrap();
                if i == capacity - 1 {
                    assert_eq!(change.after, PageStatus::Full);
                }
                last = Some(ptr);
            }
            assert!(page.allocate(100).is_none());
            assert_eq!(page.used(), capacity);
            assert_eq!(page.bitmap_popcount(), capacity);

            let mut usable = 0;
            let change = page.free_local(last.unwrap(), false, &mut usable);
            assert_eq!(change.before, PageStatus::Full);
            assert_eq!(change.after, PageStatus::Active);
        }
    }

    #[test]
    fn freed_slots_are_reused_lowest_first() {
        let (page, backing) = spanned(PageClass::Small);
        unsafe {
            page.init(backing.as_ptr() as usize, 128);

            let ptrs: Vec<_> = (0..8).map(|_| page.allocate(128).unwrap().0).collect();
            let mut usable = 0;
            page.free_local(ptrs[2], false, &mut usable);
            page.free_local(ptrs[5], false, &mut usable);

            // The hint was lowered to slot 2, so it comes back first.
            let (again, _) = page.allocate(128).unwrap();
            assert_eq!(again, ptrs[2]);
            let (again, _) = page.allocate(128).unwrap();
            assert_eq!(again, ptrs[5]);
        }
    }

    #[test]
    fn zero_on_free_wipes_user_bytes() {
        let (page, backing) = spanned(PageClass::Small);
        unsafe {
            page.init(backing.as_ptr() as usize, 64);
            let (ptr, _) = page.allocate(64).unwrap();
            ptr.as_ptr().write_bytes(0xFF, 64);

            let mut usable = 0;
            page.free_local(ptr, true, &mut usable);
            for i in 0..64 {
                assert_eq!(*ptr.as_ptr().add(i), 0);
            }
        }
    }

    #[test]
    fn deferred_frees_drain_on_allocate() {
        let (page, backing) = spanned(PageClass::Small);
        unsafe {
            // 256 byte buckets: enough capacity that the ring threshold
            // is reachable.
            page.init(backing.as_ptr() as usize, 256);
            let capacity = page.capacity();
            assert!(capacity > DRAIN_RING_THRESHOLD + DRAIN_MIN_FREE_SLOTS);

            let ptrs: Vec<_> = (0..capacity).map(|_| page.allocate(256).unwrap().0).collect();
            assert_eq!(page.status(), PageStatus::Full);

            // Queue enough deferred frees to cross the drain threshold.
            for ptr in ptrs.iter().take(DRAIN_RING_THRESHOLD + 4) {
                assert!(page.enqueue_deferred_free(*ptr).is_some());
            }
            // Nothing applied yet: used still reflects every slot.
            assert_eq!(page.used(), capacity);

            // The page is out of free slots and the ring is over the
            // threshold, so this allocation drains a batch and succeeds.
            let (ptr, change) = page.allocate(256).unwrap();
            assert_eq!(change.before, PageStatus::Full);
            assert!(page.used() < capacity);
            assert!(!ptr.as_ptr().is_null());
        }
    }

    #[test]
    fn explicit_drain_applies_bounded_batches() {
        let (page, backing) = spanned(PageClass::Small);
        unsafe {
            page.init(backing.as_ptr() as usize, 256);
            let ptrs: Vec<_> = (0..10).map(|_| page.allocate(256).unwrap().0).collect();
            for ptr in &ptrs {
                page.enqueue_deferred_free(*ptr).unwrap();
            }

            assert_eq!(page.drain_deferred(4), 4);
            assert_eq!(page.used(), 6);
            assert_eq!(page.drain_deferred(usize::MAX), 6);
            assert_eq!(page.used(), 0);
            assert_eq!(page.drain_deferred(usize::MAX), 0);
        }
    }

    #[test]
    fn retune_only_for_empty_large_pages() {
        let (page, backing) = spanned(PageClass::Large);
        unsafe {
            let bucket = bucket_for(PageClass::Large, 200 * 1024);
            page.init(backing.as_ptr() as usize, bucket);
            assert_eq!(page.capacity(), 1);
            assert_eq!(page.chunk_usable(), bucket);

            // Occupied pages don't retune.
            let (ptr, _) = page.allocate(bucket).unwrap();
            assert!(!page.retune_if_empty(512 * 1024));

            let mut usable = 0;
            page.free_local(ptr, false, &mut usable);
            assert!(page.retune_if_empty(512 * 1024));
            assert_eq!(page.chunk_usable(), 512 * 1024);
            assert!(page.can_hold(512 * 1024));
        }

        let (page, backing) = spanned(PageClass::Medium);
        unsafe {
            page.init(backing.as_ptr() as usize, 32 * 1024);
            // Small/Medium never retune.
            assert!(!page.retune_if_empty(64 * 1024));
            assert_eq!(page.chunk_usable(), 32 * 1024);
            assert!(page.capacity() >= 2);
            assert_eq!(page.span(), MEDIUM_PAGE_SIZE);
        }
    }

    #[test]
    fn usable_size_validates_and_reports() {
        let (page, backing) = spanned(PageClass::Small);
        unsafe {
            page.init(backing.as_ptr() as usize, 1024);
            let (ptr, _) = page.allocate(700).unwrap();
            // The bucket, not the request, decides usable bytes.
            assert_eq!(page.usable_size(ptr), 1024);
        }
    }
}
