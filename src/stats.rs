use std::{
    cell::Cell,
    sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering},
};

/// Runtime statistics snapshot, mirrored into the descriptor's stats
/// struct at the ABI boundary.
#[derive(Clone, Copy, Default, Debug)]
#[repr(C)]
pub struct AllocatorStats {
    /// Total bytes ever requested through malloc/calloc/realloc.
    pub bytes_allocated: usize,
    /// Usable bytes currently handed out.
    pub bytes_in_use: usize,
    /// Bookkeeping overhead (segment and page metadata, bitmaps, rings).
    pub bytes_metadata: usize,
    /// Bytes currently obtained from the OS (committed segments plus XL
    /// mappings; the untouched reserved tail doesn't count).
    pub bytes_mapped: usize,
    pub alloc_count: u64,
    pub free_count: u64,
    pub realloc_count: u64,
    pub mmap_count: u64,
    pub munmap_count: u64,
}

static ALLOC_COUNT: AtomicU64 = AtomicU64::new(0);
static FREE_COUNT: AtomicU64 = AtomicU64::new(0);
static REALLOC_COUNT: AtomicU64 = AtomicU64::new(0);
static MMAP_COUNT: AtomicU64 = AtomicU64::new(0);
static MUNMAP_COUNT: AtomicU64 = AtomicU64::new(0);
static BYTES_ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static BYTES_IN_USE: AtomicI64 = AtomicI64::new(0);
static BYTES_MAPPED: AtomicI64 = AtomicI64::new(0);
static BYTES_METADATA: AtomicUsize = AtomicUsize::new(0);

/// How many operations a thread batches locally before flushing into the
/// global atomics. Keeps the counters off the hot path.
const FLUSH_INTERVAL: u32 = 1024;

#[derive(Default)]
struct LocalBatch {
    alloc_count: u64,
    free_count: u64,
    realloc_count: u64,
    bytes_allocated: usize,
    bytes_in_use_delta: i64,
    ops: u32,
}

/// Holder whose drop flushes whatever the thread still has batched, so a
/// thread exiting mid-interval doesn't leave the globals skewed.
struct BatchCell(Cell<LocalBatch>);

impl Drop for BatchCell {
    fn drop(&mut self) {
        let mut batch = self.0.take();
        flush(&mut batch);
    }
}

thread_local! {
    static LOCAL: BatchCell = BatchCell(Cell::new(LocalBatch::default()));
    /// Usable bytes of this thread's most recent allocation, stamped by
    /// the heap so the entry points don't re-derive it.
    static LAST_ALLOC_USABLE: Cell<usize> = const { Cell::new(0) };
}

pub(crate) fn set_last_alloc_usable(usable: usize) {
    LAST_ALLOC_USABLE.with(|cell| cell.set(usable));
}

pub(crate) fn last_alloc_usable() -> usize {
    LAST_ALLOC_USABLE.with(|cell| cell.get())
}

fn with_batch(f: impl FnOnce(&mut LocalBatch)) {
    LOCAL.with(|cell| {
        let mut batch = cell.0.take();
        f(&mut batch);
        batch.ops += 1;
        if batch.ops >= FLUSH_INTERVAL {
            flush(&mut batch);
        }
        cell.0.set(batch);
    });
}

fn flush(batch: &mut LocalBatch) {
    if batch.alloc_count != 0 {
        ALLOC_COUNT.fetch_add(batch.alloc_count, Ordering::Relaxed);
    }
    if batch.free_count != 0 {
        FREE_COUNT.fetch_add(batch.free_count, Ordering::Relaxed);
    }
    if batch.realloc_count != 0 {
        REALLOC_COUNT.fetch_add(batch.realloc_count, Ordering::Relaxed);
    }
    if batch.bytes_allocated != 0 {
        BYTES_ALLOCATED.fetch_add(batch.bytes_allocated, Ordering::Relaxed);
    }
    if batch.bytes_in_use_delta != 0 {
        BYTES_IN_USE.fetch_add(batch.bytes_in_use_delta, Ordering::Relaxed);
    }
    *batch = LocalBatch::default();
}

pub(crate) fn record_alloc(requested: usize, usable: usize) {
    with_batch(|batch| {
        batch.alloc_count += 1;
        batch.bytes_allocated += requested;
        batch.bytes_in_use_delta += usable as i64;
    });
}

pub(crate) fn record_free(usable: usize) {
    with_batch(|batch| {
        batch.free_count += 1;
        batch.bytes_in_use_delta -= usable as i64;
    });
}

pub(crate) fn record_realloc() {
    with_batch(|batch| batch.realloc_count += 1);
}

pub(crate) fn record_mmap(bytes: usize) {
    MMAP_COUNT.fetch_add(1, Ordering::Relaxed);
    BYTES_MAPPED.fetch_add(bytes as i64, Ordering::Relaxed);
}

pub(crate) fn record_munmap(bytes: usize) {
    MUNMAP_COUNT.fetch_add(1, Ordering::Relaxed);
    BYTES_MAPPED.fetch_sub(bytes as i64, Ordering::Relaxed);
}

pub(crate) fn record_metadata(bytes: usize) {
    BYTES_METADATA.fetch_add(bytes, Ordering::Relaxed);
}

/// Flushes the calling thread's batch and reads the globals. Other
/// threads' unflushed batches are missed, which is the accepted
/// imprecision of batching.
pub(crate) fn snapshot() -> AllocatorStats {
    LOCAL.with(|cell| {
        let mut batch = cell.0.take();
        flush(&mut batch);
        cell.0.set(batch);
    });

    AllocatorStats {
        bytes_allocated: BYTES_ALLOCATED.load(Ordering::Relaxed),
        bytes_in_use: BYTES_IN_USE.load(Ordering::Relaxed).max(0) as usize,
        bytes_metadata: BYTES_METADATA.load(Ordering::Relaxed),
        bytes_mapped: BYTES_MAPPED.load(Ordering::Relaxed).max(0) as usize,
        alloc_count: ALLOC_COUNT.load(Ordering::Relaxed),
        free_count: FREE_COUNT.load(Ordering::Relaxed),
        realloc_count: REALLOC_COUNT.load(Ordering::Relaxed),
        mmap_count: MMAP_COUNT.load(Ordering::Relaxed),
        munmap_count: MUNMAP_COUNT.load(Ordering::Relaxed),
    }
}

/// Zeroes every counter. Teardown and re-init hook.
pub(crate) fn reset() {
    LOCAL.with(|cell| cell.0.set(LocalBatch::default()));
    ALLOC_COUNT.store(0, Ordering::Relaxed);
    FREE_COUNT.store(0, Ordering::Relaxed);
    REALLOC_COUNT.store(0, Ordering::Relaxed);
    MMAP_COUNT.store(0, Ordering::Relaxed);
    MUNMAP_COUNT.store(0, Ordering::Relaxed);
    BYTES_ALLOCATED.store(0, Ordering::Relaxed);
    BYTES_IN_USE.store(0, Ordering::Relaxed);
    BYTES_MAPPED.store(0, Ordering::Relaxed);
    BYTES_METADATA.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The counters are process globals shared with the heap tests, so
    // this single test serialises on the heap lock and asserts deltas.
    #[test]
    fn batching_and_snapshot() {
        let _guard = crate::HEAP_TEST_LOCK
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let base = snapshot();

        record_alloc(100, 128);
        record_alloc(50, 64);
        record_free(64);
        record_realloc();
        record_mmap(4096);

        // Snapshot flushes the local batch even before the interval.
        let stats = snapshot();
        assert!(stats.alloc_count >= base.alloc_count + 2);
        assert!(stats.free_count >= base.free_count + 1);
        assert!(stats.realloc_count >= base.realloc_count + 1);
        assert!(stats.bytes_allocated >= base.bytes_allocated + 150);
        assert_eq!(stats.mmap_count, base.mmap_count + 1);
        assert_eq!(stats.bytes_mapped, base.bytes_mapped + 4096);

        record_munmap(4096);
        let stats = snapshot();
        assert_eq!(stats.munmap_count, base.munmap_count + 1);
        assert_eq!(stats.bytes_mapped, base.bytes_mapped);

        set_last_alloc_usable(4242);
        assert_eq!(last_alloc_usable(), 4242);

        // In-use never reports negative even when frees outpace the
        // snapshot's view of allocations.
        reset();
        record_free(1 << 20);
        let stats = snapshot();
        assert_eq!(stats.bytes_in_use, 0);
        reset();
    }
}
