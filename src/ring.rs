use std::{
    cell::UnsafeCell,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Capacity of every deferred-free ring. Must be a power of two so the
/// position arithmetic reduces to masking.
pub(crate) const RING_CAPACITY: usize = 256;

const _: () = assert!(RING_CAPACITY.is_power_of_two());

/// One slot of the ring. The sequence number encodes the cell state:
/// `seq == pos` means free for the producer at `pos`, `seq == pos + 1`
/// means the data at `pos` is published, `seq == pos + capacity` means
/// recycled for the next lap.
struct Cell {
    sequence: AtomicUsize,
    data: UnsafeCell<*mut u8>,
}

/// Bounded lock-free MPMC ring of deferred-free pointers.
///
/// A thread that frees a chunk it doesn't own pushes the user pointer
/// here instead of taking the page lock; whoever next works on the page
/// under its lock drains the ring and applies the frees. Producers and
/// consumers can be different threads on every operation, so both ends
/// use CAS position claims with per-cell sequence numbers rather than a
/// single owner index.
///
/// `push` on a full ring and `pop` on an empty ring fail fast and leave
/// the fallback (taking the page lock) to the caller; nothing ever
/// blocks or spins beyond its own CAS retry.
pub(crate) struct DeferredRing {
    head: AtomicUsize,
    tail: AtomicUsize,
    cells: Box<[Cell]>,
}

// The raw pointers stored in the cells are only ever dereferenced by the
// thread that drains them while holding the page lock.
unsafe impl Sync for DeferredRing {}
unsafe impl Send for DeferredRing {}

impl DeferredRing {
    pub fn new() -> Self {
        let cells = (0..RING_CAPACITY)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                data: UnsafeCell::new(ptr::null_mut()),
            })
            .collect();

        Self {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            cells,
        }
    }

    /// Publishes `value`. Returns `false` when the ring is full.
    pub fn push(&self, value: *mut u8) -> bool {
        let mask = RING_CAPACITY - 1;
        let mut pos = self.head.load(Ordering::Relaxed);

        loop {
            let cell = &self.cells[pos & mask];
            let seq = cell.sequence.load(Ordering::Acquire);

            if seq == pos {
                // Cell is free for this lap, try to claim the position.
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { *cell.data.get() = value };
                        // The release store is what orders the write of
                        // `data` before any consumer's acquire load.
                        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(current) => pos = current,
                }
            } else if (seq as isize).wrapping_sub(pos as isize) < 0 {
                // A full lap behind: the consumer hasn't recycled this
                // cell yet, the ring is full.
                return false;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Takes the oldest published value, or `None` when the ring is
    /// empty.
    pub fn pop(&self) -> Option<*mut u8> {
        let mask = RING_CAPACITY - 1;
        let mut pos = self.tail.load(Ordering::Relaxed);

        loop {
            let cell = &self.cells[pos & mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let published = pos.wrapping_add(1);

            if seq == published {
                match self.tail.compare_exchange_weak(
                    pos,
                    published,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { *cell.data.get() };
                        // Recycle the cell for the producer one lap ahead.
                        cell.sequence
                            .store(pos.wrapping_add(RING_CAPACITY), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if (seq as isize).wrapping_sub(published as isize) < 0 {
                // Nothing published at this position yet.
                return None;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate number of published entries. Only used as a drain
    /// heuristic, so racing with concurrent pushes and pops is fine.
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }
}
