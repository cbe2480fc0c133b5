use std::sync::{Mutex, MutexGuard};

/// Number of stripes in the page lock table. Power of two so stripe
/// selection is a shift and a mask.
const STRIPE_COUNT: usize = 2048;

const _: () = assert!(STRIPE_COUNT.is_power_of_two());

/// Striped mutex table protecting page state. A page picks its stripe by
/// hashing its base address, which bounds contention without paying for a
/// lock per page. The segment itself holds no lock on the allocate/free
/// fast paths; only the stripe of the page being touched is taken.
pub(crate) struct PageLocks {
    stripes: [Mutex<()>; STRIPE_COUNT],
}

/// The process-wide lock table.
pub(crate) static PAGE_LOCKS: PageLocks = PageLocks::new();

impl PageLocks {
    pub const fn new() -> Self {
        const STRIPE: Mutex<()> = Mutex::new(());
        Self {
            stripes: [STRIPE; STRIPE_COUNT],
        }
    }

    #[inline]
    fn stripe_for(addr: usize) -> usize {
        // Fibonacci hash over the address with the low page bits shifted
        // out, so pages that sit next to each other land on different
        // stripes.
        ((addr >> 12).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 48) & (STRIPE_COUNT - 1)
    }

    /// Locks the stripe for the page at `addr`. Returns `None` without
    /// taking any lock when `multi_threaded` is false: with a single live
    /// thread there is nobody to race with, and the flag is reloaded on
    /// every top-level call so a second thread starting up sees locks
    /// again before it can touch shared pages.
    #[inline]
    pub fn lock(&self, addr: usize, multi_threaded: bool) -> Option<MutexGuard<'_, ()>> {
        if !multi_threaded {
            return None;
        }
        // A poisoned stripe only means another thread panicked while
        // holding it; the page state itself is still consistent because
        // panics don't happen between bitmap and counter updates.
        Some(
            self.stripes[Self::stripe_for(addr)]
                .lock()
                .unwrap_or_else(|poison| poison.into_inner()),
        )
    }
}
