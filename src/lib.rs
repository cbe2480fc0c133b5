//! Segmented heap allocator. Memory is organised in three levels: the
//! heap owns a large reserved virtual region carved into segment-aligned
//! segments, each segment is split into same-class pages, and each page
//! is a slab of equal-stride chunks tracked by a bitmap. Every user
//! pointer carries a 16 byte header right behind it, so `free` dispatches
//! in O(1) without searching any segment list. Frees from a thread that
//! doesn't own the page go through a lock-free ring on the page and are
//! applied later by whoever holds the page lock next.
//!
//! The public surface is the classical C heap interface, exposed both as
//! methods on [`Segalloc`] and as a `repr(C)` descriptor of function
//! pointers (see [`AllocatorDescriptor`]) for harnesses that consume
//! allocators behind a vtable.

use std::ptr::NonNull;

mod abi;
mod allocator;
mod chunk;
mod class;
mod heap;
mod page;
mod platform;
mod ring;
mod segment;
mod stats;
mod stripe;
mod tcache;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the
/// `None` case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use abi::{
    get_bench_allocator, get_test_allocator, AllocatorDescriptor, AllocatorFeatures,
    GuardLocation,
};
pub use allocator::Segalloc;
pub use stats::AllocatorStats;

/// The heap is a process singleton, so every test that touches it has to
/// run serialised no matter which module it lives in.
#[cfg(test)]
pub(crate) static HEAP_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
