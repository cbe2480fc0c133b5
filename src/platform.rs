use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::Pointer;

/// Abstraction for platform specific memory handling. The allocator works
/// in terms of reserving large virtual ranges up front, committing and
/// decommitting sub-ranges on demand, and obtaining standalone aligned
/// mappings, but it doesn't care about the APIs offered by the underlying
/// kernel or libraries.
///
/// All operations are page granular; callers align sizes up to
/// [`page_size`] before calling.
trait PlatformSpecificMemory {
    /// Reserves a virtual address range with no access rights and no
    /// commit charge. The range cannot be touched until committed.
    unsafe fn reserve(length: usize) -> Pointer<u8>;

    /// Makes a previously reserved sub-range read-write. Physical pages
    /// are still faulted in lazily by the kernel.
    unsafe fn commit(address: NonNull<u8>, length: usize) -> bool;

    /// Releases the physical backing of a range but keeps the virtual
    /// reservation. Subsequent reads fault in zero pages.
    unsafe fn decommit(address: NonNull<u8>, length: usize);

    /// Requests an anonymous read-write mapping whose base address is a
    /// multiple of `align`. `align` must be a power of two.
    unsafe fn map_aligned(length: usize, align: usize) -> Pointer<u8>;

    /// Returns a mapping to the kernel entirely, virtual and physical.
    unsafe fn unmap(address: NonNull<u8>, length: usize);

    /// Removes all access rights on a range. Any access segfaults. Used
    /// for guard ranges and to lock freed pages.
    unsafe fn protect_none(address: NonNull<u8>, length: usize) -> bool;

    /// Restores read-write access on a range previously protected with
    /// [`PlatformSpecificMemory::protect_none`].
    unsafe fn protect_rw(address: NonNull<u8>, length: usize) -> bool;

    /// Requests a mapping backed by huge pages (2 MiB on x86), falling
    /// back to a regular mapping when the kernel refuses.
    unsafe fn map_huge(length: usize) -> Pointer<u8>;

    /// Virtual memory page size in bytes.
    unsafe fn query_page_size() -> usize;
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
pub(crate) struct Platform;

/// Virtual memory page size. 4096 bytes on most computers. We only know
/// the value at runtime, so it's queried once and cached.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

#[inline]
pub(crate) fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let queried = unsafe { Platform::query_page_size() };
    PAGE_SIZE.store(queried, Ordering::Relaxed);
    queried
}

/// Aligns `size` up to the next multiple of the system page size.
#[inline]
pub(crate) fn page_align(size: usize) -> usize {
    crate::class::align_up(size, page_size())
}

#[inline]
pub(crate) unsafe fn reserve(length: usize) -> Pointer<u8> {
    Platform::reserve(length)
}

#[inline]
pub(crate) unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
    Platform::commit(address, length)
}

#[inline]
pub(crate) unsafe fn decommit(address: NonNull<u8>, length: usize) {
    Platform::decommit(address, length)
}

#[inline]
pub(crate) unsafe fn map_aligned(length: usize, align: usize) -> Pointer<u8> {
    debug_assert!(align.is_power_of_two());
    Platform::map_aligned(length, align)
}

#[inline]
pub(crate) unsafe fn unmap(address: NonNull<u8>, length: usize) {
    Platform::unmap(address, length)
}

#[inline]
#[allow(dead_code)]
pub(crate) unsafe fn protect_none(address: NonNull<u8>, length: usize) -> bool {
    Platform::protect_none(address, length)
}

#[inline]
#[allow(dead_code)]
pub(crate) unsafe fn protect_rw(address: NonNull<u8>, length: usize) -> bool {
    Platform::protect_rw(address, length)
}

#[inline]
pub(crate) unsafe fn map_huge(length: usize) -> Pointer<u8> {
    Platform::map_huge(length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    unsafe fn mmap_with(length: usize, protection: i32, flags: i32) -> Pointer<u8> {
        // For all the configuration options that `mmap` accepts see
        // https://man7.org/linux/man-pages/man2/mmap.2.html
        match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
            libc::MAP_FAILED => None,
            address => Some(NonNull::new_unchecked(address).cast()),
        }
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            // PROT_NONE keeps the range out of the commit charge and
            // MAP_NORESERVE keeps the kernel from accounting swap for it,
            // so reserving tens of GiB is essentially free.
            mmap_with(
                length,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            )
        }

        unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
            libc::mprotect(
                address.cast().as_ptr(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
            ) == 0
        }

        unsafe fn decommit(address: NonNull<u8>, length: usize) {
            // MADV_DONTNEED drops the physical pages immediately; the
            // range stays mapped and refaults as zeroes when touched.
            libc::madvise(address.cast().as_ptr(), length, libc::MADV_DONTNEED);
        }

        unsafe fn map_aligned(length: usize, align: usize) -> Pointer<u8> {
            let over = length + align;
            let raw = mmap_with(
                over,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            )?;

            let base = raw.as_ptr() as usize;
            let aligned = (base + align - 1) & !(align - 1);

            // Trim the leading and trailing slop so only the aligned
            // `length` bytes stay mapped.
            if aligned > base {
                libc::munmap(base as *mut libc::c_void, aligned - base);
            }
            let end = aligned + length;
            let raw_end = base + over;
            if raw_end > end {
                libc::munmap(end as *mut libc::c_void, raw_end - end);
            }

            Some(NonNull::new_unchecked(aligned as *mut u8))
        }

        unsafe fn unmap(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // The range is still mapped if this fails. Nothing
                // sensible to do about it from inside an allocator.
            }
        }

        unsafe fn protect_none(address: NonNull<u8>, length: usize) -> bool {
            libc::mprotect(address.cast().as_ptr(), length, libc::PROT_NONE) == 0
        }

        unsafe fn protect_rw(address: NonNull<u8>, length: usize) -> bool {
            libc::mprotect(
                address.cast().as_ptr(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
            ) == 0
        }

        unsafe fn map_huge(length: usize) -> Pointer<u8> {
            #[cfg(target_os = "linux")]
            {
                let huge = mmap_with(
                    length,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                );
                if huge.is_some() {
                    return huge;
                }
            }
            mmap_with(
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            )
        }

        unsafe fn query_page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri we can't rely on system calls such as `mmap`
    //! because there's no FFI support, so instead we mock the provider
    //! with the global allocator. Reserve hands out zeroed memory that is
    //! immediately usable, commit and the protection toggles are no-ops,
    //! and decommit re-zeroes the range to emulate pages refaulting as
    //! zeroes. This is also useful for detecting leaks in our own
    //! bookkeeping.

    use std::{alloc, ptr::NonNull};

    use super::{page_size, Platform, PlatformSpecificMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        // Every mapping the allocator makes is at least page aligned;
        // segment alignment is over-satisfied because the mock is never
        // asked to recover a segment base by masking an interior pointer.
        alloc::Layout::from_size_align(length, page_size()).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(to_layout(length)))
        }

        unsafe fn commit(_address: NonNull<u8>, _length: usize) -> bool {
            true
        }

        unsafe fn decommit(address: NonNull<u8>, length: usize) {
            address.as_ptr().write_bytes(0, length);
        }

        unsafe fn map_aligned(length: usize, align: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(
                alloc::Layout::from_size_align(length, align.max(page_size())).unwrap(),
            ))
        }

        unsafe fn unmap(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }

        unsafe fn protect_none(_address: NonNull<u8>, _length: usize) -> bool {
            true
        }

        unsafe fn protect_rw(_address: NonNull<u8>, _length: usize) -> bool {
            true
        }

        unsafe fn map_huge(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(to_layout(length)))
        }

        unsafe fn query_page_size() -> usize {
            4096
        }
    }
}
