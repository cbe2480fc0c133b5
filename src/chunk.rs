use std::{mem, ptr::NonNull};

use crate::{class::CHUNK_HEADER_SIZE, page::Page};

/// Aborts the process when a heap integrity condition fails. Continuing
/// after a corrupt header, a double free or a foreign pointer would
/// corrupt the bitmap or a neighbour's header, so there is no recovery
/// path.
macro_rules! integrity_check {
    ($condition:expr, $message:expr) => {
        if !($condition) {
            eprintln!(
                "segalloc: integrity failure: {} at {}:{}",
                $message,
                file!(),
                line!()
            );
            std::process::abort();
        }
    };
}

pub(crate) use integrity_check;

/// Tag stored in every chunk header. The value spells "SEGC" so it is
/// recognisable in a hex dump.
pub(crate) const CHUNK_MAGIC: u32 = 0x5345_4743;

/// Tag stored in the header of an XL mapping.
pub(crate) const XL_MAGIC: u64 = 0x5345_4743_584C_ED00;

/// Header placed directly behind every user pointer handed out by the
/// segmented heap. Chunks are not separately tracked structures; they
/// exist only as a (page, slot) coordinate plus this header, which is
/// what makes `free` O(1): the pointer alone leads back to its page.
///
/// ```text
/// +-------------+
/// | ChunkHeader |  16 bytes: owner page, slot index, magic.
/// +-------------+
/// | User bytes  |  <- returned pointer points here.
/// |     ...     |
/// +-------------+
/// ```
#[repr(C)]
pub(crate) struct ChunkHeader {
    /// Page this chunk belongs to.
    pub owner: *mut Page,
    /// Slot index within the owner page.
    pub slot: u32,
    /// [`CHUNK_MAGIC`].
    pub magic: u32,
}

const _: () = assert!(mem::size_of::<ChunkHeader>() == CHUNK_HEADER_SIZE);
const _: () = assert!(mem::align_of::<ChunkHeader>() <= CHUNK_HEADER_SIZE);

impl ChunkHeader {
    /// Returns a pointer to the header given the address we previously
    /// handed to the user.
    ///
    /// # Safety
    ///
    /// `user_ptr` must point at least [`CHUNK_HEADER_SIZE`] bytes into a
    /// mapped range. For pointers the allocator issued this always holds;
    /// the caller is expected to verify `magic` before trusting any other
    /// field.
    #[inline]
    pub unsafe fn from_user_ptr(user_ptr: NonNull<u8>) -> NonNull<ChunkHeader> {
        NonNull::new_unchecked(user_ptr.as_ptr().cast::<ChunkHeader>().offset(-1))
    }

    /// Returns the user address for a header. Only the tests need this
    /// direction; real code recomputes slot addresses from the page.
    #[cfg(test)]
    pub unsafe fn user_ptr(header: NonNull<ChunkHeader>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }

    /// Writes a fresh header at the start of a slot.
    ///
    /// # Safety
    ///
    /// `slot_addr` must be the first byte of a slot inside `owner` and
    /// the slot must span at least [`CHUNK_HEADER_SIZE`] bytes.
    #[inline]
    pub unsafe fn stamp(slot_addr: NonNull<u8>, owner: *mut Page, slot: u32) -> NonNull<u8> {
        let header = slot_addr.cast::<ChunkHeader>();
        header.as_ptr().write(ChunkHeader {
            owner,
            slot,
            magic: CHUNK_MAGIC,
        });
        NonNull::new_unchecked(slot_addr.as_ptr().add(CHUNK_HEADER_SIZE))
    }
}

/// Header stamped at the base of a dedicated XL mapping. The user pointer
/// is `base + size_of::<XlHeader>()`; the mapping size is what `munmap`
/// needs and the usable size is what `usable_size` reports. There is no
/// other bookkeeping for XL chunks.
#[repr(C)]
pub(crate) struct XlHeader {
    /// [`XL_MAGIC`].
    pub magic: u64,
    /// Total length of the OS mapping, page aligned.
    pub mapping_size: usize,
    /// Bytes usable by the caller.
    pub usable: usize,
    _pad: usize,
}

pub(crate) const XL_HEADER_SIZE: usize = mem::size_of::<XlHeader>();

const _: () = assert!(XL_HEADER_SIZE == 32);
const _: () = assert!(XL_HEADER_SIZE % crate::class::MIN_ALIGNMENT == 0);

impl XlHeader {
    /// Stamps the header at `base` and returns the user pointer.
    ///
    /// # Safety
    ///
    /// `base` must point to a fresh read-write mapping of at least
    /// `mapping_size` bytes.
    pub unsafe fn stamp(base: NonNull<u8>, mapping_size: usize, usable: usize) -> NonNull<u8> {
        base.cast::<XlHeader>().as_ptr().write(XlHeader {
            magic: XL_MAGIC,
            mapping_size,
            usable,
            _pad: 0,
        });
        NonNull::new_unchecked(base.as_ptr().add(XL_HEADER_SIZE))
    }

    /// Returns the header behind an XL user pointer.
    ///
    /// # Safety
    ///
    /// Same contract as [`ChunkHeader::from_user_ptr`]: the bytes must be
    /// readable; `magic` decides whether the rest can be trusted.
    #[inline]
    pub unsafe fn from_user_ptr(user_ptr: NonNull<u8>) -> NonNull<XlHeader> {
        NonNull::new_unchecked(user_ptr.as_ptr().sub(XL_HEADER_SIZE).cast())
    }

    /// Base of the OS mapping this header sits in.
    #[inline]
    pub fn mapping_base(header: NonNull<XlHeader>) -> NonNull<u8> {
        header.cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut slot = [0u8; 64];
        unsafe {
            let slot_addr = NonNull::new(slot.as_mut_ptr()).unwrap();
            let owner = 0x1000 as *mut Page;
            let user = ChunkHeader::stamp(slot_addr, owner, 7);
            assert_eq!(user.as_ptr() as usize - slot_addr.as_ptr() as usize, 16);

            let header = ChunkHeader::from_user_ptr(user);
            assert_eq!(header.cast::<u8>(), slot_addr);
            assert_eq!(header.as_ref().magic, CHUNK_MAGIC);
            assert_eq!(header.as_ref().slot, 7);
            assert_eq!(header.as_ref().owner, owner);
            assert_eq!(ChunkHeader::user_ptr(header), user);
        }
    }

    #[test]
    fn xl_header_roundtrip() {
        let mut mapping = [0u8; 128];
        unsafe {
            let base = NonNull::new(mapping.as_mut_ptr()).unwrap();
            let user = XlHeader::stamp(base, 128, 96);
            assert_eq!(user.as_ptr() as usize - base.as_ptr() as usize, XL_HEADER_SIZE);

            let header = XlHeader::from_user_ptr(user);
            assert_eq!(header.as_ref().magic, XL_MAGIC);
            assert_eq!(header.as_ref().mapping_size, 128);
            assert_eq!(header.as_ref().usable, 96);
            assert_eq!(XlHeader::mapping_base(header), base);
        }
    }

    #[test]
    fn magics_do_not_collide() {
        // The low 32 bits of the XL magic must not look like a chunk
        // magic when the free path probes `user_ptr - 16` first.
        assert_ne!((XL_MAGIC >> 32) as u32, CHUNK_MAGIC);
        assert_ne!(XL_MAGIC as u32, CHUNK_MAGIC);
    }
}
