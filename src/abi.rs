//! C ABI surface. The allocator is linked behind a descriptor of function
//! pointers so harnesses that compare allocators can consume it without
//! knowing anything about this crate; the layout mirrors the harness's
//! `allocator_t` field for field. Optional operations the allocator does
//! not provide are left null, and the feature flags declare what the test
//! harness may exercise.

use std::{
    ffi::{c_char, c_void},
    ptr::NonNull,
};

use crate::{allocator::Segalloc, heap::heap, stats};

/// Where guard pages sit relative to an allocation, when an allocator
/// provides them at all.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GuardLocation {
    None = 0,
    Before = 1,
    After = 2,
    Both = 3,
}

/// Declarative capabilities, used by harnesses to gate optional tests.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct AllocatorFeatures {
    pub thread_safe: bool,
    pub per_thread_cache: bool,
    pub huge_page_support: bool,
    pub guard_pages: bool,
    pub guard_location: GuardLocation,
    pub canaries: bool,
    pub quarantine: bool,
    pub zero_on_free: bool,
    pub min_alignment: usize,
    pub max_alignment: usize,
}

/// Statistics struct at the ABI boundary; same layout as
/// [`crate::AllocatorStats`], re-exported under the descriptor's name.
pub type AbiStats = crate::stats::AllocatorStats;

/// The descriptor handed to harnesses: required entry points, optional
/// entry points (null when unimplemented), diagnostics, lifecycle and
/// metadata.
#[repr(C)]
pub struct AllocatorDescriptor {
    pub malloc: Option<unsafe extern "C" fn(usize) -> *mut c_void>,
    pub free: Option<unsafe extern "C" fn(*mut c_void)>,
    pub realloc: Option<unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void>,
    pub calloc: Option<unsafe extern "C" fn(usize, usize) -> *mut c_void>,

    pub memalign: Option<unsafe extern "C" fn(usize, usize) -> *mut c_void>,
    pub aligned_alloc: Option<unsafe extern "C" fn(usize, usize) -> *mut c_void>,
    pub usable_size: Option<unsafe extern "C" fn(*mut c_void) -> usize>,
    pub free_sized: Option<unsafe extern "C" fn(*mut c_void, usize)>,
    pub realloc_array: Option<unsafe extern "C" fn(*mut c_void, usize, usize) -> *mut c_void>,
    pub bulk_free: Option<unsafe extern "C" fn(*mut *mut c_void, usize)>,

    pub print_stats: Option<unsafe extern "C" fn()>,
    pub validate_heap: Option<unsafe extern "C" fn() -> bool>,
    pub get_stats: Option<unsafe extern "C" fn(*mut AbiStats) -> bool>,

    pub init: Option<unsafe extern "C" fn() -> i32>,
    pub teardown: Option<unsafe extern "C" fn()>,

    pub name: *const c_char,
    pub author: *const c_char,
    pub version: *const c_char,
    pub description: *const c_char,
    pub memory_backend: *const c_char,

    pub features: AllocatorFeatures,
}

// The string fields are pointers into static C literals and the function
// pointers are stateless entry points; sharing the descriptor across
// threads is fine.
unsafe impl Sync for AllocatorDescriptor {}

unsafe extern "C" fn abi_malloc(size: usize) -> *mut c_void {
    Segalloc::new().malloc(size).cast()
}

unsafe extern "C" fn abi_free(ptr: *mut c_void) {
    Segalloc::new().free(ptr.cast());
}

unsafe extern "C" fn abi_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    Segalloc::new().realloc(ptr.cast(), size).cast()
}

unsafe extern "C" fn abi_calloc(nmemb: usize, size: usize) -> *mut c_void {
    Segalloc::new().calloc(nmemb, size).cast()
}

unsafe extern "C" fn abi_usable_size(ptr: *mut c_void) -> usize {
    let Some(ptr) = NonNull::new(ptr.cast::<u8>()) else {
        return 0;
    };
    heap().usable_size(ptr)
}

unsafe extern "C" fn abi_print_stats() {
    Segalloc::new().print_stats();
}

unsafe extern "C" fn abi_validate_heap() -> bool {
    Segalloc::new().validate()
}

unsafe extern "C" fn abi_get_stats(out: *mut AbiStats) -> bool {
    if out.is_null() {
        return false;
    }
    out.write(stats::snapshot());
    true
}

unsafe extern "C" fn abi_init() -> i32 {
    Segalloc::new().init()
}

unsafe extern "C" fn abi_teardown() {
    Segalloc::new().teardown();
}

static DESCRIPTOR: AllocatorDescriptor = AllocatorDescriptor {
    malloc: Some(abi_malloc),
    free: Some(abi_free),
    realloc: Some(abi_realloc),
    calloc: Some(abi_calloc),

    memalign: None,
    aligned_alloc: None,
    usable_size: Some(abi_usable_size),
    free_sized: None,
    realloc_array: None,
    bulk_free: None,

    print_stats: Some(abi_print_stats),
    validate_heap: Some(abi_validate_heap),
    get_stats: Some(abi_get_stats),

    init: Some(abi_init),
    teardown: Some(abi_teardown),

    name: c"segalloc".as_ptr(),
    author: c"segalloc developers".as_ptr(),
    version: c"0.1.0".as_ptr(),
    description: c"segmented heap with per-thread page caching".as_ptr(),
    memory_backend: c"mmap".as_ptr(),

    features: AllocatorFeatures {
        thread_safe: true,
        per_thread_cache: true,
        huge_page_support: false,
        guard_pages: false,
        guard_location: GuardLocation::None,
        canaries: false,
        quarantine: false,
        zero_on_free: false,
        min_alignment: 16,
        max_alignment: 16,
    },
};

/// Entry point the test harness resolves at link time.
#[no_mangle]
pub extern "C" fn get_test_allocator() -> *const AllocatorDescriptor {
    &DESCRIPTOR
}

/// Entry point the benchmark harness resolves at link time.
#[no_mangle]
pub extern "C" fn get_bench_allocator() -> *const AllocatorDescriptor {
    &DESCRIPTOR
}
