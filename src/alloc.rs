//! Allocation accounting for benchmark binaries.
//!
//! Install [`CountingAllocator`] as the `#[global_allocator]` and every run
//! reports `allocs/op` and `B/op` next to its throughput:
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: reqbench::alloc::CountingAllocator = reqbench::alloc::CountingAllocator::system();
//! ```
//!
//! Counters are process-wide, so allocations made by the runtime and by any
//! concurrently running code are attributed to the run as well.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
};

static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static ALLOCATED_BYTES: AtomicU64 = AtomicU64::new(0);
static INSTALLED: OnceLock<bool> = OnceLock::new();

pub struct CountingAllocator<A = System> {
    inner: A,
}

impl CountingAllocator<System> {
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> CountingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

#[inline]
fn record(size: usize) {
    ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    ALLOCATED_BYTES.fetch_add(size as u64, Ordering::Relaxed);
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for CountingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            record(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc_zeroed(layout);
        if !ptr.is_null() {
            record(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.dealloc(ptr, layout)
    }

    // A grown or shrunk block counts as a fresh allocation of the new size.
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            record(new_size);
        }
        new_ptr
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocTally {
    pub allocations: u64,
    pub bytes: u64,
}

impl AllocTally {
    pub fn since(self, earlier: AllocTally) -> AllocTally {
        AllocTally {
            allocations: self.allocations.saturating_sub(earlier.allocations),
            bytes: self.bytes.saturating_sub(earlier.bytes),
        }
    }
}

pub fn snapshot() -> AllocTally {
    AllocTally {
        allocations: ALLOCATIONS.load(Ordering::Relaxed),
        bytes: ALLOCATED_BYTES.load(Ordering::Relaxed),
    }
}

/// True when a [`CountingAllocator`] is the process `#[global_allocator]`.
///
/// Detected once, by checking that a plain heap allocation moves the counters.
/// Instances used directly through [`GlobalAlloc`] do not count.
pub fn is_installed() -> bool {
    *INSTALLED.get_or_init(|| {
        let before = ALLOCATIONS.load(Ordering::Relaxed);
        drop(std::hint::black_box(Box::new(0u64)));
        ALLOCATIONS.load(Ordering::Relaxed) != before
    })
}
