//! Real platform implementation using the global allocator.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::pal::abstractions::Memory;

/// Real implementation of the platform abstraction, backed by the Rust global allocator.
#[derive(Clone, Debug)]
pub(crate) struct RealMemory;

impl Memory for RealMemory {
    fn acquire(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0);

        // SAFETY: Slab layouts always have a non-zero size.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let memory = RealMemory;
        let layout = Layout::from_size_align(128, 16).unwrap();

        let ptr = memory.acquire(layout).expect("test allocation failed");
        assert_eq!(ptr.addr().get() % 16, 0);

        // SAFETY: We acquired the buffer above with the same layout.
        unsafe { memory.release(ptr, layout) };
    }
}
