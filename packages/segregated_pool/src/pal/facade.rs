//! Platform facade for switching between real and fake implementations.

use std::alloc::Layout;
use std::ptr::NonNull;

use crate::pal::abstractions::Memory;
#[cfg(test)]
use crate::pal::fake::FakeMemory;
use crate::pal::real::RealMemory;

/// Facade that allows switching between real and fake allocator implementations.
#[derive(Clone, Debug)]
pub(crate) enum MemoryFacade {
    /// Real implementation backed by the global allocator.
    Real(RealMemory),

    /// Fake implementation for testing.
    #[cfg(test)]
    Fake(FakeMemory),
}

impl MemoryFacade {
    /// Creates a new memory facade using the real implementation.
    pub(crate) fn real() -> Self {
        Self::Real(RealMemory)
    }

    /// Creates a new memory facade using the fake implementation.
    #[cfg(test)]
    pub(crate) fn fake(fake_memory: FakeMemory) -> Self {
        Self::Fake(fake_memory)
    }
}

impl Memory for MemoryFacade {
    fn acquire(&self, layout: Layout) -> Option<NonNull<u8>> {
        match self {
            Self::Real(memory) => memory.acquire(layout),
            #[cfg(test)]
            Self::Fake(memory) => memory.acquire(layout),
        }
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        match self {
            // SAFETY: Forwarding guarantees from the caller.
            Self::Real(memory) => unsafe { memory.release(ptr, layout) },
            // SAFETY: Forwarding guarantees from the caller.
            #[cfg(test)]
            Self::Fake(memory) => unsafe { memory.release(ptr, layout) },
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn memory_facade_real() {
        let facade = MemoryFacade::real();
        assert!(matches!(facade, MemoryFacade::Real(_)));
    }

    #[test]
    fn memory_facade_fake_forwards_requests() {
        let fake = FakeMemory::new();
        let facade = MemoryFacade::fake(fake.clone());
        let layout = Layout::from_size_align(64, 8).unwrap();

        let ptr = facade.acquire(layout).expect("fake forwards to the real allocator");
        assert_eq!(fake.requests(), vec![layout]);
        assert_eq!(fake.outstanding(), 1);

        // SAFETY: We acquired the buffer above with the same layout.
        unsafe { facade.release(ptr, layout) };
        assert_eq!(fake.outstanding(), 0);
    }
}
