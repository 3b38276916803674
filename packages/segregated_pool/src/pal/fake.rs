//! Fake platform implementation for testing.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::pal::abstractions::Memory;

/// Internal state for the fake allocator that can be shared between clones.
#[derive(Debug, Default)]
struct FakeMemoryState {
    /// Every layout passed to `acquire()`, including refused ones, in call order.
    requests: Vec<Layout>,

    /// Every layout passed to `release()`, in call order.
    releases: Vec<Layout>,

    /// Buffers acquired and not yet released.
    outstanding: usize,

    /// Refuse every request.
    refuse_all: bool,

    /// Refuse requests larger than this many bytes.
    refuse_above: Option<usize>,
}

/// Fake implementation of the platform abstraction for testing.
///
/// Buffers are served by the real global allocator, so pools built on the fake are fully
/// functional. In addition, the fake records every request and can be configured to refuse
/// requests, simulating an exhausted system allocator. Clones share the same state, so a
/// test can keep a clone to inspect and steer the instance owned by a pool.
#[derive(Clone, Debug, Default)]
pub(crate) struct FakeMemory {
    state: Arc<Mutex<FakeMemoryState>>,
}

impl FakeMemory {
    /// Creates a new fake allocator that grants every request.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes the allocator refuse (or again grant) every request.
    pub(crate) fn set_refuse_all(&self, refuse_all: bool) {
        self.lock().refuse_all = refuse_all;
    }

    /// Makes the allocator refuse requests above the given number of bytes.
    pub(crate) fn set_refuse_above(&self, limit: Option<usize>) {
        self.lock().refuse_above = limit;
    }

    /// Layouts of every acquisition attempt so far, including refused ones.
    pub(crate) fn requests(&self) -> Vec<Layout> {
        self.lock().requests.clone()
    }

    /// Layouts of every release so far.
    pub(crate) fn releases(&self) -> Vec<Layout> {
        self.lock().releases.clone()
    }

    /// Number of buffers acquired and not yet released.
    pub(crate) fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    fn lock(&self) -> MutexGuard<'_, FakeMemoryState> {
        self.state
            .lock()
            .expect("FakeMemory state lock should not be poisoned")
    }
}

impl Memory for FakeMemory {
    fn acquire(&self, layout: Layout) -> Option<NonNull<u8>> {
        let mut state = self.lock();
        state.requests.push(layout);

        let refused =
            state.refuse_all || state.refuse_above.is_some_and(|limit| layout.size() > limit);

        if refused {
            return None;
        }

        // SAFETY: Slab layouts always have a non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc(layout) })?;

        state.outstanding = state.outstanding.wrapping_add(1);
        Some(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        let mut state = self.lock();

        state.releases.push(layout);
        state.outstanding = state
            .outstanding
            .checked_sub(1)
            .expect("released more buffers than were acquired");

        // SAFETY: Forwarding guarantees from the caller.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, 8).unwrap()
    }

    #[test]
    fn grants_by_default() {
        let memory = FakeMemory::new();

        let ptr = memory.acquire(layout(32)).expect("fake grants by default");
        assert_eq!(memory.outstanding(), 1);

        // SAFETY: Acquired above with the same layout.
        unsafe { memory.release(ptr, layout(32)) };
        assert_eq!(memory.outstanding(), 0);
        assert_eq!(memory.releases(), vec![layout(32)]);
    }

    #[test]
    fn refuse_all_records_request() {
        let memory = FakeMemory::new();
        memory.set_refuse_all(true);

        assert!(memory.acquire(layout(32)).is_none());
        assert_eq!(memory.requests(), vec![layout(32)]);
        assert_eq!(memory.outstanding(), 0);
    }

    #[test]
    fn refuse_above_limit() {
        let memory = FakeMemory::new();
        memory.set_refuse_above(Some(64));

        assert!(memory.acquire(layout(128)).is_none());

        let ptr = memory.acquire(layout(64)).expect("request at the limit is granted");
        // SAFETY: Acquired above with the same layout.
        unsafe { memory.release(ptr, layout(64)) };
    }

    #[test]
    fn shared_state_between_clones() {
        let memory1 = FakeMemory::new();
        let memory2 = memory1.clone();

        memory1.set_refuse_all(true);
        assert!(memory2.acquire(layout(16)).is_none());
        assert_eq!(memory1.requests().len(), 1);
    }
}
