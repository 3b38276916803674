//! Platform abstraction trait definitions.

use std::alloc::Layout;
use std::fmt::Debug;
use std::ptr::NonNull;

/// Acquires and releases raw memory buffers on behalf of a pool.
///
/// A pool only ever releases a buffer with exactly the layout it was acquired with. Buffers are
/// never partially released.
pub(crate) trait Memory: Debug + Send + Sync + 'static {
    /// Acquires a buffer with the given layout, or `None` if the allocator cannot provide one.
    ///
    /// The layout always has a non-zero size.
    fn acquire(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns a buffer to the allocator.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` was returned by [`acquire()`](Self::acquire) on the
    /// same instance with the same `layout`, and that it has not already been released.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}
