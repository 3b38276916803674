use std::iter;
use std::ptr::NonNull;

use crate::trailer_size;

/// A view over one slab: a raw allocation holding a run of chunks followed by a trailer.
///
/// The trailer occupies the last [`trailer_size()`] bytes of the slab and links the slab to
/// the next slab in the pool's slab list, so the list needs no memory of its own:
///
/// ```text
/// | chunk 0 | chunk 1 | ... | chunk N-1 | next slab ptr (padded) | next slab size |
/// ^ begin()                             ^ end()                                   ^ begin() + total_size()
/// ```
///
/// The view does not own the memory. The pool that acquired the slab owns it and is the only
/// party that may release it. An absent slab (the end of the list) is `None`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct SlabView {
    ptr: NonNull<u8>,
    total_size: usize,
}

impl SlabView {
    /// Creates a view over a slab.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `ptr` is valid for reads and writes of `total_size` bytes for as long as the view or
    ///   any copy of it is used.
    /// - `total_size` is greater than [`trailer_size()`].
    /// - `ptr` is aligned for both pointers and `usize`, and `total_size - trailer_size()` is a
    ///   multiple of that alignment, so the trailer fields are aligned.
    #[must_use]
    pub(crate) unsafe fn new(ptr: NonNull<u8>, total_size: usize) -> Self {
        debug_assert!(total_size > trailer_size());

        Self { ptr, total_size }
    }

    /// Start of the slab, which is also the first chunk.
    #[must_use]
    pub(crate) fn begin(&self) -> NonNull<u8> {
        self.ptr
    }

    /// First byte past the last usable chunk, which is where the trailer starts.
    #[must_use]
    pub(crate) fn end(&self) -> NonNull<u8> {
        // SAFETY: usable_size() < total_size, so the result stays within the slab.
        unsafe { self.ptr.byte_add(self.usable_size()) }
    }

    /// Total byte size of the slab, as originally requested from the system allocator.
    #[must_use]
    pub(crate) fn total_size(&self) -> usize {
        self.total_size
    }

    /// Number of bytes available for chunks.
    #[must_use]
    pub(crate) fn usable_size(&self) -> usize {
        // Cannot wrap around, guaranteed by the constructor's safety requirements.
        self.total_size.wrapping_sub(trailer_size())
    }

    /// Whether the address falls within the usable (chunk) region of this slab.
    #[must_use]
    pub(crate) fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.begin() <= ptr && ptr < self.end()
    }

    /// Iterates over the addresses of all chunks of the given size in this slab.
    pub(crate) fn chunks(&self, chunk_size: usize) -> impl Iterator<Item = NonNull<u8>> {
        let ptr = self.ptr;
        let chunk_count = self
            .usable_size()
            .checked_div(chunk_size)
            .expect("chunk size is never zero");

        (0..chunk_count).map(move |index| {
            // SAFETY: index < chunk_count, so the offset is within the usable region.
            unsafe { ptr.byte_add(index.wrapping_mul(chunk_size)) }
        })
    }

    /// Reads the next slab in the list from this slab's trailer.
    #[must_use]
    pub(crate) fn next(&self) -> Option<Self> {
        // SAFETY: The trailer is within the slab, aligned (constructor requirements) and was
        // initialized by set_next() when the slab was linked into the list.
        let (next_ptr, next_size) =
            unsafe { (self.next_ptr_slot().read(), self.next_size_slot().read()) };

        next_ptr.map(|ptr| Self {
            ptr,
            total_size: next_size,
        })
    }

    /// Writes the link to the next slab into this slab's trailer.
    pub(crate) fn set_next(&self, next: Option<Self>) {
        let (next_ptr, next_size) = next.map_or((None, 0), |slab| (Some(slab.ptr), slab.total_size));

        // SAFETY: The trailer is within the slab and aligned (constructor requirements).
        unsafe {
            self.next_ptr_slot().write(next_ptr);
        }

        // SAFETY: As above.
        unsafe {
            self.next_size_slot().write(next_size);
        }
    }

    /// Iterates over a slab list, starting from `head` and following the trailer links.
    pub(crate) fn iter_from(head: Option<Self>) -> impl Iterator<Item = Self> {
        iter::successors(head, Self::next)
    }

    fn next_ptr_slot(&self) -> NonNull<Option<NonNull<u8>>> {
        self.end().cast()
    }

    fn next_size_slot(&self) -> NonNull<usize> {
        // SAFETY: The size slot is the last usize of the slab, which is within bounds because
        // the trailer is at least that large.
        unsafe {
            self.ptr
                .byte_add(self.total_size.wrapping_sub(size_of::<usize>()))
                .cast()
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::arithmetic_side_effects,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::alloc::{Layout, alloc, dealloc};

    use super::*;

    const CHUNK_SIZE: usize = 16;
    const CHUNK_COUNT: usize = 4;

    struct TestSlab {
        view: SlabView,
        layout: Layout,
    }

    impl TestSlab {
        fn new() -> Self {
            let size = CHUNK_SIZE * CHUNK_COUNT + trailer_size();
            let layout = Layout::from_size_align(size, align_of::<usize>()).unwrap();
            let ptr = NonNull::new(unsafe { alloc(layout) }).expect("test allocation failed");
            let view = unsafe { SlabView::new(ptr, size) };
            view.set_next(None);
            Self { view, layout }
        }
    }

    impl Drop for TestSlab {
        fn drop(&mut self) {
            unsafe { dealloc(self.view.begin().as_ptr(), self.layout) };
        }
    }

    #[test]
    fn geometry_matches_trailer_layout() {
        let slab = TestSlab::new();
        let view = slab.view;

        assert_eq!(view.total_size(), CHUNK_SIZE * CHUNK_COUNT + trailer_size());
        assert_eq!(view.usable_size(), CHUNK_SIZE * CHUNK_COUNT);
        assert_eq!(
            view.end().addr().get() - view.begin().addr().get(),
            view.usable_size()
        );
    }

    #[test]
    fn fresh_slab_has_no_next() {
        let slab = TestSlab::new();

        assert!(slab.view.next().is_none());
    }

    #[test]
    fn set_next_round_trips_pointer_and_size() {
        let first = TestSlab::new();
        let second = TestSlab::new();

        first.view.set_next(Some(second.view));

        assert_eq!(first.view.next(), Some(second.view));
        assert_eq!(first.view.next().unwrap().total_size(), second.view.total_size());

        first.view.set_next(None);
        assert!(first.view.next().is_none());
    }

    #[test]
    fn trailer_does_not_overlap_chunks() {
        let slab = TestSlab::new();
        let other = TestSlab::new();

        for chunk in slab.view.chunks(CHUNK_SIZE) {
            unsafe { chunk.as_ptr().write_bytes(0xFF, CHUNK_SIZE) };
        }

        slab.view.set_next(Some(other.view));
        for chunk in slab.view.chunks(CHUNK_SIZE) {
            unsafe { chunk.as_ptr().write_bytes(0x00, CHUNK_SIZE) };
        }

        assert_eq!(slab.view.next(), Some(other.view));
    }

    #[test]
    fn chunks_cover_usable_region() {
        let slab = TestSlab::new();
        let chunks: Vec<_> = slab.view.chunks(CHUNK_SIZE).collect();

        assert_eq!(chunks.len(), CHUNK_COUNT);
        assert_eq!(chunks.first(), Some(&slab.view.begin()));
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].addr().get() - pair[0].addr().get(), CHUNK_SIZE);
        }
    }

    #[test]
    fn contains_only_usable_region() {
        let slab = TestSlab::new();
        let view = slab.view;

        assert!(view.contains(view.begin()));
        assert!(view.contains(unsafe { view.end().byte_sub(1) }));
        assert!(!view.contains(view.end()));
        assert!(!view.contains(unsafe { view.begin().byte_add(view.total_size() - 1) }));
    }

    #[test]
    fn iter_from_follows_links() {
        let a = TestSlab::new();
        let b = TestSlab::new();
        let c = TestSlab::new();

        a.view.set_next(Some(b.view));
        b.view.set_next(Some(c.view));

        let slabs: Vec<_> = SlabView::iter_from(Some(a.view)).collect();
        assert_eq!(slabs, vec![a.view, b.view, c.view]);

        assert_eq!(SlabView::iter_from(None).count(), 0);
    }
}
