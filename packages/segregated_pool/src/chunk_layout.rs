use std::alloc::Layout;
use std::num::NonZero;

use num_integer::Integer;

/// The largest size the standard library allows a single [`Layout`] to describe.
///
/// This is the effective range of the size type for slab arithmetic: a slab whose size would
/// exceed it cannot be requested from the system allocator at all.
const MAX_SLAB_SIZE: usize = isize::MAX.unsigned_abs();

/// Size of the region that a free chunk uses to link to the next free chunk.
const LINK_SIZE: usize = size_of::<*mut u8>();

/// Bytes at the tail of every slab that hold the slab directory link.
///
/// The trailer stores a pointer to the next slab (padded to a common multiple of the pointer
/// and size widths) followed by the total byte size of that next slab.
#[must_use]
pub(crate) fn trailer_size() -> usize {
    // Cannot overflow, both operands are tiny.
    size_of::<usize>().wrapping_add(Integer::lcm(&size_of::<usize>(), &LINK_SIZE))
}

/// Smallest chunk we ever hand out. Every chunk must be able to hold a free-list link, and we
/// additionally keep it a common multiple of the pointer and size widths.
#[must_use]
pub(crate) fn min_chunk_size() -> usize {
    Integer::lcm(&LINK_SIZE, &size_of::<usize>())
}

/// Precalculated chunk geometry for one item layout.
///
/// A chunk is a dual-use region: while free it stores a link to the next free chunk, while
/// allocated it stores the item. The chunk size therefore satisfies both roles and every chunk
/// boundary in a slab is suitably aligned for both roles.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ChunkLayout {
    /// Layout of the items the pool was configured for.
    item_layout: Layout,

    /// Stride between consecutive chunks in a slab.
    chunk_size: NonZero<usize>,

    /// Alignment of every chunk and of every slab allocation.
    chunk_align: usize,

    /// Greatest number of chunks a single slab can hold.
    max_chunks: NonZero<usize>,
}

impl ChunkLayout {
    /// Calculates the chunk geometry for items of the given layout.
    ///
    /// # Panics
    ///
    /// Panics if the item layout has zero size.
    ///
    /// Panics if the item layout is so large that no slab could hold even a single chunk.
    #[must_use]
    pub(crate) fn new(item_layout: Layout) -> Self {
        assert!(
            item_layout.size() > 0,
            "ChunkLayout cannot be calculated for zero-sized item layout"
        );

        let link_align = Integer::lcm(&align_of::<*mut u8>(), &align_of::<usize>());
        let chunk_align = Integer::lcm(&link_align, &item_layout.align());

        let chunk_size = item_layout
            .size()
            .max(min_chunk_size())
            .checked_next_multiple_of(chunk_align)
            .and_then(NonZero::new)
            .expect("chunk size rounding cannot overflow for item layouts of reasonable size");

        let max_chunks = NonZero::new(max_chunks(chunk_size, chunk_align)).unwrap_or_else(|| {
            panic!("item layout {item_layout:?} is too large to fit a single chunk into a slab")
        });

        Self {
            item_layout,
            chunk_size,
            chunk_align,
            max_chunks,
        }
    }

    #[must_use]
    pub(crate) fn item_layout(&self) -> Layout {
        self.item_layout
    }

    /// Number of bytes the pool was asked to serve per chunk.
    #[must_use]
    pub(crate) fn requested_size(&self) -> usize {
        self.item_layout.size()
    }

    #[must_use]
    pub(crate) fn chunk_size(&self) -> NonZero<usize> {
        self.chunk_size
    }

    #[cfg_attr(not(test), expect(dead_code, reason = "only inspected by tests"))]
    #[must_use]
    pub(crate) fn chunk_align(&self) -> usize {
        self.chunk_align
    }

    /// The greatest number of chunks a single slab can hold without the slab size (chunks plus
    /// trailer) exceeding what can be described as a memory layout.
    #[must_use]
    pub(crate) fn max_chunks(&self) -> NonZero<usize> {
        self.max_chunks
    }

    /// Memory layout of a slab holding `chunk_count` chunks followed by the trailer.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_count` is greater than [`max_chunks()`](Self::max_chunks).
    #[must_use]
    pub(crate) fn slab_layout(&self, chunk_count: NonZero<usize>) -> Layout {
        assert!(
            chunk_count <= self.max_chunks,
            "slab of {chunk_count} chunks exceeds the maximum of {} chunks",
            self.max_chunks
        );

        let total_size = chunk_count
            .get()
            .checked_mul(self.chunk_size.get())
            .and_then(|chunk_area| chunk_area.checked_add(trailer_size()))
            .expect("guarded by the max_chunks() check above");

        self.slab_layout_of_size(total_size)
    }

    /// Memory layout of an existing slab, reconstructed from the total size recorded for it.
    ///
    /// # Panics
    ///
    /// Panics if the size does not describe a valid layout with the chunk alignment. This
    /// cannot happen for sizes that came from [`slab_layout()`](Self::slab_layout).
    #[must_use]
    pub(crate) fn slab_layout_of_size(&self, total_size: usize) -> Layout {
        Layout::from_size_align(total_size, self.chunk_align)
            .expect("slab sizes are bounded by max_chunks() and alignment is a power of two")
    }
}

/// Number of chunks that fit into the largest describable slab, next to the trailer.
fn max_chunks(chunk_size: NonZero<usize>, chunk_align: usize) -> usize {
    // Layout also requires the size rounded up to the alignment to stay in range.
    let chunk_area = MAX_SLAB_SIZE
        .checked_sub(trailer_size())
        .and_then(|area| area.checked_sub(chunk_align.wrapping_sub(1)))
        .expect("trailer and alignment are tiny compared to the address space");

    Integer::div_floor(&chunk_area, &chunk_size.get())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::integer_division,
    clippy::modulo_arithmetic,
    clippy::arithmetic_side_effects,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use new_zealand::nz;

    use super::*;

    #[repr(align(64))]
    struct CacheLineAligned {
        _value: u8,
    }

    fn assert_chunk_invariants(item_layout: Layout) {
        let layout = ChunkLayout::new(item_layout);
        let chunk_size = layout.chunk_size().get();

        assert_eq!(chunk_size % layout.chunk_align(), 0);
        assert!(chunk_size >= min_chunk_size());
        assert!(chunk_size >= item_layout.size());
        assert_eq!(layout.chunk_align() % item_layout.align(), 0);
        assert_eq!(layout.chunk_align() % align_of::<*mut u8>(), 0);
    }

    #[test]
    fn chunk_invariants_hold_for_assorted_layouts() {
        assert_chunk_invariants(Layout::new::<u8>());
        assert_chunk_invariants(Layout::new::<u16>());
        assert_chunk_invariants(Layout::new::<u64>());
        assert_chunk_invariants(Layout::new::<u128>());
        assert_chunk_invariants(Layout::new::<[u8; 33]>());
        assert_chunk_invariants(Layout::new::<String>());
        assert_chunk_invariants(Layout::new::<CacheLineAligned>());
        assert_chunk_invariants(Layout::from_size_align(100, 4).unwrap());
    }

    #[test]
    fn small_items_get_a_pointer_sized_chunk() {
        let layout = ChunkLayout::new(Layout::new::<u8>());

        assert_eq!(layout.chunk_size().get(), min_chunk_size());
        assert_eq!(layout.requested_size(), 1);
    }

    #[test]
    fn odd_sizes_round_up_to_chunk_alignment() {
        let layout = ChunkLayout::new(Layout::new::<[u8; 33]>());

        assert_eq!(layout.chunk_size().get(), 33_usize.next_multiple_of(layout.chunk_align()));
    }

    #[test]
    fn over_aligned_items_get_aligned_chunks() {
        let layout = ChunkLayout::new(Layout::new::<CacheLineAligned>());

        assert_eq!(layout.chunk_align(), 64);
        assert_eq!(layout.chunk_size().get(), 64);
    }

    #[test]
    #[should_panic]
    fn zero_sized_item_panics() {
        drop(ChunkLayout::new(Layout::new::<()>()));
    }

    #[test]
    fn slab_layout_adds_trailer() {
        let layout = ChunkLayout::new(Layout::new::<u64>());
        let slab = layout.slab_layout(nz!(10));

        assert_eq!(slab.size(), 10 * layout.chunk_size().get() + trailer_size());
        assert_eq!(slab.align(), layout.chunk_align());
    }

    #[test]
    fn slab_layout_round_trips_through_size() {
        let layout = ChunkLayout::new(Layout::new::<[u32; 3]>());
        let slab = layout.slab_layout(nz!(7));

        assert_eq!(layout.slab_layout_of_size(slab.size()), slab);
    }

    #[test]
    fn max_chunks_slab_does_not_overflow() {
        let layout = ChunkLayout::new(Layout::new::<u64>());
        let slab = layout.slab_layout(layout.max_chunks());
        assert!(slab.size() <= MAX_SLAB_SIZE);
    }

    #[test]
    #[should_panic]
    fn slab_layout_beyond_max_chunks_panics() {
        let layout = ChunkLayout::new(Layout::new::<u64>());
        let too_many = layout.max_chunks().checked_add(1).unwrap();

        drop(layout.slab_layout(too_many));
    }

    #[test]
    fn trailer_holds_link_and_size() {
        assert!(trailer_size() >= size_of::<*mut u8>() + size_of::<usize>());
        assert_eq!(trailer_size() % align_of::<usize>(), 0);
    }
}
