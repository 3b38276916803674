use std::alloc::Layout;
use std::num::NonZero;
use std::ptr::NonNull;

use foldhash::HashSet;
use new_zealand::nz;
use num_integer::Integer;
use tracing::{debug, trace};

use crate::pal::{Memory, MemoryFacade};
use crate::{ChunkLayout, Error, FreeList, RawSegregatedPoolBuilder, Result, SlabView};

/// Number of chunks in the first slab of a pool, unless the builder says otherwise.
pub const DEFAULT_CHUNK_COUNT: NonZero<usize> = nz!(32);

/// If the system allocator refuses a slab of more than this many chunks, we try once more with
/// a slab of half the size before giving up.
const RETRY_THRESHOLD: usize = 4;

/// A growable pool of fixed-size memory chunks, with the item layout chosen at runtime.
///
/// The pool obtains memory from the system allocator in slabs. Each slab is split into equally
/// sized chunks that are handed out one at a time by [`allocate()`](Self::allocate) and taken
/// back by [`deallocate()`](Self::deallocate). The pool keeps no bookkeeping structures of its
/// own: free chunks are linked through their own bytes and slabs are linked through a small
/// trailer at the end of each slab.
///
/// Whenever the pool runs out of free chunks it acquires a new slab, with each new slab holding
/// twice as many chunks as the previous one. The growth can be capped via
/// [`max_chunk_count()`](RawSegregatedPoolBuilder::max_chunk_count).
///
/// Memory is only returned to the system allocator when requested via
/// [`purge_memory()`](Self::purge_memory) or [`shrink_memory()`](Self::shrink_memory), or when
/// the pool is dropped.
///
/// The pool never touches the contents of allocated chunks and does not track them. Chunks
/// still allocated when the pool is purged or dropped become dangling, without any item
/// destructors being run. Use [`SegregatedPool`](crate::SegregatedPool) if you want the pool to
/// create and destroy typed values for you.
///
/// # Example
///
/// ```rust
/// use segregated_pool::RawSegregatedPool;
///
/// let mut pool = RawSegregatedPool::builder().layout_of::<u64>().build();
///
/// let chunk = pool.allocate()?;
///
/// // SAFETY: The chunk is sized and aligned for a u64 and nobody else is using it.
/// unsafe { chunk.cast::<u64>().write(42) };
///
/// // SAFETY: The chunk came from this pool and is not used after this point.
/// unsafe { pool.deallocate(chunk) };
///
/// assert!(pool.purge_memory());
/// # Ok::<(), segregated_pool::Error>(())
/// ```
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
pub struct RawSegregatedPool {
    /// Where we get slabs from and where we return them to.
    memory: MemoryFacade,

    layout: ChunkLayout,

    /// Most recently acquired slab, which is the head of the slab list. Older slabs are reached
    /// through the trailer of each slab.
    slabs: Option<SlabView>,

    free_list: FreeList,

    /// How many chunks the next slab will hold.
    chunk_count: NonZero<usize>,

    /// The configured chunk count of the first slab, restored whenever the pool releases memory.
    start_chunk_count: NonZero<usize>,

    /// Growth cap, in items of the requested size. `None` means growth is only limited by
    /// [`max_chunks()`](Self::max_chunks).
    max_chunk_count: Option<NonZero<usize>>,
}

impl RawSegregatedPool {
    /// Starts building a new pool.
    ///
    /// The item layout must be set via [`layout()`](RawSegregatedPoolBuilder::layout) or
    /// [`layout_of()`](RawSegregatedPoolBuilder::layout_of) before the pool can be built.
    #[cfg_attr(test, mutants::skip)] // Gets mutated to alternate version of itself.
    pub fn builder() -> RawSegregatedPoolBuilder {
        RawSegregatedPoolBuilder::new()
    }

    /// # Panics
    ///
    /// Panics if the item layout has zero size.
    #[must_use]
    pub(crate) fn new_inner(
        item_layout: Layout,
        chunk_count: NonZero<usize>,
        max_chunk_count: Option<NonZero<usize>>,
        memory: MemoryFacade,
    ) -> Self {
        let layout = ChunkLayout::new(item_layout);

        let mut pool = Self {
            memory,
            layout,
            slabs: None,
            free_list: FreeList::new(),
            chunk_count,
            start_chunk_count: chunk_count,
            // The cap counts items of the requested size while max_chunks() counts chunks.
            // Bounding one by the other is intended, the cap is converted to chunks on use.
            max_chunk_count: max_chunk_count.map(|max| max.min(layout.max_chunks())),
        };

        let start_chunk_count = pool.clamp_chunk_count(chunk_count);
        pool.chunk_count = start_chunk_count;
        pool.start_chunk_count = start_chunk_count;

        pool
    }

    /// The layout of the items the pool was configured for.
    #[must_use]
    pub fn item_layout(&self) -> Layout {
        self.layout.item_layout()
    }

    /// The size of each chunk. This may be larger than the item size because every chunk must
    /// also be able to hold a free-list link and must be aligned for it.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.layout.chunk_size().get()
    }

    /// The number of chunks the next slab will hold.
    #[must_use]
    pub fn chunk_count(&self) -> NonZero<usize> {
        self.chunk_count
    }

    /// The growth cap, in items of the configured item size, if one is set.
    #[must_use]
    pub fn max_chunk_count(&self) -> Option<NonZero<usize>> {
        self.max_chunk_count
    }

    /// The greatest number of chunks a single slab can hold.
    #[must_use]
    pub fn max_chunks(&self) -> NonZero<usize> {
        self.layout.max_chunks()
    }

    /// The number of slabs currently owned by the pool.
    #[must_use]
    pub fn slab_count(&self) -> usize {
        self.slabs().count()
    }

    /// The total number of chunks in all slabs owned by the pool, allocated or free.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let chunk_size = self.chunk_size();

        self.slabs()
            .map(|slab| Integer::div_floor(&slab.usable_size(), &chunk_size))
            .sum()
    }

    /// The number of chunks that can be allocated without acquiring a new slab.
    ///
    /// This walks the entire free list, so it is not cheap.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Whether the pointer points into a chunk of a slab owned by this pool.
    ///
    /// This says nothing about whether the chunk is currently allocated.
    #[must_use]
    pub fn is_from(&self, ptr: NonNull<u8>) -> bool {
        self.slabs().any(|slab| slab.contains(ptr))
    }

    /// Allocates one chunk, acquiring a new slab from the system allocator if no chunk is free.
    ///
    /// The chunk is sized and aligned for the configured item layout. Its contents are
    /// unspecified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlabAllocationFailed`] if there was no free chunk and the system
    /// allocator refused to provide a new slab.
    pub fn allocate(&mut self) -> Result<NonNull<u8>> {
        if let Some(chunk) = self.free_list.pop() {
            return Ok(chunk);
        }

        self.allocate_need_resize()
    }

    /// Returns a chunk to the pool, making it available for future allocations.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `chunk` was returned by [`allocate()`](Self::allocate) on this pool.
    /// - `chunk` has not been deallocated since, and the pool has not been purged or shrunk
    ///   in a way that released it.
    /// - The chunk is not used after this call.
    ///
    /// Debug builds verify that the pointer is the start of a chunk in a slab owned by this
    /// pool and panic if it is not.
    pub unsafe fn deallocate(&mut self, chunk: NonNull<u8>) {
        debug_assert!(
            self.is_chunk_start(chunk),
            "pointer {chunk:?} is not the start of a chunk owned by this pool"
        );

        // SAFETY: The caller guarantees the chunk came from this pool and is not on the free
        // list. Chunks of live slabs are valid and aligned for a free-list link.
        unsafe {
            self.free_list.push(chunk);
        }
    }

    /// Releases every slab back to the system allocator, regardless of whether any chunks are
    /// still allocated. All previously allocated chunks become dangling.
    ///
    /// The next slab will again hold the configured starting number of chunks.
    ///
    /// Returns `false` if the pool owned no slabs.
    pub fn purge_memory(&mut self) -> bool {
        self.chunk_count = self.start_chunk_count;

        let Some(head) = self.slabs.take() else {
            return false;
        };

        // Every free chunk lives in one of the slabs we are about to release.
        self.free_list.clear();

        let mut released = 0_usize;
        let mut current = Some(head);

        while let Some(slab) = current {
            // Must be read before the slab (and its trailer) is gone.
            current = slab.next();

            // SAFETY: The slab is ours, it is no longer reachable from the slab list and the
            // free list no longer refers to any of its chunks.
            unsafe {
                self.release_slab(slab);
            }

            // Cannot overflow, we cannot own more slabs than there are bytes in memory.
            released = released.wrapping_add(1);
        }

        debug!(released_slabs = released, "purged all slabs");

        true
    }

    /// Releases every slab in which all chunks are free back to the system allocator. Slabs
    /// with at least one allocated chunk are kept, as are their free chunks.
    ///
    /// The next slab will again hold the configured starting number of chunks, whether or not
    /// any slab was released.
    ///
    /// Returns `true` if at least one slab was released.
    pub fn shrink_memory(&mut self) -> bool {
        self.chunk_count = self.start_chunk_count;

        if self.free_list.is_empty() {
            return false;
        }

        let chunk_size = self.chunk_size();

        // The free list is in no particular order, so we test slab membership via a set.
        let mut free_chunks: HashSet<NonNull<u8>> = self.free_list.iter().collect();

        let mut idle_slabs = Vec::new();
        let mut previous: Option<SlabView> = None;
        let mut current = self.slabs;

        while let Some(slab) = current {
            current = slab.next();

            if slab
                .chunks(chunk_size)
                .all(|chunk| free_chunks.contains(&chunk))
            {
                // Unlink the slab by pointing its predecessor past it.
                match previous {
                    Some(previous) => previous.set_next(current),
                    None => self.slabs = current,
                }

                idle_slabs.push(slab);
            } else {
                previous = Some(slab);
            }
        }

        if idle_slabs.is_empty() {
            return false;
        }

        // What remains in the set afterwards are the free chunks of the slabs we keep.
        for slab in &idle_slabs {
            for chunk in slab.chunks(chunk_size) {
                free_chunks.remove(&chunk);
            }
        }

        let released_chunks = self
            .free_list
            .retain(|chunk| free_chunks.contains(&chunk));

        for slab in &idle_slabs {
            // SAFETY: The slab is ours, it has been unlinked from the slab list and the free
            // list no longer refers to any of its chunks.
            unsafe {
                self.release_slab(*slab);
            }
        }

        debug!(
            released_slabs = idle_slabs.len(),
            released_chunks,
            remaining_slabs = self.slab_count(),
            "released idle slabs"
        );

        true
    }

    #[cold]
    fn allocate_need_resize(&mut self) -> Result<NonNull<u8>> {
        let slab = self.acquire_slab()?;

        // SAFETY: The slab was just acquired and is exclusively ours. Its usable region is a
        // whole number of chunks, at least one. The slab start and the chunk size are both
        // multiples of the chunk alignment, which is a multiple of pointer alignment.
        unsafe {
            self.free_list
                .add_block(slab.begin(), slab.usable_size(), self.chunk_size());
        }

        slab.set_next(self.slabs);
        self.slabs = Some(slab);

        self.chunk_count = self.next_chunk_count();
        trace!(
            next_chunk_count = self.chunk_count.get(),
            "updated chunk count for next slab"
        );

        Ok(self
            .free_list
            .pop()
            .expect("a freshly acquired slab always contributes at least one chunk"))
    }

    /// Acquires a slab of the current chunk count, retrying once at half the size if the
    /// system allocator refuses. On retry, the reduced chunk count is kept for future slabs.
    fn acquire_slab(&mut self) -> Result<SlabView> {
        if let Some(slab) = self.try_acquire_slab() {
            return Ok(slab);
        }

        if self.chunk_count.get() > RETRY_THRESHOLD {
            let halved = NonZero::new(Integer::div_floor(&self.chunk_count.get(), &2))
                .expect("half of a count above the retry threshold is never zero");

            debug!(
                chunk_count = self.chunk_count.get(),
                retry_chunk_count = halved.get(),
                "slab allocation failed, retrying with a smaller slab"
            );

            self.chunk_count = halved;

            if let Some(slab) = self.try_acquire_slab() {
                return Ok(slab);
            }
        }

        let slab_size = self.layout.slab_layout(self.chunk_count).size();

        debug!(
            slab_size,
            chunk_count = self.chunk_count.get(),
            "slab allocation failed"
        );

        Err(Error::SlabAllocationFailed {
            slab_size,
            chunk_count: self.chunk_count,
            chunk_size: self.layout.chunk_size(),
        })
    }

    fn try_acquire_slab(&self) -> Option<SlabView> {
        let slab_layout = self.layout.slab_layout(self.chunk_count);

        let ptr = self.memory.acquire(slab_layout)?;

        debug!(
            slab_size = slab_layout.size(),
            chunk_count = self.chunk_count.get(),
            chunk_size = self.chunk_size(),
            "acquired slab"
        );

        // SAFETY: The buffer is exclusively ours and valid for the whole layout, which is larger
        // than the trailer. The buffer is aligned to the chunk alignment, which is a multiple of
        // pointer and usize alignment, and the usable region is a whole number of chunks, so the
        // trailer is aligned as well.
        Some(unsafe { SlabView::new(ptr, slab_layout.size()) })
    }

    /// Returns a slab to the system allocator.
    ///
    /// # Safety
    ///
    /// The slab must have been acquired by this pool and must no longer be reachable from
    /// either the slab list or the free list.
    unsafe fn release_slab(&self, slab: SlabView) {
        let slab_layout = self.layout.slab_layout_of_size(slab.total_size());

        trace!(slab_size = slab_layout.size(), "releasing slab");

        // SAFETY: The slab was acquired from the same memory source with a layout of this size
        // and the chunk alignment. The caller guarantees nothing refers to it anymore.
        unsafe {
            self.memory.release(slab.begin(), slab_layout);
        }
    }

    /// The chunk count of the slab after the current one: double the current count, limited by
    /// the growth cap and by what a single slab can hold.
    fn next_chunk_count(&self) -> NonZero<usize> {
        self.clamp_chunk_count(self.chunk_count.saturating_mul(nz!(2)))
    }

    fn clamp_chunk_count(&self, chunk_count: NonZero<usize>) -> NonZero<usize> {
        let max_chunks = self.layout.max_chunks();

        let limit = self
            .capped_chunk_count()
            .map_or(max_chunks, |capped| capped.min(max_chunks));

        chunk_count.min(limit)
    }

    /// The number of chunks whose combined size does not exceed `max_chunk_count` items of the
    /// requested size. At least one chunk is always allowed, even if a single chunk alone is
    /// larger than the cap.
    fn capped_chunk_count(&self) -> Option<NonZero<usize>> {
        let max_items = self.max_chunk_count?;

        let max_bytes = max_items
            .get()
            .saturating_mul(self.layout.requested_size());

        let chunks = Integer::div_floor(&max_bytes, &self.chunk_size());

        Some(NonZero::new(chunks).unwrap_or(nz!(1)))
    }

    fn slabs(&self) -> impl Iterator<Item = SlabView> {
        SlabView::iter_from(self.slabs)
    }

    fn is_chunk_start(&self, ptr: NonNull<u8>) -> bool {
        let chunk_size = self.chunk_size();

        self.slabs().any(|slab| {
            slab.contains(ptr)
                && Integer::is_multiple_of(
                    &ptr.addr().get().wrapping_sub(slab.begin().addr().get()),
                    &chunk_size,
                )
        })
    }

    #[cfg(test)]
    pub(crate) fn new_with_memory(
        item_layout: Layout,
        chunk_count: NonZero<usize>,
        max_chunk_count: Option<NonZero<usize>>,
        memory: crate::pal::FakeMemory,
    ) -> Self {
        Self::new_inner(
            item_layout,
            chunk_count,
            max_chunk_count,
            MemoryFacade::fake(memory),
        )
    }

    /// The chunk the next allocation will return, if one is free.
    #[cfg(test)]
    pub(crate) fn free_head(&self) -> Option<NonNull<u8>> {
        self.free_list.head()
    }

    /// Start of the most recently acquired slab.
    #[cfg(test)]
    pub(crate) fn newest_slab(&self) -> Option<NonNull<u8>> {
        self.slabs.map(|slab| slab.begin())
    }
}

impl Drop for RawSegregatedPool {
    fn drop(&mut self) {
        self.purge_memory();
    }
}

// SAFETY: The pool exclusively owns its slabs and all the pointers it holds refer into them.
// It does not rely on thread-local state, so it may be moved to another thread. It is not Sync
// because every operation mutates the intrusive lists and requires &mut self.
unsafe impl Send for RawSegregatedPool {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::arithmetic_side_effects,
    clippy::integer_division,
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::pal::FakeMemory;
    use crate::trailer_size;

    assert_impl_all!(RawSegregatedPool: Send, Debug);
    assert_not_impl_any!(RawSegregatedPool: Sync);

    #[repr(align(64))]
    struct CacheLineAligned {
        _value: u8,
    }

    fn fake_pool(
        chunk_count: usize,
        max_chunk_count: Option<usize>,
    ) -> (RawSegregatedPool, FakeMemory) {
        let memory = FakeMemory::new();

        let pool = RawSegregatedPool::new_with_memory(
            Layout::new::<u64>(),
            NonZero::new(chunk_count).unwrap(),
            max_chunk_count.map(|max| NonZero::new(max).unwrap()),
            memory.clone(),
        );

        (pool, memory)
    }

    /// Chunk counts of every slab the pool has asked for, in order, including refused ones.
    fn requested_chunk_counts(pool: &RawSegregatedPool, memory: &FakeMemory) -> Vec<usize> {
        memory
            .requests()
            .iter()
            .map(|layout| (layout.size() - trailer_size()) / pool.chunk_size())
            .collect()
    }

    fn allocate_many(pool: &mut RawSegregatedPool, count: usize) -> Vec<NonNull<u8>> {
        (0..count).map(|_| pool.allocate().unwrap()).collect()
    }

    #[test]
    fn new_pool_owns_no_memory() {
        let (pool, memory) = fake_pool(10, None);

        assert_eq!(pool.slab_count(), 0);
        assert_eq!(pool.capacity(), 0);
        assert_eq!(pool.free_count(), 0);
        assert!(memory.requests().is_empty());
    }

    #[test]
    fn end_to_end_allocate_deallocate_purge() {
        let (mut pool, memory) = fake_pool(10, Some(1000));

        let first = pool.allocate().unwrap();
        assert_eq!(pool.newest_slab(), Some(first));

        let second = pool.allocate().unwrap();
        assert_eq!(
            second.addr().get() - first.addr().get(),
            pool.chunk_size()
        );

        unsafe { pool.deallocate(first) };
        assert_eq!(pool.allocate().unwrap(), first);

        assert!(pool.purge_memory());
        assert_eq!(pool.newest_slab(), None);
        assert_eq!(memory.outstanding(), 0);
    }

    #[test]
    fn first_slab_has_configured_chunk_count() {
        let (mut pool, memory) = fake_pool(10, None);

        pool.allocate().unwrap();

        assert_eq!(memory.requests().len(), 1);
        assert_eq!(
            memory.requests()[0].size(),
            10 * pool.chunk_size() + trailer_size()
        );
        assert_eq!(pool.capacity(), 10);
        assert_eq!(pool.free_count(), 9);
    }

    #[test]
    fn new_slab_only_when_free_list_is_empty() {
        let (mut pool, _memory) = fake_pool(4, None);

        for _ in 0..30 {
            let had_free = pool.free_count() > 0;
            let slabs_before = pool.slab_count();

            pool.allocate().unwrap();

            let expected = if had_free {
                slabs_before
            } else {
                slabs_before + 1
            };
            assert_eq!(pool.slab_count(), expected);
        }
    }

    #[test]
    fn allocations_within_a_slab_are_chunk_size_apart() {
        let (mut pool, _memory) = fake_pool(8, None);

        let chunks = allocate_many(&mut pool, 8);

        for pair in chunks.windows(2) {
            assert_eq!(
                pair[1].addr().get() - pair[0].addr().get(),
                pool.chunk_size()
            );
        }
        assert_eq!(pool.slab_count(), 1);
    }

    #[test]
    fn allocations_within_every_slab_are_chunk_size_apart() {
        let (mut pool, memory) = fake_pool(4, Some(16));

        // 4 + 8 + 16 + 16 chunks fill four slabs exactly.
        let chunks = allocate_many(&mut pool, 44);
        let counts = requested_chunk_counts(&pool, &memory);
        assert_eq!(counts, vec![4, 8, 16, 16]);

        let mut remaining = chunks.as_slice();
        for count in counts {
            let (slab_chunks, rest) = remaining.split_at(count);
            remaining = rest;

            for pair in slab_chunks.windows(2) {
                assert_eq!(
                    pair[1].addr().get() - pair[0].addr().get(),
                    pool.chunk_size()
                );
            }
        }
        assert!(remaining.is_empty());
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn slabs_double_without_cap() {
        let (mut pool, memory) = fake_pool(4, None);

        // 4 + 8 + 16 + 1 chunks need four slabs.
        allocate_many(&mut pool, 29);

        assert_eq!(requested_chunk_counts(&pool, &memory), vec![4, 8, 16, 32]);
        assert_eq!(pool.chunk_count().get(), 64);
    }

    #[test]
    fn slabs_stop_growing_at_cap() {
        let (mut pool, memory) = fake_pool(4, Some(10));

        // 4 + 8 + 10 + 1 chunks need four slabs.
        allocate_many(&mut pool, 23);

        assert_eq!(requested_chunk_counts(&pool, &memory), vec![4, 8, 10, 10]);

        let largest = Layout::new::<u64>().size() * 10 + trailer_size();
        assert!(memory.requests().iter().all(|l| l.size() <= largest));
    }

    #[test]
    fn initial_chunk_count_is_clamped_to_cap() {
        let (mut pool, memory) = fake_pool(50, Some(10));

        assert_eq!(pool.chunk_count().get(), 10);

        pool.allocate().unwrap();
        assert_eq!(requested_chunk_counts(&pool, &memory), vec![10]);
    }

    #[test]
    fn cap_is_measured_in_requested_item_size() {
        let memory = FakeMemory::new();

        // Items of 1 byte occupy pointer-sized chunks, so 16 items' worth of memory is only a
        // few chunks.
        let pool = RawSegregatedPool::new_with_memory(
            Layout::new::<u8>(),
            nz!(32),
            Some(nz!(16)),
            memory,
        );

        assert_eq!(pool.chunk_count().get(), 16 / pool.chunk_size());
    }

    #[test]
    fn cap_smaller_than_one_chunk_still_allows_one_chunk() {
        let memory = FakeMemory::new();

        let mut pool = RawSegregatedPool::new_with_memory(
            Layout::new::<u8>(),
            nz!(32),
            Some(nz!(1)),
            memory.clone(),
        );

        assert_eq!(pool.chunk_count().get(), 1);

        allocate_many(&mut pool, 3);
        assert_eq!(requested_chunk_counts(&pool, &memory), vec![1, 1, 1]);
    }

    #[test]
    fn cap_above_max_chunks_is_clamped() {
        let (pool, _memory) = fake_pool(1, Some(usize::MAX));

        assert_eq!(pool.max_chunk_count(), Some(pool.max_chunks()));
    }

    #[test]
    fn refused_slab_is_retried_at_half_size() {
        let (mut pool, memory) = fake_pool(16, None);

        let eight_chunk_slab = 8 * pool.chunk_size() + trailer_size();
        memory.set_refuse_above(Some(eight_chunk_slab));

        pool.allocate().unwrap();

        assert_eq!(requested_chunk_counts(&pool, &memory), vec![16, 8]);
        assert_eq!(pool.capacity(), 8);

        // Growth continues from the reduced size.
        assert_eq!(pool.chunk_count().get(), 16);
    }

    #[test]
    fn refused_retry_returns_error() {
        let (mut pool, memory) = fake_pool(16, None);
        memory.set_refuse_all(true);

        let error = pool.allocate().unwrap_err();

        assert!(matches!(
            error,
            Error::SlabAllocationFailed { chunk_count, .. } if chunk_count.get() == 8
        ));
        assert_eq!(requested_chunk_counts(&pool, &memory), vec![16, 8]);
        assert_eq!(pool.slab_count(), 0);

        // The pool remains usable once memory is available again.
        memory.set_refuse_all(false);
        pool.allocate().unwrap();
        assert_eq!(pool.capacity(), 8);
    }

    #[test]
    fn small_slabs_are_not_retried() {
        let (mut pool, memory) = fake_pool(4, None);
        memory.set_refuse_all(true);

        let error = pool.allocate().unwrap_err();

        assert!(matches!(
            error,
            Error::SlabAllocationFailed { chunk_count, .. } if chunk_count.get() == 4
        ));
        assert_eq!(memory.requests().len(), 1);
    }

    #[test]
    fn deallocate_then_allocate_returns_same_chunk() {
        let (mut pool, _memory) = fake_pool(4, None);

        let chunk = pool.allocate().unwrap();
        let head_before = pool.free_head();

        unsafe { pool.deallocate(chunk) };
        assert_eq!(pool.free_head(), Some(chunk));

        assert_eq!(pool.allocate().unwrap(), chunk);
        assert_eq!(pool.free_head(), head_before);
    }

    #[test]
    fn chunks_are_writable_for_their_full_size() {
        let (mut pool, _memory) = fake_pool(4, None);

        let chunks = allocate_many(&mut pool, 20);
        for (index, chunk) in chunks.iter().enumerate() {
            unsafe { chunk.cast::<u64>().write(index as u64) };
        }

        for (index, chunk) in chunks.iter().enumerate() {
            assert_eq!(unsafe { chunk.cast::<u64>().read() }, index as u64);
        }
    }

    #[test]
    fn over_aligned_items_get_aligned_chunks() {
        let memory = FakeMemory::new();
        let mut pool = RawSegregatedPool::new_with_memory(
            Layout::new::<CacheLineAligned>(),
            nz!(4),
            None,
            memory,
        );

        for chunk in allocate_many(&mut pool, 10) {
            assert_eq!(chunk.addr().get() % 64, 0);
        }
    }

    #[test]
    fn purge_releases_every_slab() {
        let (mut pool, memory) = fake_pool(4, None);

        allocate_many(&mut pool, 20);
        assert_eq!(memory.outstanding(), 3);

        assert!(pool.purge_memory());

        assert_eq!(memory.outstanding(), 0);
        assert_eq!(memory.releases().len(), 3);
        assert_eq!(pool.slab_count(), 0);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.chunk_count().get(), 4);
    }

    #[test]
    fn purge_is_idempotent() {
        let (mut pool, memory) = fake_pool(4, None);

        assert!(!pool.purge_memory());

        pool.allocate().unwrap();
        assert!(pool.purge_memory());
        assert!(!pool.purge_memory());

        assert_eq!(memory.releases().len(), 1);
    }

    #[test]
    fn allocate_after_purge_starts_over() {
        let (mut pool, memory) = fake_pool(4, None);

        allocate_many(&mut pool, 10);
        pool.purge_memory();
        pool.allocate().unwrap();

        assert_eq!(
            requested_chunk_counts(&pool, &memory),
            vec![4, 8, 4]
        );
    }

    #[test]
    fn shrink_releases_only_idle_slab() {
        // With the cap equal to the start size, every slab holds 4 chunks.
        let (mut pool, memory) = fake_pool(4, Some(4));

        let chunks = allocate_many(&mut pool, 12);
        assert_eq!(pool.slab_count(), 3);

        // Free the whole middle slab.
        for chunk in &chunks[4..8] {
            unsafe { pool.deallocate(*chunk) };
        }

        assert!(pool.shrink_memory());

        assert_eq!(pool.slab_count(), 2);
        assert_eq!(memory.releases(), vec![memory.requests()[1]]);
        assert_eq!(memory.outstanding(), 2);
        assert_eq!(pool.free_count(), 0);

        assert!(pool.is_from(chunks[0]));
        assert!(pool.is_from(chunks[11]));
        assert!(!pool.is_from(chunks[5]));

        // The remaining slabs work exactly as before.
        unsafe { pool.deallocate(chunks[0]) };
        assert_eq!(pool.allocate().unwrap(), chunks[0]);
        assert_eq!(pool.slab_count(), 2);
    }

    #[test]
    fn shrink_does_not_depend_on_free_list_order() {
        let (mut pool, memory) = fake_pool(4, Some(4));

        let chunks = allocate_many(&mut pool, 12);

        // Interleave chunks of the middle slab with chunks of the other slabs, out of order.
        for index in [9, 6, 1, 4, 7, 5] {
            unsafe { pool.deallocate(chunks[index]) };
        }

        assert!(pool.shrink_memory());

        assert_eq!(memory.releases(), vec![memory.requests()[1]]);
        assert_eq!(pool.free_count(), 2);

        // The surviving free chunks keep their relative order.
        assert_eq!(pool.allocate().unwrap(), chunks[1]);
        assert_eq!(pool.allocate().unwrap(), chunks[9]);
    }

    #[test]
    fn shrink_releases_first_and_last_slab() {
        let (mut pool, memory) = fake_pool(4, Some(4));

        let chunks = allocate_many(&mut pool, 12);

        for chunk in chunks[0..4].iter().chain(&chunks[8..12]) {
            unsafe { pool.deallocate(*chunk) };
        }

        assert!(pool.shrink_memory());

        assert_eq!(pool.slab_count(), 1);
        assert_eq!(memory.outstanding(), 1);
        assert!(pool.is_from(chunks[4]));
    }

    #[test]
    fn shrink_without_idle_slabs_keeps_everything() {
        let (mut pool, memory) = fake_pool(4, None);

        let chunks = allocate_many(&mut pool, 5);
        unsafe { pool.deallocate(chunks[0]) };

        assert!(!pool.shrink_memory());

        assert_eq!(pool.slab_count(), 2);
        assert_eq!(pool.free_count(), 8);
        assert!(memory.releases().is_empty());
    }

    #[test]
    fn shrink_of_fully_free_pool_releases_everything() {
        let (mut pool, memory) = fake_pool(4, None);

        let chunks = allocate_many(&mut pool, 10);
        for chunk in chunks {
            unsafe { pool.deallocate(chunk) };
        }

        assert!(pool.shrink_memory());

        assert_eq!(pool.slab_count(), 0);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(memory.outstanding(), 0);

        pool.allocate().unwrap();
        assert_eq!(pool.slab_count(), 1);
    }

    #[test]
    fn shrink_releases_many_slabs_at_once() {
        let (mut pool, memory) = fake_pool(2, Some(2));

        // Every slab holds two chunks, so chunks 2k and 2k + 1 share slab k.
        let chunks = allocate_many(&mut pool, 200);
        assert_eq!(pool.slab_count(), 100);

        let busy: Vec<_> = chunks.iter().copied().step_by(10).collect();
        for (index, chunk) in chunks.iter().enumerate() {
            if index % 10 != 0 {
                unsafe { pool.deallocate(*chunk) };
            }
        }

        assert!(pool.shrink_memory());

        assert_eq!(pool.slab_count(), busy.len());
        assert_eq!(memory.outstanding(), busy.len());
        assert_eq!(pool.free_count(), busy.len());
        assert!(busy.iter().all(|chunk| pool.is_from(*chunk)));

        // The remaining free chunks are exactly the partners of the busy ones.
        let partners: HashSet<_> = (0..chunks.len())
            .step_by(10)
            .map(|index| chunks[index + 1])
            .collect();
        let reused: HashSet<_> = allocate_many(&mut pool, busy.len()).into_iter().collect();
        assert_eq!(reused, partners);
        assert_eq!(memory.requests().len(), 100);
    }

    #[test]
    fn shrink_resets_chunk_count() {
        let (mut pool, _memory) = fake_pool(4, None);

        allocate_many(&mut pool, 5);
        assert_eq!(pool.chunk_count().get(), 16);

        assert!(!pool.shrink_memory());
        assert_eq!(pool.chunk_count().get(), 4);
    }

    #[test]
    fn drop_releases_every_slab() {
        let (mut pool, memory) = fake_pool(4, None);

        allocate_many(&mut pool, 13);
        assert_eq!(memory.outstanding(), 3);

        drop(pool);

        assert_eq!(memory.outstanding(), 0);
    }

    #[test]
    fn is_from_rejects_foreign_pointers() {
        let (mut pool, _memory) = fake_pool(4, None);
        let chunk = pool.allocate().unwrap();

        let mut local = 0_u64;
        let foreign = NonNull::from(&mut local).cast::<u8>();

        assert!(pool.is_from(chunk));
        assert!(!pool.is_from(foreign));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn deallocate_of_misaligned_pointer_panics() {
        let (mut pool, _memory) = fake_pool(4, None);
        let chunk = pool.allocate().unwrap();

        unsafe { pool.deallocate(chunk.byte_add(1)) };
    }
}
