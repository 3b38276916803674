use std::iter;
use std::ptr::NonNull;

/// Intrusive singly linked list of free chunks, threaded through the chunks' own bytes.
///
/// While a chunk is on the list, its leading pointer-sized region holds the address of the next
/// free chunk (or null at the end of the list). The list has no knowledge of slabs or items.
///
/// # Safety invariant
///
/// Every chunk reachable from `head` is valid for pointer-sized reads and writes and is aligned
/// for a pointer, for as long as it remains on the list. [`add_block()`](Self::add_block) and
/// [`push()`](Self::push) establish this for the chunks they add and the owner of the list
/// must not release the underlying memory without first removing the chunks (via
/// [`clear()`](Self::clear) or [`retain()`](Self::retain)).
#[derive(Debug)]
pub(crate) struct FreeList {
    head: Option<NonNull<u8>>,
}

impl FreeList {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self { head: None }
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// The chunk that the next [`pop()`](Self::pop) will return.
    #[cfg_attr(not(test), expect(dead_code, reason = "only inspected by tests"))]
    #[must_use]
    pub(crate) fn head(&self) -> Option<NonNull<u8>> {
        self.head
    }

    /// Number of chunks on the list. This walks the entire list.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.iter().count()
    }

    /// Iterates over the free chunks, starting from the head.
    pub(crate) fn iter(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        iter::successors(self.head, |chunk| {
            // SAFETY: Every chunk on the list is valid for pointer reads (type invariant).
            unsafe { next_of(*chunk) }
        })
    }

    /// Partitions a raw block into consecutive chunks and places them at the head of the list,
    /// in ascending address order, ahead of any chunks already on the list.
    ///
    /// The block is split into `total_size / partition_size` chunks. A block that cannot be
    /// split more than once becomes a single chunk.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `block` is valid for reads and writes of `total_size` bytes and stays valid until every
    ///   chunk carved from it has been removed from the list.
    /// - `block` and `partition_size` are both multiples of pointer alignment.
    /// - `partition_size` is at least pointer-sized and not greater than `total_size`.
    /// - No part of the block is already on the list or otherwise in use.
    pub(crate) unsafe fn add_block(
        &mut self,
        block: NonNull<u8>,
        total_size: usize,
        partition_size: usize,
    ) {
        // SAFETY: Forwarding guarantees from the caller.
        self.head = Some(unsafe { segregate(block, total_size, partition_size, self.head) });
    }

    /// Takes the chunk at the head of the list, or `None` if the list is empty.
    ///
    /// Ownership of the chunk passes to the caller, who may overwrite all of its bytes.
    #[must_use]
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let chunk = self.head?;

        // SAFETY: Every chunk on the list is valid for pointer reads (type invariant).
        self.head = unsafe { next_of(chunk) };

        Some(chunk)
    }

    /// Places a chunk at the head of the list.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - The chunk was previously obtained from [`pop()`](Self::pop) on this list and is not
    ///   currently on the list (pushing a chunk twice corrupts the list).
    /// - The memory backing the chunk is still valid.
    pub(crate) unsafe fn push(&mut self, chunk: NonNull<u8>) {
        // SAFETY: The caller guarantees the chunk came from this list, so it is valid for
        // pointer writes and correctly aligned.
        unsafe { set_next(chunk, self.head) };

        self.head = Some(chunk);
    }

    /// Forgets every chunk on the list without touching chunk memory.
    pub(crate) fn clear(&mut self) {
        self.head = None;
    }

    /// Removes every chunk for which `keep` returns `false`, preserving the relative order of
    /// the remaining chunks. Returns the number of chunks removed.
    ///
    /// Removed chunks are not written to, so their memory may be released afterwards.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(NonNull<u8>) -> bool) -> usize {
        let mut removed = 0_usize;
        let mut last_kept: Option<NonNull<u8>> = None;
        let mut current = self.head;

        while let Some(chunk) = current {
            // SAFETY: Every chunk on the list is valid for pointer reads (type invariant).
            current = unsafe { next_of(chunk) };

            if !keep(chunk) {
                // Cannot overflow, we cannot have more chunks than bytes in memory.
                removed = removed.wrapping_add(1);
                continue;
            }

            match last_kept {
                // SAFETY: `previous` is still on the list, so it is valid for pointer writes.
                Some(previous) => unsafe { set_next(previous, Some(chunk)) },
                None => self.head = Some(chunk),
            }

            last_kept = Some(chunk);
        }

        match last_kept {
            // SAFETY: `previous` is still on the list, so it is valid for pointer writes.
            Some(previous) => unsafe { set_next(previous, None) },
            None => self.head = None,
        }

        removed
    }

    /// Finds the free chunk immediately preceding the first chunk whose address is at or
    /// above `ptr`, scanning in list order.
    ///
    /// Returns `None` if the list is empty or if its head is already at or above `ptr`.
    #[cfg_attr(not(test), expect(dead_code, reason = "only exercised by tests"))]
    #[must_use]
    pub(crate) fn find_prev(&self, ptr: NonNull<u8>) -> Option<NonNull<u8>> {
        let mut candidate = self.head.filter(|head| *head < ptr)?;

        loop {
            // SAFETY: Every chunk on the list is valid for pointer reads (type invariant).
            match unsafe { next_of(candidate) } {
                Some(next) if next < ptr => candidate = next,
                _ => return Some(candidate),
            }
        }
    }
}

/// Splits a raw block into a linked sub-list of chunks whose last chunk links to `tail`.
/// Returns the first chunk of the sub-list, which is always `block` itself.
///
/// # Safety
///
/// Same requirements as [`FreeList::add_block()`].
unsafe fn segregate(
    block: NonNull<u8>,
    total_size: usize,
    partition_size: usize,
    tail: Option<NonNull<u8>>,
) -> NonNull<u8> {
    debug_assert!(partition_size >= size_of::<*mut u8>());
    debug_assert!(partition_size <= total_size);

    let chunk_count = total_size
        .checked_div(partition_size)
        .expect("partition size is never zero");

    for index in 0..chunk_count {
        // Cannot overflow, the result is within the block (guaranteed by caller).
        let next_index = index.wrapping_add(1);

        let next = if next_index < chunk_count {
            // SAFETY: next_index < chunk_count, so the offset is within the block.
            Some(unsafe { block.byte_add(next_index.wrapping_mul(partition_size)) })
        } else {
            tail
        };

        // SAFETY: index < chunk_count, so the offset is within the block.
        let chunk = unsafe { block.byte_add(index.wrapping_mul(partition_size)) };

        // SAFETY: The chunk lies inside the block, is pointer-aligned because both block and
        // partition size are multiples of pointer alignment, and is at least pointer-sized.
        unsafe { set_next(chunk, next) };
    }

    block
}

/// Reads the free-list link stored in a chunk.
///
/// # Safety
///
/// The chunk must be valid for pointer-sized reads, pointer-aligned and hold a link previously
/// written by [`set_next()`].
unsafe fn next_of(chunk: NonNull<u8>) -> Option<NonNull<u8>> {
    // `Option<NonNull<u8>>` is guaranteed to have the same layout as a raw pointer,
    // with `None` represented as null.
    // SAFETY: Forwarding guarantees from the caller.
    unsafe { chunk.cast::<Option<NonNull<u8>>>().read() }
}

/// Writes the free-list link into a chunk, overwriting whatever the chunk held before.
///
/// # Safety
///
/// The chunk must be valid for pointer-sized writes and pointer-aligned.
unsafe fn set_next(chunk: NonNull<u8>, next: Option<NonNull<u8>>) {
    // SAFETY: Forwarding guarantees from the caller.
    unsafe { chunk.cast::<Option<NonNull<u8>>>().write(next) };
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::integer_division,
    clippy::arithmetic_side_effects,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::alloc::{Layout, alloc, dealloc};

    use static_assertions::assert_not_impl_any;

    use super::*;

    const BLOCK_SIZE: usize = 1000;
    const PARTITION_SIZE: usize = 40;

    assert_not_impl_any!(FreeList: Send, Sync);

    /// Owns a raw heap block for the duration of a test.
    struct TestBlock {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl TestBlock {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, align_of::<*mut u8>()).unwrap();
            let ptr = NonNull::new(unsafe { alloc(layout) }).expect("test allocation failed");
            Self { ptr, layout }
        }

        fn chunk(&self, index: usize) -> NonNull<u8> {
            unsafe { self.ptr.byte_add(index * PARTITION_SIZE) }
        }
    }

    impl Drop for TestBlock {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    fn list_with_block(block: &TestBlock, size: usize) -> FreeList {
        let mut list = FreeList::new();
        unsafe { list.add_block(block.ptr, size, PARTITION_SIZE) };
        list
    }

    #[test]
    fn new_list_is_empty() {
        let mut list = FreeList::new();

        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        assert!(list.head().is_none());
        assert!(list.pop().is_none());
    }

    #[test]
    fn add_block_links_consecutive_chunks() {
        let block = TestBlock::new(BLOCK_SIZE);
        let list = list_with_block(&block, BLOCK_SIZE);

        assert_eq!(list.head(), Some(block.ptr));
        assert_eq!(list.len(), BLOCK_SIZE / PARTITION_SIZE);

        for (index, chunk) in list.iter().enumerate() {
            assert_eq!(chunk, block.chunk(index));
            assert!(chunk.addr().get() + PARTITION_SIZE <= block.ptr.addr().get() + BLOCK_SIZE);
        }
    }

    #[test]
    fn add_block_ignores_trailing_remainder() {
        let block = TestBlock::new(BLOCK_SIZE);
        // 999 bytes hold 24 chunks of 40 bytes, with 39 bytes left over.
        let list = list_with_block(&block, BLOCK_SIZE - 1);

        assert_eq!(list.len(), (BLOCK_SIZE - 1) / PARTITION_SIZE);
    }

    #[test]
    fn add_block_that_cannot_be_split_becomes_single_chunk() {
        let block = TestBlock::new(PARTITION_SIZE + 8);
        let mut list = list_with_block(&block, PARTITION_SIZE + 8);

        assert_eq!(list.len(), 1);
        assert_eq!(list.pop(), Some(block.ptr));
        assert!(list.is_empty());
    }

    #[test]
    fn add_block_prepends_to_existing_chunks() {
        let first = TestBlock::new(PARTITION_SIZE * 2);
        let second = TestBlock::new(PARTITION_SIZE * 2);

        let mut list = list_with_block(&first, PARTITION_SIZE * 2);
        unsafe { list.add_block(second.ptr, PARTITION_SIZE * 2, PARTITION_SIZE) };

        let chunks: Vec<_> = list.iter().collect();
        assert_eq!(
            chunks,
            vec![second.chunk(0), second.chunk(1), first.chunk(0), first.chunk(1)]
        );
    }

    #[test]
    fn pop_walks_chunks_in_address_order() {
        let block = TestBlock::new(BLOCK_SIZE);
        let mut list = list_with_block(&block, BLOCK_SIZE);

        assert_eq!(list.pop(), Some(block.chunk(0)));
        assert_eq!(list.pop(), Some(block.chunk(1)));
        assert_eq!(list.head(), Some(block.chunk(2)));
    }

    #[test]
    fn pop_then_push_restores_head() {
        let block = TestBlock::new(BLOCK_SIZE);
        let mut list = list_with_block(&block, BLOCK_SIZE);
        let head_before = list.head();

        let chunk = list.pop().unwrap();
        unsafe { list.push(chunk) };

        assert_eq!(list.head(), head_before);
        assert_eq!(list.len(), BLOCK_SIZE / PARTITION_SIZE);
    }

    #[test]
    fn push_is_lifo() {
        let block = TestBlock::new(BLOCK_SIZE);
        let mut list = list_with_block(&block, BLOCK_SIZE);

        let first = list.pop().unwrap();
        let second = list.pop().unwrap();

        unsafe { list.push(first) };
        assert_eq!(list.head(), Some(first));

        // The freed chunk now links to what was the head before it was pushed.
        let chunks: Vec<_> = list.iter().take(2).collect();
        assert_eq!(chunks, vec![first, block.chunk(2)]);

        unsafe { list.push(second) };
        assert_eq!(list.pop(), Some(second));
        assert_eq!(list.pop(), Some(first));
        assert_eq!(list.pop(), Some(block.chunk(2)));
    }

    #[test]
    fn chunk_memory_is_usable_after_pop() {
        let block = TestBlock::new(BLOCK_SIZE);
        let mut list = list_with_block(&block, BLOCK_SIZE);

        let chunk = list.pop().unwrap();
        unsafe { chunk.as_ptr().write_bytes(0xAB, PARTITION_SIZE) };

        // The rest of the list is unaffected by scribbling over the popped chunk.
        assert_eq!(list.len(), BLOCK_SIZE / PARTITION_SIZE - 1);
        assert_eq!(list.pop(), Some(block.chunk(1)));
    }

    #[test]
    fn clear_forgets_all_chunks() {
        let block = TestBlock::new(BLOCK_SIZE);
        let mut list = list_with_block(&block, BLOCK_SIZE);

        list.clear();

        assert!(list.is_empty());
        assert!(list.pop().is_none());
    }

    #[test]
    fn find_prev_returns_preceding_node() {
        let block = TestBlock::new(BLOCK_SIZE);
        let list = list_with_block(&block, BLOCK_SIZE);

        assert_eq!(list.find_prev(block.chunk(1)), Some(block.chunk(0)));
        assert_eq!(list.find_prev(block.chunk(5)), Some(block.chunk(4)));

        // An address between two chunks resolves to the chunk below it.
        let between = unsafe { block.chunk(3).byte_add(1) };
        assert_eq!(list.find_prev(between), Some(block.chunk(3)));
    }

    #[test]
    fn find_prev_before_head_is_none() {
        let block = TestBlock::new(BLOCK_SIZE);
        let list = list_with_block(&block, BLOCK_SIZE);

        assert_eq!(list.find_prev(block.chunk(0)), None);
        assert_eq!(FreeList::new().find_prev(block.chunk(3)), None);
    }

    #[test]
    fn find_prev_past_end_returns_last_node() {
        let block = TestBlock::new(BLOCK_SIZE);
        let list = list_with_block(&block, BLOCK_SIZE);
        let past_end = unsafe { block.ptr.byte_add(BLOCK_SIZE) };

        assert_eq!(
            list.find_prev(past_end),
            Some(block.chunk(BLOCK_SIZE / PARTITION_SIZE - 1))
        );
    }

    #[test]
    fn retain_removes_rejected_chunks_in_order() {
        let block = TestBlock::new(BLOCK_SIZE);
        let mut list = list_with_block(&block, BLOCK_SIZE);
        let total = list.len();

        let odd = |chunk: NonNull<u8>| {
            (chunk.addr().get() - block.ptr.addr().get()) / PARTITION_SIZE % 2 == 1
        };
        let removed = list.retain(|chunk| !odd(chunk));

        assert_eq!(removed, total / 2);
        assert_eq!(list.len(), total - removed);
        assert!(list.iter().all(|chunk| !odd(chunk)));
        assert_eq!(list.pop(), Some(block.chunk(0)));
        assert_eq!(list.pop(), Some(block.chunk(2)));
    }

    #[test]
    fn retain_can_remove_head_and_tail() {
        let block = TestBlock::new(PARTITION_SIZE * 3);
        let mut list = list_with_block(&block, PARTITION_SIZE * 3);

        let middle = block.chunk(1);
        assert_eq!(list.retain(|chunk| chunk == middle), 2);

        assert_eq!(list.iter().collect::<Vec<_>>(), vec![middle]);
    }

    #[test]
    fn retain_everything_removed_empties_list() {
        let block = TestBlock::new(BLOCK_SIZE);
        let mut list = list_with_block(&block, BLOCK_SIZE);

        assert_eq!(list.retain(|_| false), BLOCK_SIZE / PARTITION_SIZE);
        assert!(list.is_empty());
    }
}
