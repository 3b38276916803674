use std::any::type_name;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::num::NonZero;
use std::ptr::NonNull;

use scopeguard::ScopeGuard;

use crate::{ConstructError, Error, RawSegregatedPool, SegregatedPoolBuilder};

/// A growable pool of `T` values, each living in its own fixed-size chunk.
///
/// This is the typed counterpart of [`RawSegregatedPool`]. In addition to handing out chunks
/// sized and aligned for `T`, it can construct values directly in pool memory and destroy them
/// again, returning the chunk to the pool.
///
/// The pool does not track which chunks hold live values. Values still alive when the pool is
/// purged, shrunk away or dropped are not dropped, their memory is simply released. Destroy
/// every value you construct if its destructor matters.
///
/// # Example
///
/// ```rust
/// use segregated_pool::SegregatedPool;
///
/// let mut pool = SegregatedPool::<String>::builder().build();
///
/// let greeting = pool.construct_with(|| "Hello".to_string())?;
///
/// // SAFETY: The value was just constructed and nobody else refers to it.
/// let greeting_ref = unsafe { greeting.as_ref() };
/// assert_eq!(greeting_ref, "Hello");
///
/// // SAFETY: The value came from this pool, is alive and is not used after this point.
/// unsafe { pool.destroy(greeting) };
/// # Ok::<(), segregated_pool::Error>(())
/// ```
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`]) if `T` is, but it is never thread-safe ([`Sync`]).
pub struct SegregatedPool<T> {
    raw: RawSegregatedPool,

    // Values of T are created and dropped through the pool, so it may only move between threads
    // if T may.
    _item: PhantomData<T>,
}

impl<T> SegregatedPool<T> {
    /// Creates a pool whose first slab holds `chunk_count` chunks, with slab growth optionally
    /// capped at `max_chunk_count` items per slab.
    ///
    /// # Panics
    ///
    /// Panics if `T` is a zero-sized type.
    #[must_use]
    pub fn new(chunk_count: NonZero<usize>, max_chunk_count: Option<NonZero<usize>>) -> Self {
        let builder = Self::builder().chunk_count(chunk_count);

        match max_chunk_count {
            Some(max_chunk_count) => builder.max_chunk_count(max_chunk_count).build(),
            None => builder.build(),
        }
    }

    /// Starts building a new pool.
    #[cfg_attr(test, mutants::skip)] // Gets mutated to alternate version of itself.
    pub fn builder() -> SegregatedPoolBuilder<T> {
        SegregatedPoolBuilder::new()
    }

    pub(crate) fn from_raw(raw: RawSegregatedPool) -> Self {
        Self {
            raw,
            _item: PhantomData,
        }
    }

    /// The size of each chunk. This may be larger than `size_of::<T>()`.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.raw.chunk_size()
    }

    /// The number of chunks the next slab will hold.
    #[must_use]
    pub fn chunk_count(&self) -> NonZero<usize> {
        self.raw.chunk_count()
    }

    /// The growth cap, in values of `T`, if one is set.
    #[must_use]
    pub fn max_chunk_count(&self) -> Option<NonZero<usize>> {
        self.raw.max_chunk_count()
    }

    /// The greatest number of chunks a single slab can hold.
    #[must_use]
    pub fn max_chunks(&self) -> NonZero<usize> {
        self.raw.max_chunks()
    }

    /// The number of slabs currently owned by the pool.
    #[must_use]
    pub fn slab_count(&self) -> usize {
        self.raw.slab_count()
    }

    /// The total number of chunks in all slabs owned by the pool, in use or free.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// The number of chunks that can be handed out without acquiring a new slab.
    ///
    /// This walks the entire free list, so it is not cheap.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.raw.free_count()
    }

    /// Whether the pointer points into a chunk of a slab owned by this pool.
    #[must_use]
    pub fn is_from(&self, ptr: NonNull<T>) -> bool {
        self.raw.is_from(ptr.cast())
    }

    /// Allocates uninitialized memory for one `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlabAllocationFailed`] if there was
    /// no free chunk and the system allocator refused to provide a new slab.
    pub fn allocate(&mut self) -> Result<NonNull<MaybeUninit<T>>, Error> {
        self.raw.allocate().map(NonNull::cast)
    }

    /// Returns memory obtained from [`allocate()`](Self::allocate) to the pool without running
    /// any destructor.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `ptr` was returned by [`allocate()`](Self::allocate) on this pool and has not been
    ///   returned since.
    /// - The memory is not used after this call.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<MaybeUninit<T>>) {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe {
            self.raw.deallocate(ptr.cast());
        }
    }

    /// Constructs a default `T` in pool memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlabAllocationFailed`] if no memory
    /// could be obtained for the value.
    pub fn construct(&mut self) -> Result<NonNull<T>, Error>
    where
        T: Default,
    {
        self.construct_with(T::default)
    }

    /// Constructs a `T` in pool memory, using the value returned by `initializer`.
    ///
    /// If the initializer panics, the chunk obtained for the value is returned to the pool
    /// before the panic continues.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlabAllocationFailed`] if no memory
    /// could be obtained for the value. The initializer is not called in that case.
    pub fn construct_with(
        &mut self,
        initializer: impl FnOnce() -> T,
    ) -> Result<NonNull<T>, Error> {
        self.try_construct_with(|| Ok::<T, Infallible>(initializer()))
            .map_err(|error| match error {
                ConstructError::Allocation(error) => error,
                ConstructError::Initialization(never) => match never {},
            })
    }

    /// Constructs a `T` in pool memory, using the value returned by a fallible `initializer`.
    ///
    /// If the initializer fails or panics, the chunk obtained for the value is returned to the
    /// pool and the pool is left as it was before the call.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructError::Allocation`] if no memory could be obtained for the value, in
    /// which case the initializer is not called.
    ///
    /// Returns [`ConstructError::Initialization`] with the initializer's error if it fails.
    pub fn try_construct_with<E>(
        &mut self,
        initializer: impl FnOnce() -> Result<T, E>,
    ) -> Result<NonNull<T>, ConstructError<E>> {
        let chunk = self.raw.allocate().map_err(ConstructError::Allocation)?;

        // Until the value is in place, any exit hands the chunk back.
        let raw = scopeguard::guard(&mut self.raw, |raw| {
            // SAFETY: The chunk was allocated from this pool above and never handed out.
            unsafe {
                raw.deallocate(chunk);
            }
        });

        let value = initializer().map_err(ConstructError::Initialization)?;

        ScopeGuard::into_inner(raw);

        let item = chunk.cast::<T>();

        // SAFETY: The chunk is sized and aligned for T and exclusively ours.
        unsafe {
            item.write(value);
        }

        Ok(item)
    }

    /// Drops a value constructed by this pool and returns its chunk to the pool.
    ///
    /// The chunk is returned to the pool even if the value's destructor panics.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `item` was returned by one of the construction methods of this pool, or was allocated
    ///   from this pool and then initialized with a valid `T`.
    /// - The value has not been destroyed or deallocated since.
    /// - Neither the value nor its memory is used after this call.
    pub unsafe fn destroy(&mut self, item: NonNull<T>) {
        let _return_chunk = scopeguard::guard(&mut self.raw, |raw| {
            // SAFETY: The caller guarantees the chunk came from this pool and is in use.
            unsafe {
                raw.deallocate(item.cast());
            }
        });

        // SAFETY: The caller guarantees the value is alive and not used again.
        unsafe {
            item.drop_in_place();
        }
    }

    /// Releases every slab back to the system allocator. Values still alive are not dropped
    /// and all pointers obtained from the pool become dangling.
    ///
    /// Returns `false` if the pool owned no slabs.
    pub fn purge_memory(&mut self) -> bool {
        self.raw.purge_memory()
    }

    /// Releases every slab that holds no live values back to the system allocator.
    ///
    /// Returns `true` if at least one slab was released.
    pub fn shrink_memory(&mut self) -> bool {
        self.raw.shrink_memory()
    }
}

impl<T> fmt::Debug for SegregatedPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegregatedPool")
            .field("item_type", &type_name::<T>())
            .field("raw", &self.raw)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::alloc::Layout;
    use std::cell::Cell;
    use std::fmt::Debug;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::rc::Rc;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::pal::FakeMemory;

    assert_impl_all!(SegregatedPool<u64>: Send, Debug);
    assert_not_impl_any!(SegregatedPool<u64>: Sync);
    assert_not_impl_any!(SegregatedPool<Rc<u64>>: Send, Sync);

    /// Counts how many times values sharing the counter have been dropped.
    #[derive(Debug)]
    struct DropCounter {
        drops: Rc<Cell<usize>>,
    }

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.drops.set(self.drops.get().wrapping_add(1));
        }
    }

    struct PanicOnDrop;

    impl Drop for PanicOnDrop {
        fn drop(&mut self) {
            panic!("PanicOnDrop was dropped");
        }
    }

    fn fake_pool<T>(memory: &FakeMemory) -> SegregatedPool<T> {
        SegregatedPool::from_raw(RawSegregatedPool::new_with_memory(
            Layout::new::<T>(),
            nz!(4),
            None,
            memory.clone(),
        ))
    }

    #[test]
    fn construct_creates_default_value() {
        let mut pool = SegregatedPool::<u64>::new(nz!(4), None);

        let item = pool.construct().unwrap();

        assert_eq!(unsafe { item.read() }, 0);
        unsafe { pool.destroy(item) };
    }

    #[test]
    fn construct_with_stores_value() {
        let mut pool = SegregatedPool::<String>::new(nz!(4), Some(nz!(16)));

        let item = pool.construct_with(|| "pooled".to_string()).unwrap();

        assert_eq!(unsafe { item.as_ref() }, "pooled");
        assert!(pool.is_from(item));
        unsafe { pool.destroy(item) };
    }

    #[test]
    fn destroy_drops_value_once_and_recycles_chunk() {
        let drops = Rc::new(Cell::new(0));
        let mut pool = SegregatedPool::<DropCounter>::new(nz!(4), None);

        let item = pool
            .construct_with(|| DropCounter {
                drops: Rc::clone(&drops),
            })
            .unwrap();
        unsafe { pool.destroy(item) };

        assert_eq!(drops.get(), 1);
        assert_eq!(pool.free_count(), pool.capacity());

        let again = pool
            .construct_with(|| DropCounter {
                drops: Rc::clone(&drops),
            })
            .unwrap();
        assert_eq!(again, item);

        unsafe { pool.destroy(again) };
        assert_eq!(drops.get(), 2);
    }

    #[test]
    fn construct_destroy_cycles_restore_free_head() {
        let mut pool = SegregatedPool::<u64>::new(nz!(4), None);

        // Acquire the first slab so that the cycles below only touch the free list.
        let warmup = pool.construct().unwrap();
        unsafe { pool.destroy(warmup) };

        let head_before = pool.raw.free_head();

        for _ in 0..100 {
            let item = pool.construct().unwrap();
            unsafe { pool.destroy(item) };
        }

        assert_eq!(pool.raw.free_head(), head_before);
        assert_eq!(pool.slab_count(), 1);
    }

    #[test]
    fn destroy_returns_chunk_even_if_drop_panics() {
        let mut pool = SegregatedPool::<PanicOnDrop>::new(nz!(4), None);
        let item = pool.construct_with(|| PanicOnDrop).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| unsafe { pool.destroy(item) }));

        assert!(result.is_err());
        assert_eq!(pool.free_count(), pool.capacity());
    }

    #[test]
    fn failed_initializer_returns_chunk() {
        let mut pool = SegregatedPool::<u64>::new(nz!(4), None);

        let result = pool.try_construct_with(|| Err::<u64, _>("nope"));

        assert!(matches!(result, Err(ConstructError::Initialization("nope"))));
        assert_eq!(pool.free_count(), pool.capacity());
    }

    #[test]
    fn panicking_initializer_returns_chunk() {
        let mut pool = SegregatedPool::<u64>::new(nz!(4), None);

        let result = catch_unwind(AssertUnwindSafe(|| {
            pool.construct_with(|| panic!("initializer panicked"))
        }));

        assert!(result.is_err());
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn allocation_failure_skips_initializer() {
        let memory = FakeMemory::new();
        memory.set_refuse_all(true);
        let mut pool = fake_pool::<u64>(&memory);

        let called = Cell::new(false);
        let result = pool.try_construct_with(|| {
            called.set(true);
            Ok::<_, ()>(1)
        });

        assert!(matches!(
            result,
            Err(ConstructError::Allocation(Error::SlabAllocationFailed { .. }))
        ));
        assert!(!called.get());

        assert!(matches!(
            pool.construct(),
            Err(Error::SlabAllocationFailed { .. })
        ));
    }

    #[test]
    fn allocate_returns_uninit_memory_for_item() {
        let mut pool = SegregatedPool::<u128>::new(nz!(4), None);

        let slot = pool.allocate().unwrap();
        unsafe { slot.as_ptr().write(MaybeUninit::new(7)) };

        assert_eq!(slot.addr().get() % align_of::<u128>(), 0);
        assert_eq!(unsafe { slot.as_ref().assume_init() }, 7);

        unsafe { pool.deallocate(slot) };
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn purge_does_not_drop_live_values() {
        let drops = Rc::new(Cell::new(0));
        let memory = FakeMemory::new();
        let mut pool = fake_pool::<DropCounter>(&memory);

        pool.construct_with(|| DropCounter {
            drops: Rc::clone(&drops),
        })
        .unwrap();

        assert!(pool.purge_memory());
        assert_eq!(drops.get(), 0);
        assert_eq!(memory.outstanding(), 0);
    }

    #[test]
    fn shrink_keeps_slabs_with_live_values() {
        let memory = FakeMemory::new();
        let mut pool = fake_pool::<u64>(&memory);

        let items: Vec<_> = (0..5_u64)
            .map(|value| pool.construct_with(|| value).unwrap())
            .collect();

        // The first four values fill the first slab, the fifth lives in the second.
        for item in &items[..4] {
            unsafe { pool.destroy(*item) };
        }

        assert!(pool.shrink_memory());
        assert_eq!(pool.slab_count(), 1);
        assert_eq!(unsafe { items[4].read() }, 4);

        unsafe { pool.destroy(items[4]) };
    }

    #[test]
    fn new_applies_settings() {
        let pool = SegregatedPool::<u32>::new(nz!(3), Some(nz!(9)));

        assert_eq!(pool.chunk_count(), nz!(3));
        assert_eq!(pool.max_chunk_count(), Some(nz!(9)));
        assert!(pool.chunk_size() >= size_of::<u32>());
        assert!(pool.max_chunks() >= nz!(9));
    }

    #[test]
    fn debug_names_item_type() {
        let pool = SegregatedPool::<u64>::new(nz!(4), None);

        assert!(format!("{pool:?}").contains("u64"));
    }
}
