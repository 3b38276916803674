use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use crate::pal::MemoryFacade;
use crate::{DEFAULT_CHUNK_COUNT, RawSegregatedPool};

/// Builder for creating an instance of [`RawSegregatedPool`].
///
/// [`RawSegregatedPool`] requires the item memory layout to be specified at construction time.
/// Use either `.layout()` to provide a specific layout or `.layout_of::<T>()` to generate
/// a layout based on the provided type.
///
/// The layout is mandatory, whereas other settings are optional.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
///
/// use segregated_pool::RawSegregatedPool;
///
/// let pool = RawSegregatedPool::builder()
///     .layout(Layout::new::<u32>())
///     .build();
/// ```
///
/// Growing from small slabs, with growth capped at 1024 items worth of memory per slab:
///
/// ```
/// use new_zealand::nz;
/// use segregated_pool::RawSegregatedPool;
///
/// let pool = RawSegregatedPool::builder()
///     .layout_of::<[u8; 24]>()
///     .chunk_count(nz!(8))
///     .max_chunk_count(nz!(1024))
///     .build();
///
/// assert_eq!(pool.chunk_count().get(), 8);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[derive(Debug)]
#[must_use]
pub struct RawSegregatedPoolBuilder {
    item_layout: Option<Layout>,
    chunk_count: NonZero<usize>,
    max_chunk_count: Option<NonZero<usize>>,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl RawSegregatedPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            item_layout: None,
            chunk_count: DEFAULT_CHUNK_COUNT,
            max_chunk_count: None,
            _not_sync: PhantomData,
        }
    }

    /// Sets the memory layout of the items the pool hands out chunks for.
    ///
    /// # Panics
    ///
    /// Panics if the layout has zero size.
    pub fn layout(mut self, layout: Layout) -> Self {
        assert!(
            layout.size() > 0,
            "RawSegregatedPool must have non-zero item size"
        );
        self.item_layout = Some(layout);
        self
    }

    /// Sets the memory layout of the items the pool hands out chunks for, based on a type.
    ///
    /// # Panics
    ///
    /// Panics if the type is zero-sized.
    pub fn layout_of<T>(self) -> Self {
        self.layout(Layout::new::<T>())
    }

    /// Sets the number of chunks in the first slab. Every further slab holds twice as many
    /// chunks as the previous one, up to the growth cap.
    ///
    /// Defaults to [`DEFAULT_CHUNK_COUNT`]. Values that exceed what a single slab can hold or
    /// that exceed the growth cap are reduced accordingly when the pool is built.
    pub fn chunk_count(mut self, chunk_count: NonZero<usize>) -> Self {
        self.chunk_count = chunk_count;
        self
    }

    /// Caps slab growth so that no slab holds more memory than `max_chunk_count` items of the
    /// configured item size.
    ///
    /// By default, slab growth is only limited by the largest slab the system allocator can be
    /// asked for.
    pub fn max_chunk_count(mut self, max_chunk_count: NonZero<usize>) -> Self {
        self.max_chunk_count = Some(max_chunk_count);
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// The pool does not acquire any memory until the first allocation.
    ///
    /// # Panics
    ///
    /// Panics if no layout has been set using either [`layout`](Self::layout) or
    /// [`layout_of`](Self::layout_of).
    #[must_use]
    pub fn build(self) -> RawSegregatedPool {
        let layout = self.item_layout.expect(
            "Layout must be set using .layout() or .layout_of::<T>() before calling .build()",
        );

        RawSegregatedPool::new_inner(
            layout,
            self.chunk_count,
            self.max_chunk_count,
            MemoryFacade::real(),
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;
    use std::thread;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(RawSegregatedPoolBuilder: Send, Debug);
    assert_not_impl_any!(RawSegregatedPoolBuilder: Sync);

    #[test]
    fn new_has_default_settings() {
        let builder = RawSegregatedPoolBuilder::new();

        assert!(builder.item_layout.is_none());
        assert_eq!(builder.chunk_count, DEFAULT_CHUNK_COUNT);
        assert!(builder.max_chunk_count.is_none());
    }

    #[test]
    fn layout_of_matches_layout() {
        let a = RawSegregatedPoolBuilder::new().layout_of::<String>();
        let b = RawSegregatedPoolBuilder::new().layout(Layout::new::<String>());

        assert_eq!(a.item_layout, b.item_layout);
    }

    #[test]
    fn later_layout_wins() {
        let builder = RawSegregatedPoolBuilder::new()
            .layout_of::<u32>()
            .layout_of::<u64>();

        assert_eq!(builder.item_layout, Some(Layout::new::<u64>()));
    }

    #[test]
    #[should_panic]
    fn zero_sized_layout_panics() {
        let _builder = RawSegregatedPoolBuilder::new().layout_of::<()>();
    }

    #[test]
    #[should_panic]
    fn build_without_layout_panics() {
        let _pool = RawSegregatedPoolBuilder::new().build();
    }

    #[test]
    fn build_applies_settings() {
        let pool = RawSegregatedPoolBuilder::new()
            .layout_of::<u64>()
            .chunk_count(nz!(7))
            .max_chunk_count(nz!(100))
            .build();

        assert_eq!(pool.item_layout(), Layout::new::<u64>());
        assert_eq!(pool.chunk_count(), nz!(7));
        assert_eq!(pool.max_chunk_count(), Some(nz!(100)));
        assert_eq!(pool.slab_count(), 0);
    }

    #[test]
    fn build_uses_default_chunk_count() {
        let pool = RawSegregatedPoolBuilder::new().layout_of::<u64>().build();

        assert_eq!(pool.chunk_count(), DEFAULT_CHUNK_COUNT);
        assert_eq!(pool.max_chunk_count(), None);
    }

    #[test]
    fn build_clamps_chunk_count_to_slab_maximum() {
        let pool = RawSegregatedPoolBuilder::new()
            .layout_of::<u64>()
            .chunk_count(NonZero::new(usize::MAX).unwrap())
            .build();

        assert_eq!(pool.chunk_count(), pool.max_chunks());
    }

    #[test]
    fn builder_can_move_between_threads() {
        let builder = RawSegregatedPoolBuilder::new().layout_of::<u64>();

        let pool = thread::spawn(move || builder.build())
            .join()
            .expect("thread completed successfully");

        assert_eq!(pool.item_layout(), Layout::new::<u64>());
    }
}
