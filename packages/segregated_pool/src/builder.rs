use std::marker::PhantomData;
use std::num::NonZero;

use crate::{RawSegregatedPool, RawSegregatedPoolBuilder, SegregatedPool};

/// Builder for creating an instance of [`SegregatedPool<T>`].
///
/// The item layout is derived from `T`, so all settings are optional.
///
/// # Examples
///
/// ```
/// use new_zealand::nz;
/// use segregated_pool::SegregatedPool;
///
/// let pool = SegregatedPool::<[u64; 4]>::builder()
///     .chunk_count(nz!(16))
///     .max_chunk_count(nz!(256))
///     .build();
///
/// assert_eq!(pool.chunk_count().get(), 16);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[derive(Debug)]
#[must_use]
pub struct SegregatedPoolBuilder<T> {
    inner: RawSegregatedPoolBuilder,

    // The builder never holds a T, so its thread mobility does not depend on T.
    _item: PhantomData<fn() -> T>,
}

impl<T> SegregatedPoolBuilder<T> {
    /// # Panics
    ///
    /// Panics if `T` is a zero-sized type.
    pub(crate) fn new() -> Self {
        Self {
            inner: RawSegregatedPool::builder().layout_of::<T>(),
            _item: PhantomData,
        }
    }

    /// Sets the number of chunks in the first slab. Every further slab holds twice as many
    /// chunks as the previous one, up to the growth cap.
    ///
    /// Defaults to [`DEFAULT_CHUNK_COUNT`](crate::DEFAULT_CHUNK_COUNT).
    pub fn chunk_count(mut self, chunk_count: NonZero<usize>) -> Self {
        self.inner = self.inner.chunk_count(chunk_count);
        self
    }

    /// Caps slab growth so that no slab holds more memory than `max_chunk_count` values of `T`.
    pub fn max_chunk_count(mut self, max_chunk_count: NonZero<usize>) -> Self {
        self.inner = self.inner.max_chunk_count(max_chunk_count);
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// The pool does not acquire any memory until the first allocation.
    #[must_use]
    pub fn build(self) -> SegregatedPool<T> {
        SegregatedPool::from_raw(self.inner.build())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::alloc::Layout;
    use std::fmt::Debug;
    use std::rc::Rc;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::DEFAULT_CHUNK_COUNT;

    assert_impl_all!(SegregatedPoolBuilder<u64>: Send, Debug);
    assert_impl_all!(SegregatedPoolBuilder<Rc<u64>>: Send);
    assert_not_impl_any!(SegregatedPoolBuilder<u64>: Sync);

    #[test]
    fn defaults() {
        let pool = SegregatedPoolBuilder::<u64>::new().build();

        assert_eq!(pool.chunk_count(), DEFAULT_CHUNK_COUNT);
        assert_eq!(pool.max_chunk_count(), None);
    }

    #[test]
    fn settings_are_applied() {
        let pool = SegregatedPoolBuilder::<u64>::new()
            .chunk_count(nz!(5))
            .max_chunk_count(nz!(50))
            .build();

        assert_eq!(pool.chunk_count(), nz!(5));
        assert_eq!(pool.max_chunk_count(), Some(nz!(50)));
    }

    #[test]
    fn layout_comes_from_type() {
        let builder = SegregatedPoolBuilder::<[u16; 7]>::new();

        assert_eq!(
            builder.inner.build().item_layout(),
            Layout::new::<[u16; 7]>()
        );
    }

    #[test]
    #[should_panic]
    fn zero_sized_type_panics() {
        let _builder = SegregatedPoolBuilder::<()>::new();
    }
}
