use std::num::NonZero;

use thiserror::Error;

/// Errors that can occur when obtaining chunks from a pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The pool had no free chunk and the system allocator refused to provide a new slab,
    /// both at the intended size and at the reduced size of the retry.
    #[error(
        "the system allocator could not provide a slab of {slab_size} bytes ({chunk_count} chunks of {chunk_size} bytes)"
    )]
    SlabAllocationFailed {
        /// Size in bytes of the last slab requested, including the slab trailer.
        slab_size: usize,

        /// Number of chunks the last requested slab would have held.
        chunk_count: NonZero<usize>,

        /// Size in bytes of each chunk.
        chunk_size: NonZero<usize>,
    },
}

/// Errors that can occur when constructing an item in a pool via a fallible initializer.
///
/// Whichever variant is returned, the pool is left as it was before the call: if a chunk was
/// obtained for the item, it has been returned to the pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConstructError<E> {
    /// No chunk could be obtained for the item.
    #[error(transparent)]
    Allocation(Error),

    /// The initializer failed. The initializer's error is carried unchanged.
    #[error("item initializer failed: {0}")]
    Initialization(E),
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::error::Error as StdError;
    use std::fmt::Debug;

    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);
    assert_impl_all!(ConstructError<String>: Send, Sync, Debug, StdError);

    fn slab_allocation_failed() -> Error {
        Error::SlabAllocationFailed {
            slab_size: 336,
            chunk_count: nz!(40),
            chunk_size: nz!(8),
        }
    }

    #[test]
    fn slab_allocation_failed_describes_request() {
        let message = slab_allocation_failed().to_string();

        assert!(message.contains("336 bytes"));
        assert!(message.contains("40 chunks of 8 bytes"));
    }

    #[test]
    fn construct_error_allocation_is_transparent() {
        let error: ConstructError<String> = ConstructError::Allocation(slab_allocation_failed());

        assert_eq!(error.to_string(), slab_allocation_failed().to_string());
    }

    #[test]
    fn construct_error_carries_initializer_error() {
        let error = ConstructError::Initialization("bad input".to_string());

        assert!(error.to_string().contains("bad input"));
        assert!(matches!(error, ConstructError::Initialization(inner) if inner == "bad input"));
    }
}
