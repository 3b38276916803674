#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A growable pool of fixed-size memory chunks that keeps all of its bookkeeping inside the
//! memory it manages.
//!
//! The pool obtains memory from the system allocator in slabs and splits each slab into
//! equally sized chunks. Free chunks are linked together through their own bytes (a
//! segregated free list) and slabs are linked together through a small trailer at the end of
//! each slab, so the pool needs no side allocations at all. Allocating and deallocating a chunk
//! is a constant-time pointer swap.
//!
//! When the pool runs out of free chunks, it acquires a new slab holding twice as many chunks
//! as the previous one, optionally up to a cap. If the system allocator refuses a large slab,
//! the pool retries once with a slab of half the size.
//!
//! Two flavors are provided:
//!
//! - [`RawSegregatedPool`] hands out raw chunks for an item layout chosen at runtime.
//! - [`SegregatedPool<T>`] hands out memory for values of `T` and can also construct and destroy
//!   the values for you.
//!
//! Memory is only returned to the system allocator on request, via `purge_memory()` (release
//! everything) or `shrink_memory()` (release slabs with no chunks in use), or when the pool is
//! dropped.
//!
//! # Examples
//!
//! Raw chunks for a runtime layout:
//!
//! ```rust
//! use std::alloc::Layout;
//!
//! use segregated_pool::RawSegregatedPool;
//!
//! let mut pool = RawSegregatedPool::builder()
//!     .layout(Layout::from_size_align(48, 16).unwrap())
//!     .build();
//!
//! let a = pool.allocate()?;
//! let b = pool.allocate()?;
//! assert_ne!(a, b);
//! assert!(pool.is_from(a));
//!
//! // SAFETY: Both chunks came from this pool and are not used after this point.
//! unsafe {
//!     pool.deallocate(a);
//!     pool.deallocate(b);
//! }
//!
//! // Every slab is now idle, so shrinking releases all of them.
//! assert!(pool.shrink_memory());
//! assert_eq!(pool.slab_count(), 0);
//! # Ok::<(), segregated_pool::Error>(())
//! ```
//!
//! Typed values with bounded slab growth:
//!
//! ```rust
//! use new_zealand::nz;
//! use segregated_pool::SegregatedPool;
//!
//! let mut pool = SegregatedPool::<Vec<u8>>::new(nz!(8), Some(nz!(64)));
//!
//! let mut buffer = pool.construct_with(|| vec![1, 2, 3])?;
//!
//! // SAFETY: The value is alive and nobody else refers to it.
//! let values = unsafe { buffer.as_mut() };
//! values.push(4);
//! assert_eq!(values.len(), 4);
//!
//! // SAFETY: The value came from this pool, is alive and is not used after this point.
//! unsafe { pool.destroy(buffer) };
//! # Ok::<(), segregated_pool::Error>(())
//! ```
//!
//! # Logging
//!
//! The pool emits [`tracing`](https://docs.rs/tracing) events: slab acquisition and release
//! at debug level, growth decisions at trace level.

mod builder;
mod chunk_layout;
mod error;
mod free_list;
mod pal;
mod pool;
mod raw_builder;
mod raw_pool;
mod slab;

pub use builder::*;
pub(crate) use chunk_layout::*;
pub use error::{ConstructError, Error};
pub(crate) use error::Result;
pub(crate) use free_list::*;
pub use pool::SegregatedPool;
pub use raw_builder::*;
pub use raw_pool::{DEFAULT_CHUNK_COUNT, RawSegregatedPool};
pub(crate) use slab::*;
