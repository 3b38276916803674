//! Integration tests for `segregated_pool` against the real system allocator.
//!
//! These tests only use the public API and exercise whole allocation lifecycles: growth over
//! many slabs, interleaved allocation and deallocation, shrinking and purging.
#![allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]

use std::alloc::Layout;
use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use new_zealand::nz;
use segregated_pool::{ConstructError, DEFAULT_CHUNK_COUNT, RawSegregatedPool, SegregatedPool};

/// Deterministic pseudo-random sequence, so failures are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

#[derive(Debug)]
struct Tracked {
    value: u64,
    drops: Arc<AtomicUsize>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn raw_pool_serves_consecutive_chunks() {
    let mut pool = RawSegregatedPool::builder()
        .layout_of::<u64>()
        .chunk_count(nz!(10))
        .max_chunk_count(nz!(1000))
        .build();

    let first = pool.allocate().unwrap();
    let second = pool.allocate().unwrap();

    assert_eq!(
        second.addr().get() - first.addr().get(),
        pool.chunk_size()
    );

    unsafe { pool.deallocate(first) };
    assert_eq!(pool.allocate().unwrap(), first);

    assert!(pool.purge_memory());
    assert_eq!(pool.slab_count(), 0);
    assert!(!pool.purge_memory());
}

#[test]
fn interleaved_allocations_never_overlap() {
    let mut pool = RawSegregatedPool::builder()
        .layout(Layout::from_size_align(24, 8).unwrap())
        .chunk_count(nz!(4))
        .max_chunk_count(nz!(128))
        .build();

    let mut rng = Lcg(0x5EED);
    let mut live: Vec<(NonNull<u8>, u64)> = Vec::new();

    for step in 0..10_000_u64 {
        if live.is_empty() || rng.next() % 3 != 0 {
            let chunk = pool.allocate().unwrap();
            unsafe { chunk.cast::<[u64; 3]>().write([step; 3]) };
            live.push((chunk, step));
        } else {
            let index = usize::try_from(rng.next()).unwrap() % live.len();
            let (chunk, marker) = live.swap_remove(index);

            assert_eq!(unsafe { chunk.cast::<[u64; 3]>().read() }, [marker; 3]);
            unsafe { pool.deallocate(chunk) };
        }
    }

    let unique: HashSet<_> = live.iter().map(|(chunk, _)| *chunk).collect();
    assert_eq!(unique.len(), live.len());

    for (chunk, marker) in &live {
        assert!(pool.is_from(*chunk));
        assert_eq!(unsafe { chunk.cast::<[u64; 3]>().read() }, [*marker; 3]);
    }

    assert_eq!(pool.capacity(), live.len() + pool.free_count());
}

#[test]
fn shrink_returns_idle_slabs_and_keeps_busy_ones() {
    let mut pool = RawSegregatedPool::builder()
        .layout_of::<u32>()
        .chunk_count(nz!(8))
        .max_chunk_count(nz!(8))
        .build();

    let chunks: Vec<_> = (0..64).map(|_| pool.allocate().unwrap()).collect();
    let slabs_before = pool.slab_count();
    assert!(slabs_before >= 2);

    // Keep only the very first chunk in use.
    for chunk in &chunks[1..] {
        unsafe { pool.deallocate(*chunk) };
    }

    assert!(pool.shrink_memory());

    assert_eq!(pool.slab_count(), 1);
    assert!(pool.is_from(chunks[0]));
    assert_eq!(pool.free_count(), pool.capacity() - 1);
    assert!(!pool.shrink_memory());

    unsafe { pool.deallocate(chunks[0]) };
    assert!(pool.shrink_memory());
    assert_eq!(pool.slab_count(), 0);
}

#[test]
fn release_resets_growth() {
    let mut pool = RawSegregatedPool::builder().layout_of::<u64>().build();

    for _ in 0..100 {
        pool.allocate().unwrap();
    }
    assert!(pool.chunk_count() > DEFAULT_CHUNK_COUNT);

    pool.purge_memory();
    assert_eq!(pool.chunk_count(), DEFAULT_CHUNK_COUNT);
}

#[test]
fn typed_pool_runs_destructors_on_destroy_only() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut pool = SegregatedPool::<Tracked>::new(nz!(16), None);

    let items: Vec<_> = (0..50)
        .map(|value| {
            pool.construct_with(|| Tracked {
                value,
                drops: Arc::clone(&drops),
            })
            .unwrap()
        })
        .collect();

    for (expected, item) in items.iter().enumerate() {
        assert_eq!(unsafe { item.as_ref() }.value, expected as u64);
    }

    for item in &items[..25] {
        unsafe { pool.destroy(*item) };
    }
    assert_eq!(drops.load(Ordering::Relaxed), 25);

    for item in &items[25..] {
        unsafe { pool.destroy(*item) };
    }
    assert_eq!(drops.load(Ordering::Relaxed), 50);
    assert_eq!(pool.free_count(), pool.capacity());
}

#[test]
fn failed_construction_leaves_pool_unchanged() {
    let mut pool = SegregatedPool::<String>::new(nz!(4), None);

    let kept = pool.construct_with(|| "kept".to_string()).unwrap();
    let free_before = pool.free_count();

    let result = pool.try_construct_with(|| "x".parse::<u32>().map(|n| n.to_string()));

    assert!(matches!(result, Err(ConstructError::Initialization(_))));
    assert_eq!(pool.free_count(), free_before);

    unsafe { pool.destroy(kept) };
}

/// Carries an item pointer to another thread together with the pool that owns it.
struct SendPtr(NonNull<u64>);

// SAFETY: The pointee is only accessed by whichever thread currently owns the pool.
unsafe impl Send for SendPtr {}

impl SendPtr {
    fn get(self) -> NonNull<u64> {
        self.0
    }
}

#[test]
fn pool_can_move_between_threads() {
    let mut pool = SegregatedPool::<u64>::new(nz!(8), Some(nz!(32)));
    let item = SendPtr(pool.construct_with(|| 42).unwrap());

    let pool = thread::spawn(move || {
        let item = item.get();
        assert_eq!(unsafe { item.read() }, 42);
        unsafe { pool.destroy(item) };
        pool
    })
    .join()
    .unwrap();

    assert_eq!(pool.free_count(), pool.capacity());
}

#[test]
fn assorted_layouts_are_served_aligned() {
    for (size, align) in [(1, 1), (3, 1), (8, 8), (12, 4), (64, 64), (100, 16), (4096, 4096)] {
        let layout = Layout::from_size_align(size, align).unwrap();
        let mut pool = RawSegregatedPool::builder()
            .layout(layout)
            .chunk_count(nz!(3))
            .build();

        assert!(pool.chunk_size() >= size);

        let chunks: Vec<_> = (0..20).map(|_| pool.allocate().unwrap()).collect();
        for chunk in &chunks {
            assert_eq!(chunk.addr().get() % align, 0);
            unsafe { chunk.as_ptr().write_bytes(0xCD, size) };
        }

        for chunk in chunks {
            unsafe { pool.deallocate(chunk) };
        }
        assert_eq!(pool.free_count(), pool.capacity());
    }
}
