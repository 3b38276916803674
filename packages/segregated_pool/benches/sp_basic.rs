//! Basic benchmarks for the `segregated_pool` crate, with `Box` as a baseline.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::time::Instant;

use alloc_tracker::Allocator;
use criterion::{Criterion, criterion_group, criterion_main};
use new_zealand::nz;
use segregated_pool::{RawSegregatedPool, SegregatedPool};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

type TestItem = usize;
const TEST_VALUE: TestItem = 1024;

/// Enough chunks that the warm benchmarks never need a second slab.
const WARM_BATCH: usize = 1000;

fn entrypoint(c: &mut Criterion) {
    let allocs = alloc_tracker::Session::new();

    let mut group = c.benchmark_group("sp_basic");

    let allocs_op = allocs.operation("build_empty");
    group.bench_function("build_empty", |b| {
        b.iter_custom(|iters| {
            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                drop(black_box(
                    RawSegregatedPool::builder()
                        .layout_of::<TestItem>()
                        .build(),
                ));
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("allocate_cold");
    group.bench_function("allocate_cold", |b| {
        b.iter_custom(|iters| {
            let mut pools = iter::repeat_with(|| {
                RawSegregatedPool::builder()
                    .layout_of::<TestItem>()
                    .build()
            })
            .take(usize::try_from(iters).unwrap())
            .collect::<Vec<_>>();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            // Every pool has to acquire its first slab.
            for pool in &mut pools {
                _ = black_box(pool.allocate().unwrap());
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("allocate_deallocate_warm");
    group.bench_function("allocate_deallocate_warm", |b| {
        b.iter_custom(|iters| {
            let mut pool = RawSegregatedPool::builder()
                .layout_of::<TestItem>()
                .chunk_count(nz!(WARM_BATCH))
                .build();

            // Acquire the slab up front so only free list operations are measured.
            let warmup = pool.allocate().unwrap();
            // SAFETY: The chunk came from this pool and is not used after this point.
            unsafe { pool.deallocate(warmup) };

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                let chunk = black_box(pool.allocate().unwrap());
                // SAFETY: The chunk came from this pool and is not used after this point.
                unsafe { pool.deallocate(chunk) };
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("construct_destroy_batch");
    group.bench_function("construct_destroy_batch", |b| {
        b.iter_custom(|iters| {
            let mut pool = SegregatedPool::<TestItem>::new(nz!(WARM_BATCH), None);
            let mut items = Vec::with_capacity(WARM_BATCH);

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                for _ in 0..WARM_BATCH {
                    items.push(pool.construct_with(|| black_box(TEST_VALUE)).unwrap());
                }

                for item in items.drain(..) {
                    // SAFETY: The item came from this pool, is alive and is not used again.
                    unsafe { pool.destroy(item) };
                }
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("box_batch");
    group.bench_function("box_batch", |b| {
        b.iter_custom(|iters| {
            let mut items = Vec::with_capacity(WARM_BATCH);

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                for _ in 0..WARM_BATCH {
                    items.push(Box::new(black_box(TEST_VALUE)));
                }

                items.clear();
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("shrink_idle");
    group.bench_function("shrink_idle", |b| {
        b.iter_custom(|iters| {
            let mut pools = iter::repeat_with(|| {
                let mut pool = RawSegregatedPool::builder()
                    .layout_of::<TestItem>()
                    .chunk_count(nz!(64))
                    .build();

                let chunks = (0..WARM_BATCH)
                    .map(|_| pool.allocate().unwrap())
                    .collect::<Vec<_>>();

                for chunk in chunks {
                    // SAFETY: The chunk came from this pool and is not used after this point.
                    unsafe { pool.deallocate(chunk) };
                }

                pool
            })
            .take(usize::try_from(iters).unwrap())
            .collect::<Vec<_>>();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for pool in &mut pools {
                black_box(pool.shrink_memory());
            }

            start.elapsed()
        });
    });

    group.finish();

    allocs.print_to_stdout();
}
