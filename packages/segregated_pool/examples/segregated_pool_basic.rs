//! Demonstrates slab growth, shrinking and purging of a `SegregatedPool`.
//!
//! The example prints a summary of the pool state after each step.

use new_zealand::nz;
use segregated_pool::SegregatedPool;

/// A message record of the kind a network service might allocate and release at a high rate.
#[derive(Debug, Default)]
struct Message {
    id: u64,
    payload: [u8; 32],
}

fn print_state(label: &str, pool: &SegregatedPool<Message>) {
    println!(
        "{label:<28} slabs: {:>2}  capacity: {:>4}  free: {:>4}  next slab: {:>3} chunks",
        pool.slab_count(),
        pool.capacity(),
        pool.free_count(),
        pool.chunk_count()
    );
}

fn main() {
    println!("=== SegregatedPool basics ===");
    println!();

    // Start with 8 chunks per slab and never grow a slab beyond 64 messages.
    let mut pool = SegregatedPool::<Message>::new(nz!(8), Some(nz!(64)));

    println!(
        "Message is {} bytes, each chunk is {} bytes",
        size_of::<Message>(),
        pool.chunk_size()
    );
    print_state("empty pool", &pool);

    let mut messages = Vec::new();

    for id in 0..200 {
        let message = pool
            .construct_with(|| Message {
                id,
                payload: [0xAB; 32],
            })
            .expect("the system allocator should provide memory for a small example");

        messages.push(message);
    }

    print_state("after 200 messages", &pool);

    // Release the messages that live in the newest slabs, keeping the first 24.
    for message in messages.drain(24..) {
        // SAFETY: Every message came from this pool, is alive and is not used again.
        unsafe { pool.destroy(message) };
    }

    print_state("after releasing 176", &pool);

    let released = pool.shrink_memory();
    print_state(&format!("after shrink (released: {released})"), &pool);

    let survivors: Vec<(u64, Option<u8>)> = messages
        .iter()
        .map(|message| {
            // SAFETY: The remaining messages are alive and nobody else refers to them.
            let message = unsafe { message.as_ref() };
            (message.id, message.payload.first().copied())
        })
        .collect();
    println!("surviving messages (id, first payload byte): {survivors:?}");

    for message in messages.drain(..) {
        // SAFETY: Every message came from this pool, is alive and is not used again.
        unsafe { pool.destroy(message) };
    }

    let default_message = pool.construct().expect("memory is available");
    // SAFETY: The message was just constructed and nobody else refers to it.
    println!("default message id: {}", unsafe { default_message.as_ref() }.id);
    // SAFETY: The message came from this pool, is alive and is not used again.
    unsafe { pool.destroy(default_message) };

    pool.purge_memory();
    print_state("after purge", &pool);
}
