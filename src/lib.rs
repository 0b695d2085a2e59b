//! Low-level memory infrastructure for high-throughput, zero-GC data
//! plumbing and for sharing structured data across processes through
//! memory-mapped files.
//!
//! Four tightly coupled subsystems, leaf modules first:
//!
//! - [`bitmap`] (A) — lock-free bitfield primitives.
//! - [`lock`] (B) — cross-thread and cross-process exclusive/shared locks.
//! - [`page_allocator`] (C) — bitmap-based fixed-size page allocator.
//! - [`gpmm`] (D) — the general-purpose, single-process allocator.
//! - [`smm`] (E) — the shared-memory allocator over a mapped file.
//! - [`chunk_queue`] (F) — the lock-free multi-producer/multi-consumer
//!   chunk queue.
//! - [`block_referential`] (G) — the process-wide allocator index table.
//! - [`data_store`] (H) — the generational, levelled-page record store.
//! - [`mmf_registry`] (I) — the host-wide mapped-file registry.
//! - [`append`] and [`intern`] (J) — the forward-growing arena and its
//!   thin interning facade.
//!
//! `error` and `options` are the ambient configuration and error
//! taxonomy shared by every subsystem above; `os` and `stats` are the
//! native-memory and accounting primitives GPMM and SMM are both built
//! from.

pub mod append;
pub mod bitmap;
pub mod block_referential;
pub mod chunk_queue;
pub mod data_store;
pub mod error;
pub mod gpmm;
pub mod intern;
pub mod lock;
mod os;
pub mod options;
pub mod page_allocator;
pub mod segment_header;
pub mod smm;
pub mod stats;

pub use error::{CoreError, CoreResult};
pub use gpmm::{Gpmm, MemoryBlock};
pub use options::{GpmmOptions, PageAllocatorOptions, SmmOptions};
pub use smm::Smm;
pub use stats::Stats;
