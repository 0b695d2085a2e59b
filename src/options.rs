//! Constructor-argument option bundles.
//!
//! Configuration is by constructor argument only: no CLI flags, no
//! environment variables, no global mutable option table consulted
//! mid-flight. Each struct here is a table of tunables with sane
//! defaults, read once at construction time.

/// Tuning knobs for the general-purpose memory manager (Module D).
#[derive(Debug, Clone, Copy)]
pub struct GpmmOptions {
    /// Size of a small-block native arena. Segments above
    /// `small_block_arena_size - header bytes` route to the large path.
    pub small_block_arena_size: usize,
    /// Ceiling on a single large-block native arena.
    pub large_arena_cap: usize,
    /// Largest single segment a small-block allocator will carve
    /// Segments above this size always route to the large-block path.
    pub max_small_segment_size: usize,
    /// Hard ceiling on any single allocation request.
    pub max_segment_size: usize,
    /// Number of block-allocator sequences per hardware concurrency
    /// unit (one per hardware concurrency unit, times four).
    pub sequences_per_cpu: usize,
    /// Frees between defragmentation sweeps of the small-block
    /// allocator's freed list.
    pub defrag_every_n_frees: u32,
    /// Trigger ratio for small-block defragmentation
    /// (`occupied / free < ratio`).
    pub small_defrag_ratio: f64,
    /// Trigger ratio for large-block defragmentation.
    pub large_defrag_ratio: f64,
    /// Debug-only: pattern-fill freed payloads to catch use-after-free.
    pub debug_fill_on_free: bool,
}

impl Default for GpmmOptions {
    fn default() -> Self {
        GpmmOptions {
            small_block_arena_size: 1 << 20, // 1 MiB
            large_arena_cap: 256 << 20,      // 256 MiB
            max_small_segment_size: 64 << 10, // 64 KiB
            max_segment_size: i32::MAX as usize,
            sequences_per_cpu: 4,
            defrag_every_n_frees: 100,
            small_defrag_ratio: 1.0,
            large_defrag_ratio: 0.15,
            debug_fill_on_free: cfg!(debug_assertions),
        }
    }
}

/// Tuning knobs for the shared-memory manager (Module E).
#[derive(Debug, Clone)]
pub struct SmmOptions {
    /// Total size of the backing file, rounded up to a whole number of
    /// pages.
    pub file_size: u64,
    /// Page size used by the page allocator backing this SMM instance.
    pub page_size: u32,
    /// Maximum number of processes that may attach concurrently.
    pub max_session_count: u32,
    /// Truncate the file to the highest still-allocated page when the
    /// last attached process calls dispose.
    pub shrink_on_final_close: bool,
    /// Capacity (slot count) of the resource locator dictionary.
    pub resource_capacity: u32,
    /// Timeout for the cross-process session/registry lock before a
    /// stale-holder probe is attempted.
    pub lock_timeout: std::time::Duration,
}

impl Default for SmmOptions {
    fn default() -> Self {
        SmmOptions {
            file_size: 64 << 20, // 64 MiB
            page_size: 1 << 20,  // 1 MiB default page size
            max_session_count: 64,
            shrink_on_final_close: true,
            resource_capacity: 1024,
            lock_timeout: std::time::Duration::from_secs(60),
        }
    }
}

/// Tuning knobs for a standalone page allocator (Module C), used
/// directly by tests/benchmarks and indirectly by SMM/append
/// collections.
#[derive(Debug, Clone, Copy)]
pub struct PageAllocatorOptions {
    pub page_size: u32,
    pub capacity: u32,
}

impl Default for PageAllocatorOptions {
    fn default() -> Self {
        PageAllocatorOptions {
            page_size: 1 << 20,
            capacity: 64,
        }
    }
}

/// Tuning knobs for the lock-free chunk queue (Module F).
#[derive(Debug, Clone, Copy)]
pub struct ChunkQueueOptions {
    /// Total ring-buffer byte length. Must be `<= 2 GiB`.
    pub buffer_size: u32,
}

impl Default for ChunkQueueOptions {
    fn default() -> Self {
        ChunkQueueOptions {
            buffer_size: 1 << 20,
        }
    }
}

/// Whether large OS pages should be requested for native arenas, and
/// whether secure-mode guard pages are inserted around segments. Kept as
/// a tiny struct rather than a global so callers can vary it per-GPMM-
/// instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsOptions {
    pub large_os_pages: bool,
    pub secure: bool,
}
