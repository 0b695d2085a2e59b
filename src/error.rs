//! Crate-wide error taxonomy.
//!
//! Every fallible core operation returns `Result<T, CoreError>`. The
//! `try_*` family of container accessors (queue, stack, data store)
//! instead return `Option<T>` and never surface `CoreError` for the
//! "nothing there" case — only for genuinely exceptional conditions
//! (corruption, mismatched generation, I/O failure).

use std::fmt;

/// A named error kind, surfaced to callers as a value, never an exit
/// code. Core operations never retry internally; see module docs on
/// each subsystem for the bounded-CAS-loop convergence argument instead.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Requested length is negative (unrepresentable), or exceeds the
    /// allocator's maximum segment size. The `n == 0` case is handled
    /// specially by callers (singleton zero-length block) and never
    /// reaches this variant.
    #[error("invalid allocation size: {0} bytes")]
    InvalidAllocationSize(usize),

    /// The arena could not be grown further (OS allocation failure or
    /// the 256 MiB / platform array cap was hit).
    #[error("out of memory")]
    OutOfMemory,

    /// A data-store handle's generation did not match the slot's
    /// current generation.
    #[error("invalid handle (stale generation)")]
    InvalidHandle,

    /// Debug-only canary check: the padding margin around a payload was
    /// overwritten.
    #[error("block overrun detected at free")]
    BlockOverrun,

    /// Resource-locator insert on an existing key.
    #[error("duplicate key")]
    DuplicateKey,

    /// Strict accessor invoked on an empty queue.
    #[error("queue is empty")]
    EmptyQueue,

    /// Strict accessor invoked on an empty stack.
    #[error("stack is empty")]
    EmptyStack,

    /// A hash-chain collision-count cycle was detected while mutating a
    /// concurrent dictionary (resource locator, block referential).
    #[error("concurrent mutation detected")]
    ConcurrentMutation,

    /// Enqueue deadline elapsed while waiting for buffer space. Returned
    /// as an ordinary value, never as a panic or process abort.
    #[error("buffer full (enqueue deadline elapsed)")]
    BufferFull,

    /// Chunk id outside `[1, 0x1FFE]`, or chunk payload larger than
    /// half the ring buffer.
    #[error("invalid chunk: {0}")]
    InvalidChunk(&'static str),

    /// Underlying file or mapping operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The MMF registry file's magic did not match, or its on-disk
    /// layout is otherwise inconsistent.
    #[error("MMF registry corrupt or wrong version: {0}")]
    Registry(&'static str),

    /// A mapped-file session table had no free slot for a new attacher.
    #[error("session table full")]
    SessionTableFull,
}

/// Thin wrapper so call sites can write `fn f() -> CoreResult<T>`.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// True for conditions a caller may reasonably retry after backing
    /// off (as opposed to a programming error like a bad handle).
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::BufferFull | CoreError::OutOfMemory)
    }
}

/// Debug helper distinguishing a "this should never happen" invariant
/// violation from an ordinary `CoreError`. Only used under
/// `debug_assertions`; release builds never construct this.
#[derive(Debug)]
pub struct InvariantViolation {
    pub what: &'static str,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invariant violated: {}", self.what)
    }
}
