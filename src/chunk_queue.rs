//! Lock-free multi-producer/multi-consumer chunk queue (Module F).
//!
//! A single ring buffer, two cache-line-padded atomic cursors (`read_offset`,
//! `write_offset`), and one 4-byte header per chunk: a 13-bit id, three
//! status bits (ready, acquired, processed), and a 16-bit payload size.
//! Enqueue reserves a range with either a deadline-respecting CAS loop or
//! a single fetch-add; dequeue claims the oldest ready, unacquired chunk
//! with a header CAS, and disposal drains any leading run of fully
//! processed chunks so `read_offset` only ever advances in FIFO order.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A flag an external caller can flip to short-circuit a producer's
/// spin-wait with no side effects, same atomic-bool idiom any
/// broadcast-style shared-memory ring uses for its own cancel signal.
#[derive(Default)]
pub struct CancellationToken(AtomicBool);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(AtomicBool::new(false))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

const HEADER_LEN: usize = 4;
const ALIGN: usize = 16;

const READY_BIT: u16 = 1 << 15;
const ACQUIRED_BIT: u16 = 1 << 14;
const PROCESSED_BIT: u16 = 1 << 13;
const ID_MASK: u16 = 0x1FFF;
const PADDING_ID: u16 = 0x1FFF;

pub const MAX_CHUNK_ID: u16 = 0x1FFE;

fn pack(flags_and_id: u16, size: u16) -> u32 {
    flags_and_id as u32 | ((size as u32) << 16)
}

fn unpack(word: u32) -> (u16, u16) {
    (word as u16, (word >> 16) as u16)
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Outcome of a spin-wait: reached the target condition, hit the
/// deadline, or was cancelled.
enum WaitOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

fn spin_wait(
    mut cond: impl FnMut() -> bool,
    deadline: Option<Instant>,
    cancellation: Option<&CancellationToken>,
) -> WaitOutcome {
    loop {
        if cond() {
            return WaitOutcome::Ready;
        }
        if let Some(token) = cancellation {
            if token.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return WaitOutcome::TimedOut;
            }
        }
        std::thread::yield_now();
    }
}

/// A lock-free ring buffer of variably-sized chunks. `capacity` bytes are
/// allocated up front; the buffer never grows.
pub struct ChunkQueue {
    // Each cursor lives alone in its own cache line so producer and
    // consumer traffic never false-shares.
    read_offset: AtomicU64,
    _pad_read: [u8; 56],
    write_offset: AtomicU64,
    _pad_write: [u8; 56],
    buffer: Box<[u8]>,
    capacity: u64,
}

unsafe impl Sync for ChunkQueue {}

impl ChunkQueue {
    /// `capacity` is rounded up to a multiple of 16 bytes; must not
    /// exceed 2 GiB.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity <= 2 << 30, "chunk queue capacity exceeds 2 GiB");
        let capacity = align_up(capacity.max(ALIGN), ALIGN);
        ChunkQueue {
            read_offset: AtomicU64::new(0),
            _pad_read: [0; 56],
            write_offset: AtomicU64::new(0),
            _pad_write: [0; 56],
            buffer: vec![0u8; capacity].into_boxed_slice(),
            capacity: capacity as u64,
        }
    }

    fn header_word(&self, ring_offset: u64) -> &AtomicU32 {
        let byte_offset = (ring_offset % self.capacity) as usize;
        unsafe { &*(self.buffer.as_ptr().add(byte_offset) as *const AtomicU32) }
    }

    fn payload_ptr(&self, ring_offset: u64) -> *mut u8 {
        let byte_offset = ((ring_offset + HEADER_LEN as u64) % self.capacity) as usize;
        unsafe { (self.buffer.as_ptr() as *mut u8).add(byte_offset) }
    }

    fn total_for(size_bytes: u16) -> u64 {
        align_up(size_bytes as usize + HEADER_LEN, ALIGN) as u64
    }

    /// Write a padding chunk at `offset` covering the remaining bytes to
    /// the next buffer wrap, marked ready-for-dequeue so a consumer skips
    /// over it like any other chunk.
    fn write_padding(&self, offset: u64, span: u64) {
        debug_assert!(span as usize >= HEADER_LEN);
        self.header_word(offset).store(
            pack(PADDING_ID | READY_BIT, (span - HEADER_LEN as u64) as u16),
            Ordering::Release,
        );
    }

    fn distance_to_wrap(&self, offset: u64) -> u64 {
        self.capacity - (offset % self.capacity)
    }

    /// Reserve space for a chunk and return a handle the caller uses to
    /// write its payload; dropping the handle publishes it (sets the
    /// ready bit). Returns `None` on timeout or cancellation (a no-op).
    pub fn enqueue(
        &self,
        chunk_id: u16,
        size_bytes: u16,
        deadline: Option<Duration>,
        cancellation: Option<&CancellationToken>,
    ) -> Option<EnqueueHandle<'_>> {
        assert!(
            (1..=MAX_CHUNK_ID).contains(&chunk_id),
            "chunk id out of range [1, 0x1FFE]"
        );
        let max_payload = self.capacity as usize / 2 - HEADER_LEN;
        assert!(
            (size_bytes as usize) <= max_payload,
            "chunk payload exceeds half the ring buffer"
        );

        let deadline_instant = deadline.map(|d| Instant::now() + d);
        let mut total = Self::total_for(size_bytes);

        loop {
            let reserved_at = if let Some(deadline_instant) = deadline_instant {
                match self.reserve_with_deadline(total, deadline_instant, cancellation) {
                    Some(at) => at,
                    None => return None,
                }
            } else {
                self.reserve_fast(total)
            };

            let span_to_wrap = self.distance_to_wrap(reserved_at);
            if span_to_wrap < total {
                // The reserved range crosses the wrap boundary: stamp a
                // padding chunk over the remainder of this lap and try
                // again from the fresh lap start.
                self.write_padding(reserved_at, span_to_wrap);
                total = Self::total_for(size_bytes);
                continue;
            }

            let header_offset = reserved_at;
            self.header_word(header_offset)
                .store(pack(chunk_id & ID_MASK, size_bytes), Ordering::Release);
            return Some(EnqueueHandle {
                queue: self,
                header_offset,
                payload_ptr: self.payload_ptr(header_offset),
                len: size_bytes as usize,
            });
        }
    }

    /// Deadline path: CAS `write_offset` forward only once there's room,
    /// respecting cancellation and the deadline.
    fn reserve_with_deadline(
        &self,
        total: u64,
        deadline: Instant,
        cancellation: Option<&CancellationToken>,
    ) -> Option<u64> {
        loop {
            let old_write = self.write_offset.load(Ordering::Acquire);
            let new_write = old_write + total;
            let read = self.read_offset.load(Ordering::Acquire);
            let has_room = new_write.wrapping_sub(read) <= self.capacity;
            if !has_room {
                match spin_wait(
                    || {
                        let read = self.read_offset.load(Ordering::Acquire);
                        new_write.wrapping_sub(read) <= self.capacity
                    },
                    Some(deadline),
                    cancellation,
                ) {
                    WaitOutcome::Ready => continue,
                    WaitOutcome::TimedOut | WaitOutcome::Cancelled => return None,
                }
            }
            if self
                .write_offset
                .compare_exchange_weak(
                    old_write,
                    new_write,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some(old_write);
            }
            if Instant::now() >= deadline {
                return None;
            }
            if let Some(token) = cancellation {
                if token.is_cancelled() {
                    return None;
                }
            }
        }
    }

    /// No-deadline path: a single fetch-add reserves the range
    /// unconditionally, then the caller spin-waits for the consumer to
    /// catch up if it reserved further ahead than the buffer allows.
    fn reserve_fast(&self, total: u64) -> u64 {
        let reserved_at = self.write_offset.fetch_add(total, Ordering::AcqRel);
        let new_write = reserved_at + total;
        let _ = spin_wait(
            || {
                let read = self.read_offset.load(Ordering::Acquire);
                new_write.wrapping_sub(read) <= self.capacity
            },
            None,
            None,
        );
        reserved_at
    }

    /// Claim the oldest ready, unacquired chunk. Returns `None` if the
    /// queue is empty or the head chunk is not yet published.
    pub fn try_dequeue(&self) -> Option<DequeueHandle<'_>> {
        loop {
            let read = self.read_offset.load(Ordering::Acquire);
            let write = self.write_offset.load(Ordering::Acquire);
            if read >= write {
                return None;
            }
            let header = self.header_word(read);
            let word = header.load(Ordering::Acquire);
            let (flags_and_id, size) = unpack(word);
            if flags_and_id & READY_BIT == 0 {
                return None;
            }
            if flags_and_id & ACQUIRED_BIT != 0 {
                return None;
            }
            let claimed = flags_and_id | ACQUIRED_BIT;
            if header
                .compare_exchange_weak(word, pack(claimed, size), Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let id = flags_and_id & ID_MASK;
            if id == PADDING_ID {
                let total = Self::total_for(size);
                let handle = DequeueHandle {
                    queue: self,
                    id,
                    header_offset: read,
                    total,
                    len: 0,
                    disposed: std::cell::Cell::new(false),
                };
                handle.dispose();
                continue;
            }

            let total = Self::total_for(size);
            return Some(DequeueHandle {
                queue: self,
                id,
                header_offset: read,
                total,
                len: size as usize,
                disposed: std::cell::Cell::new(false),
            });
        }
    }

    /// Drain every leading chunk whose processed/acquired/ready bits are
    /// all set and whose header still begins exactly at `read_offset`,
    /// advancing `read_offset` past each one and zeroing its header so a
    /// future producer sees a clean CAS target.
    fn drain_from_read_offset(&self) {
        loop {
            let read = self.read_offset.load(Ordering::Acquire);
            let write = self.write_offset.load(Ordering::Acquire);
            if read >= write {
                return;
            }
            let header = self.header_word(read);
            let word = header.load(Ordering::Acquire);
            let (flags_and_id, size) = unpack(word);
            let all_done = flags_and_id & (READY_BIT | ACQUIRED_BIT | PROCESSED_BIT)
                == (READY_BIT | ACQUIRED_BIT | PROCESSED_BIT);
            if !all_done {
                return;
            }
            let total = Self::total_for(size);
            let span = self.distance_to_wrap(read).min(total);
            unsafe {
                let byte_offset = (read % self.capacity) as usize;
                std::ptr::write_bytes(self.buffer.as_ptr().add(byte_offset) as *mut u8, 0, span as usize);
                if span < total {
                    std::ptr::write_bytes(self.buffer.as_ptr() as *mut u8, 0, (total - span) as usize);
                }
            }
            if self
                .read_offset
                .compare_exchange(read, read + total, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                // Another thread advanced it already (shouldn't happen
                // under the single-disposer-at-a-time contract, but fail
                // safe rather than loop forever).
                return;
            }
        }
    }
}

/// A reserved, not-yet-published chunk. The producer writes its payload
/// through [`EnqueueHandle::payload_mut`], then drops the handle (or
/// calls [`EnqueueHandle::publish`] explicitly) to set the ready bit.
pub struct EnqueueHandle<'q> {
    queue: &'q ChunkQueue,
    header_offset: u64,
    payload_ptr: *mut u8,
    len: usize,
}

impl<'q> EnqueueHandle<'q> {
    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.payload_ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn publish(self) {
        // Drop performs the actual publication; this just makes the
        // call site's intent explicit.
        drop(self)
    }
}

impl Drop for EnqueueHandle<'_> {
    fn drop(&mut self) {
        let header = self.queue.header_word(self.header_offset);
        let word = header.load(Ordering::Acquire);
        let (flags_and_id, size) = unpack(word);
        header.store(pack(flags_and_id | READY_BIT, size), Ordering::Release);
    }
}

/// A claimed chunk. `dispose` must be called (directly or via `Drop`) to
/// mark it processed and allow `read_offset` to advance past it.
pub struct DequeueHandle<'q> {
    queue: &'q ChunkQueue,
    id: u16,
    header_offset: u64,
    total: u64,
    len: usize,
    disposed: std::cell::Cell<bool>,
}

impl<'q> DequeueHandle<'q> {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.queue.payload_ptr(self.header_offset), self.len) }
    }

    /// Mark this chunk processed, then drain any contiguous run of
    /// processed chunks starting at the queue's current `read_offset`.
    pub fn dispose(self) {
        self.dispose_inner();
    }

    fn dispose_inner(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let header = self.queue.header_word(self.header_offset);
        let word = header.load(Ordering::Acquire);
        let (flags_and_id, size) = unpack(word);
        header.store(pack(flags_and_id | PROCESSED_BIT, size), Ordering::Release);
        self.queue.drain_from_read_offset();
    }
}

impl Drop for DequeueHandle<'_> {
    fn drop(&mut self) {
        self.dispose_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_dequeue_roundtrip() {
        let q = ChunkQueue::new(1024);
        let mut handle = q.enqueue(1, 5, None, None).unwrap();
        handle.payload_mut().copy_from_slice(b"hello");
        handle.publish();

        let dequeued = q.try_dequeue().unwrap();
        assert_eq!(dequeued.id(), 1);
        assert_eq!(dequeued.payload(), b"hello");
        dequeued.dispose();
    }

    #[test]
    fn empty_queue_returns_none() {
        let q = ChunkQueue::new(256);
        assert!(q.try_dequeue().is_none());
    }

    #[test]
    fn fifo_order_is_preserved_with_sequential_dispose() {
        // Only one outstanding dequeue handle is supported at a time: the
        // head chunk stays ACQUIRED until disposed, so the next
        // `try_dequeue` must dispose before advancing to the following id.
        let q = ChunkQueue::new(4096);
        for id in 1..=3u16 {
            let mut h = q.enqueue(id, 4, None, None).unwrap();
            h.payload_mut().copy_from_slice(&(id as u32).to_le_bytes());
            h.publish();
        }
        for expected in 1..=3u16 {
            let dequeued = q.try_dequeue().unwrap();
            assert_eq!(dequeued.id(), expected);
            dequeued.dispose();
        }
        assert!(q.try_dequeue().is_none());
    }

    #[test]
    fn second_dequeue_is_blocked_until_first_is_disposed() {
        let q = ChunkQueue::new(4096);
        for id in 1..=2u16 {
            let mut h = q.enqueue(id, 4, None, None).unwrap();
            h.payload_mut().copy_from_slice(&(id as u32).to_le_bytes());
            h.publish();
        }
        let first = q.try_dequeue().unwrap();
        assert_eq!(first.id(), 1);
        // The head is ACQUIRED but not yet disposed; the second chunk is
        // ready but unreachable until the head clears.
        assert!(q.try_dequeue().is_none());
        first.dispose();
        let second = q.try_dequeue().unwrap();
        assert_eq!(second.id(), 2);
        second.dispose();
    }

    #[test]
    fn wraparound_inserts_padding_and_continues() {
        let q = ChunkQueue::new(64);
        // Exhaust most of the buffer so the next enqueue must wrap.
        for id in 1..=2u16 {
            let mut h = q.enqueue(id, 16, None, None).unwrap();
            h.payload_mut().fill(id as u8);
            h.publish();
        }
        let mut h = q.enqueue(3, 8, None, None).unwrap();
        h.payload_mut().fill(3);
        h.publish();

        let a = q.try_dequeue().unwrap();
        assert_eq!(a.id(), 1);
        a.dispose();
        let b = q.try_dequeue().unwrap();
        assert_eq!(b.id(), 2);
        b.dispose();
        let c = q.try_dequeue().unwrap();
        assert_eq!(c.id(), 3);
        c.dispose();
    }

    #[test]
    fn cancellation_short_circuits_enqueue() {
        let q = ChunkQueue::new(32);
        let token = CancellationToken::new();
        token.cancel();
        // Fill the buffer first so the deadline path actually has to wait.
        let h = q.enqueue(1, 16, None, None).unwrap();
        h.publish();
        let result = q.enqueue(2, 16, Some(Duration::from_millis(50)), Some(&token));
        assert!(result.is_none());
    }
}
