//! Bitmap-based fixed-size page allocator (Module C).
//!
//! Hands out 1..=64 contiguous pages out of a contiguous arena,
//! identified by a page index. This is the process-local form, used
//! directly by tests/benchmarks and as the allocator backing a
//! standalone append collection. The shared-memory form lives in
//! [`crate::smm`], which reuses the exact same [`crate::bitmap`]
//! algorithms over slices borrowed from a memory-mapped file instead of
//! from an owned `Vec`.

use crate::bitmap::OwnedBitmap;
use crate::error::{CoreError, CoreResult};
use crate::stats::Stats;
use std::sync::atomic::{AtomicU32, Ordering};

/// A contiguous byte view returned by the page allocator. Segments are
/// ephemeral: they do not own memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: usize,
    pub len: usize,
}

impl Segment {
    pub fn empty() -> Self {
        Segment { base: 0, len: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Packs `(span_len: u16, ref_count: u16)` into one `u32`, matching the
/// page directory entry shape this allocator tracks alongside the bitmap.
fn pack_dir(span_len: u16, ref_count: u16) -> u32 {
    ((span_len as u32) << 16) | ref_count as u32
}

fn unpack_dir(word: u32) -> (u16, u16) {
    ((word >> 16) as u16, word as u16)
}

pub struct PageAllocator {
    arena: Vec<u8>,
    base: usize,
    page_size: u32,
    capacity: u32,
    bitmap: OwnedBitmap,
    directory: Vec<AtomicU32>,
    stats: Stats,
}

impl PageAllocator {
    pub fn new(page_size: u32, capacity: u32) -> CoreResult<Self> {
        let total = page_size as usize * capacity as usize;
        let mut arena = vec![0u8; total];
        let base = arena.as_mut_ptr() as usize;
        let directory = (0..capacity).map(|_| AtomicU32::new(0)).collect();
        let stats = Stats::default();
        stats.reserved.bump(total as i64);
        stats.committed.bump(total as i64);
        Ok(PageAllocator {
            arena,
            base,
            page_size,
            capacity,
            bitmap: OwnedBitmap::new(capacity as usize),
            directory,
            stats,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Allocate `n` (1..=64) consecutive pages. Returns
    /// `InvalidAllocationSize` if `n` is out of range, or `OutOfMemory`
    /// if no free run of that length exists.
    pub fn allocate_pages(&self, n: u8) -> CoreResult<Segment> {
        if !(1..=64).contains(&n) {
            return Err(CoreError::InvalidAllocationSize(n as usize));
        }
        let view = self.bitmap.view();
        loop {
            let start = match view.find_free_range(n as usize) {
                Some(s) => s,
                None => return Err(CoreError::OutOfMemory),
            };
            if view.try_claim_range(start, n as usize) {
                self.directory[start].store(pack_dir(n as u16, 1), Ordering::Release);
                self.stats.pages.bump(n as i64);
                self.stats.committed.bump(0); // already committed up front
                let seg = Segment {
                    base: self.base + start * self.page_size as usize,
                    len: n as usize * self.page_size as usize,
                };
                return Ok(seg);
            }
            // lost the race to another allocator; rescan.
        }
    }

    /// Add a reference to the allocation starting at `segment.base`.
    pub fn add_ref(&self, segment: Segment) {
        let idx = self.index_of(segment.base);
        let prev = self.directory[idx].fetch_add(1, Ordering::AcqRel);
        let (_, rc) = unpack_dir(prev);
        debug_assert!(rc > 0, "add_ref on a free page entry");
    }

    /// Decrement the reference count of the allocation starting at
    /// `segment.base`; on reaching zero, clears the backing bits and the
    /// directory entry. Returns `false` if `segment` does not begin a
    /// live allocation (idempotence: a second `free_pages` call on an
    /// already-freed segment returns `false` with no effect).
    pub fn free_pages(&self, segment: Segment) -> bool {
        if segment.base < self.base || segment.base >= self.base + self.arena.len() {
            return false;
        }
        let idx = self.index_of(segment.base);
        let word = self.directory[idx].load(Ordering::Acquire);
        let (span_len, ref_count) = unpack_dir(word);
        if ref_count == 0 {
            return false;
        }
        let new_rc = ref_count - 1;
        let updated = pack_dir(span_len, new_rc);
        if self.directory[idx]
            .compare_exchange(word, updated, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Someone else is concurrently mutating the same entry;
            // the free-on-zero race is resolved by whichever decrement
            // observes zero.
            return self.free_pages(segment);
        }
        if new_rc == 0 {
            self.bitmap.view().clear_range(idx, span_len as usize);
            self.directory[idx].store(0, Ordering::Release);
            self.stats.pages.bump(-(span_len as i64));
        }
        true
    }

    /// 20-bit-friendly opaque id for a live allocation's starting page,
    /// used by callers (e.g. GPMM's large-block cache) that need a
    /// compact handle rather than a full `Segment`.
    pub fn to_block_id(&self, segment: Segment) -> u32 {
        self.index_of(segment.base) as u32
    }

    pub fn from_block_id(&self, id: u32) -> Segment {
        let idx = id as usize;
        let word = self.directory[idx].load(Ordering::Acquire);
        let (span_len, ref_count) = unpack_dir(word);
        if ref_count == 0 {
            return Segment::empty();
        }
        Segment {
            base: self.base + idx * self.page_size as usize,
            len: span_len as usize * self.page_size as usize,
        }
    }

    fn index_of(&self, addr: usize) -> usize {
        (addr - self.base) / self.page_size as usize
    }

    /// Total bits currently marked allocated (used by property tests to
    /// cross-check against the sum of live directory span lengths).
    pub fn live_bit_count(&self) -> usize {
        self.bitmap.view().count_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_and_reuse_at_freed_id() {
        // Exhaust the arena, free one page, and confirm the freed id is
        // the one reused.
        let pa = PageAllocator::new(4096, 10).unwrap();
        let mut segs = vec![];
        for _ in 0..10 {
            segs.push(pa.allocate_pages(1).unwrap());
        }
        assert!(matches!(
            pa.allocate_pages(1),
            Err(CoreError::OutOfMemory)
        ));
        let freed_id = pa.to_block_id(segs[5]);
        assert!(pa.free_pages(segs[5]));
        let reused = pa.allocate_pages(1).unwrap();
        assert_eq!(pa.to_block_id(reused), freed_id);
    }

    #[test]
    fn double_free_is_idempotent() {
        let pa = PageAllocator::new(4096, 4).unwrap();
        let seg = pa.allocate_pages(2).unwrap();
        assert!(pa.free_pages(seg));
        assert!(!pa.free_pages(seg));
    }

    #[test]
    fn block_id_roundtrip() {
        let pa = PageAllocator::new(4096, 64).unwrap();
        let seg = pa.allocate_pages(5).unwrap();
        let id = pa.to_block_id(seg);
        let back = pa.from_block_id(id);
        assert_eq!(seg, back);
    }

    #[test]
    fn invalid_span_length_rejected() {
        let pa = PageAllocator::new(4096, 10).unwrap();
        assert!(matches!(
            pa.allocate_pages(0),
            Err(CoreError::InvalidAllocationSize(_))
        ));
        assert!(matches!(
            pa.allocate_pages(65),
            Err(CoreError::InvalidAllocationSize(_))
        ));
    }

    #[test]
    fn bitmap_tracks_sum_of_live_spans() {
        let pa = PageAllocator::new(4096, 64).unwrap();
        let a = pa.allocate_pages(3).unwrap();
        let b = pa.allocate_pages(10).unwrap();
        assert_eq!(pa.live_bit_count(), 13);
        pa.free_pages(a);
        assert_eq!(pa.live_bit_count(), 10);
        pa.free_pages(b);
        assert_eq!(pa.live_bit_count(), 0);
    }
}
