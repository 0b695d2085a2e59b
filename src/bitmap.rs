//! Lock-free bitfield primitives (Module A).
//!
//! Backs both the page allocator (Module C) and the unmanaged data
//! store's per-page slot bitmaps (Module H). Every mutation is a
//! per-64-bit-word compare-and-swap; there is no global lock anywhere
//! in this module (the bitmap of pages is mutated
//! by lock-free CAS per 64-bit word").

use std::sync::atomic::{AtomicU64, Ordering};

/// A fixed-length, heap- or mapped-memory-backed bitfield of atomic
/// words. Does not own its storage: `BitmapView` borrows a slice of
/// `AtomicU64`, so the same algorithms serve a `Vec<AtomicU64>`-backed
/// process-local page allocator and a `&[AtomicU64]` slice carved out of
/// a memory-mapped file for the SMM variant.
pub struct BitmapView<'a> {
    words: &'a [AtomicU64],
    bit_len: usize,
}

impl<'a> BitmapView<'a> {
    /// `bit_len` is the logical number of usable bits; any bits in the
    /// final word beyond `bit_len` are expected to already be pre-set
    /// (a sentinel span) so scans never return an
    /// out-of-range index.
    pub fn new(words: &'a [AtomicU64], bit_len: usize) -> Self {
        debug_assert!(bit_len <= words.len() * 64);
        BitmapView { words, bit_len }
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// Mark any bits at or beyond `bit_len` as permanently set, so a
    /// scan never hands out a partially-mapped tail. Call once at
    /// construction.
    pub fn seal_tail(&self) {
        let used_bits_in_last_word = self.bit_len % 64;
        if used_bits_in_last_word == 0 {
            return;
        }
        let last = self.bit_len / 64;
        if last >= self.words.len() {
            return;
        }
        let mask = !0u64 << used_bits_in_last_word;
        self.words[last].fetch_or(mask, Ordering::AcqRel);
    }

    /// Word-at-a-time scan for `n` (1..=64) consecutive clear bits.
    /// Returns the starting bit index, or `None` if no free range of
    /// that length exists. Does not claim the bits; callers must follow
    /// up with [`try_claim_range`](Self::try_claim_range) and retry the
    /// scan on CAS failure.
    pub fn find_free_range(&self, n: usize) -> Option<usize> {
        debug_assert!((1..=64).contains(&n));
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for (word_idx, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            for bit in 0..64 {
                let global = word_idx * 64 + bit;
                if global >= self.bit_len {
                    return None;
                }
                let is_set = (bits >> bit) & 1 == 1;
                if is_set {
                    run_len = 0;
                } else {
                    if run_len == 0 {
                        run_start = global;
                    }
                    run_len += 1;
                    if run_len >= n {
                        return Some(run_start);
                    }
                }
            }
            let _ = &mut bits; // silence unused-mut across edition lints
        }
        None
    }

    /// Attempt to set bits `[start, start+n)`. All-or-nothing: on
    /// partial failure (another thread raced us), the bits already set
    /// by this call are rolled back with a compensating clear before
    /// returning `false`. There is no cross-word atomic transaction
    /// primitive, so this rollback is how all-or-nothing is achieved.
    pub fn try_claim_range(&self, start: usize, n: usize) -> bool {
        debug_assert!((1..=64).contains(&n));
        debug_assert!(start + n <= self.bit_len);
        let mut claimed = 0usize;
        for i in 0..n {
            let global = start + i;
            let word_idx = global / 64;
            let bit = global % 64;
            let mask = 1u64 << bit;
            let prev = self.words[word_idx].fetch_or(mask, Ordering::AcqRel);
            if prev & mask != 0 {
                // Collided with a concurrent claim. Roll back everything
                // we set so far and report failure.
                self.clear_range(start, claimed);
                return false;
            }
            claimed += 1;
        }
        true
    }

    /// Clear bits `[start, start+n)` unconditionally.
    pub fn clear_range(&self, start: usize, n: usize) {
        for i in 0..n {
            let global = start + i;
            let word_idx = global / 64;
            let bit = global % 64;
            self.words[word_idx].fetch_and(!(1u64 << bit), Ordering::AcqRel);
        }
    }

    /// Find and claim a single bit, returning its index. Used by the
    /// data store's per-page entry bitmap.
    pub fn find_and_claim_one(&self) -> Option<usize> {
        loop {
            let idx = self.find_free_range(1)?;
            if self.try_claim_range(idx, 1) {
                return Some(idx);
            }
            // Lost the race; rescan.
        }
    }

    pub fn find_first_set(&self) -> Option<usize> {
        for (word_idx, word) in self.words.iter().enumerate() {
            let bits = word.load(Ordering::Acquire);
            if bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                let global = word_idx * 64 + bit;
                if global < self.bit_len {
                    return Some(global);
                }
            }
        }
        None
    }

    pub fn is_set(&self, index: usize) -> bool {
        debug_assert!(index < self.bit_len);
        let word_idx = index / 64;
        let bit = index % 64;
        (self.words[word_idx].load(Ordering::Acquire) >> bit) & 1 == 1
    }

    pub fn count_set(&self) -> usize {
        let mut total = 0usize;
        for i in 0..self.bit_len {
            if self.is_set(i) {
                total += 1;
            }
        }
        total
    }
}

/// Owning convenience wrapper for process-local (heap-backed) bitmaps.
pub struct OwnedBitmap {
    words: Vec<AtomicU64>,
    bit_len: usize,
}

impl OwnedBitmap {
    pub fn new(bit_len: usize) -> Self {
        let word_count = bit_len.div_ceil(64).max(1);
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        let bitmap = OwnedBitmap { words, bit_len };
        bitmap.view().seal_tail();
        bitmap
    }

    pub fn view(&self) -> BitmapView<'_> {
        BitmapView::new(&self.words, self.bit_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_clear_roundtrip() {
        let bm = OwnedBitmap::new(128);
        let v = bm.view();
        let idx = v.find_free_range(10).unwrap();
        assert!(v.try_claim_range(idx, 10));
        assert_eq!(v.count_set(), 10);
        v.clear_range(idx, 10);
        assert_eq!(v.count_set(), 0);
    }

    #[test]
    fn tail_bits_are_sealed() {
        // 70 logical bits -> 2 words, top 58 bits of the 2nd word must
        // be pre-set so a 64-wide scan never returns index >= 70. Claim
        // the first 64 bits so only the real tail (64..70) is left free;
        // sealing must then block any run from reaching past bit 70.
        let bm = OwnedBitmap::new(70);
        let v = bm.view();
        assert!(v.try_claim_range(0, 64));
        assert_eq!(v.find_free_range(6), Some(64));
        assert!(v.try_claim_range(64, 6));
        assert!(v.find_free_range(1).is_none());
    }

    #[test]
    fn concurrent_claims_are_disjoint() {
        use std::sync::Arc;
        let bm = Arc::new(OwnedBitmap::new(64 * 8));
        let mut handles = vec![];
        for _ in 0..8 {
            let bm = Arc::clone(&bm);
            handles.push(std::thread::spawn(move || {
                let v = bm.view();
                v.find_and_claim_one().unwrap()
            }));
        }
        let mut indices: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 8);
    }
}
