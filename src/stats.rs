//! Allocator statistics counters.
//!
//! A four-field running count (allocated/freed/peak/current) with an
//! acquire-fetch-add-then-peak-CAS update, widened from a fixed per-bin
//! array into the general counter set needed to assert
//! `total_allocated + total_free + header_bytes + padding ==
//! total_committed`.

use std::sync::atomic::{AtomicI64, Ordering};

/// A running count with peak tracking: allocated, freed, peak, and
/// current bytes.
#[derive(Debug, Default)]
pub struct StatCount {
    allocated: AtomicI64,
    freed: AtomicI64,
    peak: AtomicI64,
    current: AtomicI64,
}

impl StatCount {
    /// Apply a signed delta (positive = allocated, negative = freed),
    /// updating `current` and `peak` with acquire/release-adjacent
    /// atomics.
    pub fn bump(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let prev = self.current.fetch_add(amount, Ordering::AcqRel);
        let now = prev + amount;
        self.peak.fetch_max(now, Ordering::AcqRel);
        if amount > 0 {
            self.allocated.fetch_add(amount, Ordering::Relaxed);
        } else {
            self.freed.fetch_add(-amount, Ordering::Relaxed);
        }
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Acquire)
    }

    pub fn total_allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn total_freed(&self) -> i64 {
        self.freed.load(Ordering::Relaxed)
    }
}

/// A simple total/count pair, for metrics like "number of free-list
/// searches" where only an average is interesting.
#[derive(Debug, Default)]
pub struct StatCounter {
    total: AtomicI64,
    count: AtomicI64,
}

impl StatCounter {
    pub fn record(&self, value: i64) {
        self.total.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn average(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            self.total.load(Ordering::Relaxed) as f64 / count as f64
        }
    }
}

/// Per-allocator (or per-SMM-instance) statistics block. One instance is
/// shared (by reference) across every arena/allocator belonging to a
/// manager, threaded by reference through every reserve/commit/free
/// call.
#[derive(Debug, Default)]
pub struct Stats {
    pub segments: StatCount,
    pub pages: StatCount,
    pub reserved: StatCount,
    pub committed: StatCount,
    pub reset: StatCount,
    pub page_committed: StatCount,
    pub segments_abandoned: StatCount,
    pub pages_abandoned: StatCount,
    pub mmap_calls: StatCount,
    pub commit_calls: StatCount,
    pub threads: StatCount,
    pub huge: StatCount,
    pub malloc: StatCount,
    pub header_bytes: StatCount,
    pub padding_bytes: StatCount,
    pub searches: StatCounter,
}

impl Stats {
    /// Invariant check used by property tests: the sum of
    /// live allocation bytes, free bytes, header bytes and padding must
    /// equal the total committed arena size.
    pub fn accounting_balances(&self, total_allocated_bytes: i64, total_free_bytes: i64) -> bool {
        let lhs = total_allocated_bytes
            + total_free_bytes
            + self.header_bytes.current()
            + self.padding_bytes.current();
        lhs == self.committed.current()
    }
}
