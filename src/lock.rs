//! Exclusive and shared access control built on an integer word
//! (Module B).
//!
//! None of these are `std::sync::Mutex`: SMM's allocator-page lock must
//! live inside a memory-mapped file, shared by multiple OS processes
//! that have no relationship to each other's address space, so the
//! control word has to be relocatable plain data, not an OS mutex
//! handle. GPMM's `SpinLock` reuses the same shape purely so the two
//! allocators' hot paths look alike.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

thread_local! {
    /// A small per-thread integer, assigned once and reused for the
    /// lifetime of the thread. A fast per-thread integer like this is
    /// usually read off a TLS register directly; std exposes no such
    /// integer for `ThreadId`, so a counter is handed out lazily instead.
    static THREAD_NONCE: u32 = next_thread_nonce();
}

fn next_thread_nonce() -> u32 {
    static COUNTER: AtomicU32 = AtomicU32::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A small, fast, process-unique integer for the calling thread. Never
/// zero (zero means "unlocked").
pub fn thread_nonce() -> u32 {
    THREAD_NONCE.with(|n| *n)
}

const SPIN_ITERS_BEFORE_YIELD: u32 = 64;

/// CAS-based exclusive spin lock for single-process use (GPMM). The
/// control word is `0` when unlocked, or the owning thread's nonce.
#[derive(Default)]
pub struct SpinLock {
    owner: AtomicU32,
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.owner.store(0, Ordering::Release);
    }
}

impl SpinLock {
    pub fn new() -> Self {
        SpinLock {
            owner: AtomicU32::new(0),
        }
    }

    /// Acquire, spinning with exponential backoff, then yielding to the
    /// scheduler once the spin budget is exhausted.
    pub fn lock(&self) -> SpinGuard<'_> {
        let me = thread_nonce();
        let mut spins: u32 = 0;
        loop {
            if self
                .owner
                .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinGuard { lock: self };
            }
            spins += 1;
            if spins < SPIN_ITERS_BEFORE_YIELD {
                for _ in 0..(1u32 << spins.min(6)) {
                    std::hint::spin_loop();
                }
            } else {
                std::thread::yield_now();
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }
}

/// Cross-process exclusive lock. The control word packs
/// `(process_id: u32) << 32 | (thread_nonce: u32)` so a competing
/// attacher can tell whether the recorded owner process is still alive.
///
/// Crash recovery for a cross-process session lock works as follows,
/// written up in `DESIGN.md`: on acquisition timeout, the
/// next entrant checks whether the owning pid still exists; if not, it
/// force-clears the word (since a crashed process cannot have left the
/// protected data in a worse state than "partially updated", which the
/// caller must already tolerate for any crash mid-critical-section) and
/// retries once.
#[repr(transparent)]
pub struct CrossProcessLock {
    word: AtomicU64,
}

impl Default for CrossProcessLock {
    fn default() -> Self {
        Self::new()
    }
}

impl CrossProcessLock {
    pub fn new() -> Self {
        CrossProcessLock {
            word: AtomicU64::new(0),
        }
    }

    fn pack(pid: u32, nonce: u32) -> u64 {
        ((pid as u64) << 32) | nonce as u64
    }

    fn unpack(word: u64) -> (u32, u32) {
        ((word >> 32) as u32, word as u32)
    }

    /// Acquire with a timeout. Returns `None` if the timeout elapses
    /// even after a stale-owner reclaim attempt.
    pub fn lock_timeout(&self, timeout: Duration) -> Option<CrossProcessGuard<'_>> {
        let me = Self::pack(std::process::id(), thread_nonce());
        let deadline = Instant::now() + timeout;
        let mut probed_stale = false;
        loop {
            if self
                .word
                .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(CrossProcessGuard { lock: self });
            }
            if Instant::now() >= deadline {
                if probed_stale {
                    return None;
                }
                probed_stale = true;
                let current = self.word.load(Ordering::Acquire);
                if current == 0 {
                    continue;
                }
                let (owner_pid, _) = Self::unpack(current);
                if !process_is_alive(owner_pid) {
                    log::warn!(
                        "cross-process lock: reclaiming stale lock held by dead pid {owner_pid}"
                    );
                    // Force-clear only if nobody else has since taken it.
                    let _ = self.word.compare_exchange(
                        current,
                        0,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                    continue;
                }
                return None;
            }
            std::thread::yield_now();
        }
    }
}

pub struct CrossProcessGuard<'a> {
    lock: &'a CrossProcessLock,
}

impl Drop for CrossProcessGuard<'_> {
    fn drop(&mut self) {
        self.lock.word.store(0, Ordering::Release);
    }
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // `kill(pid, 0)` performs no signal delivery, only existence/
    // permission checks.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 || errno::errno().0 != libc::ESRCH }
}

#[cfg(windows)]
fn process_is_alive(pid: u32) -> bool {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::OpenProcess;
    use winapi::um::winnt::PROCESS_QUERY_LIMITED_INFORMATION;
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            false
        } else {
            CloseHandle(handle);
            true
        }
    }
}

const WRITER_BIT: u64 = 1 << 63;
const READER_MASK: u64 = WRITER_BIT - 1;

/// Reader-count + writer-bit word, used by the resource locator and
/// block referential's "many readers, rare writer" lookups.
#[derive(Default)]
pub struct RwWord {
    word: AtomicU64,
}

pub struct ReadGuard<'a> {
    lock: &'a RwWord,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.word.fetch_sub(1, Ordering::Release);
    }
}

pub struct WriteGuard<'a> {
    lock: &'a RwWord,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.word.store(0, Ordering::Release);
    }
}

impl RwWord {
    pub fn new() -> Self {
        RwWord {
            word: AtomicU64::new(0),
        }
    }

    pub fn read(&self) -> ReadGuard<'_> {
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if cur & WRITER_BIT != 0 {
                std::hint::spin_loop();
                continue;
            }
            if self
                .word
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return ReadGuard { lock: self };
            }
        }
    }

    pub fn write(&self) -> WriteGuard<'_> {
        loop {
            if self
                .word
                .compare_exchange_weak(0, WRITER_BIT, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return WriteGuard { lock: self };
            }
            std::thread::yield_now();
        }
    }

    pub fn reader_count(&self) -> u64 {
        self.word.load(Ordering::Acquire) & READER_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn spin_lock_mutual_exclusion() {
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = lock.lock();
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }

    #[test]
    fn rw_word_allows_concurrent_reads() {
        let rw = RwWord::new();
        let g1 = rw.read();
        let g2 = rw.read();
        assert_eq!(rw.reader_count(), 2);
        drop(g1);
        drop(g2);
        assert_eq!(rw.reader_count(), 0);
        let _w = rw.write();
    }

    #[test]
    fn cross_process_lock_self_roundtrip() {
        let lock = CrossProcessLock::new();
        {
            let _g = lock.lock_timeout(Duration::from_millis(100)).unwrap();
        }
        let _g2 = lock.lock_timeout(Duration::from_millis(100)).unwrap();
    }
}
