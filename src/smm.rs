//! Shared-memory manager (Module E): a cross-process allocator whose
//! only arena is a single memory-mapped file.
//!
//! Everything GPMM keeps in process memory — the allocator's free/
//! occupied lists, its exclusive lock, its high-water mark — has to live
//! inside the file here instead, because a sibling process attaching to
//! the same mapping needs to see the same state. That is the one
//! structural difference from `gpmm.rs`: no `Mutex<SmallState>`, no
//! `SpinLock`, only byte offsets and a [`crate::lock::CrossProcessLock`]
//! embedded directly in the mapped bytes.

use crate::bitmap::BitmapView;
use crate::block_referential::{BlockReferential, Owner};
use crate::error::{CoreError, CoreResult};
use crate::gpmm::MemoryBlock;
use crate::lock::CrossProcessLock;
use crate::options::SmmOptions;
use crate::os;
use crate::segment_header::{LargeHeaderView, LARGE_HEADER_SLOT, NULL_LARGE_ID};
use crate::stats::Stats;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const ROOT_HEADER_FIELD_COUNT: usize = 20;
const ROOT_HEADER_DECLARED_LEN: usize = ROOT_HEADER_FIELD_COUNT * 4; // 80 bytes
/// Our own addition, placed in the slack between the declared 80-byte
/// root header and the 512-byte reserved budget: a real cross-process
/// lock word guarding the session table. The declared `session_info_lock`
/// field (a lone `i32`) is too narrow to hold a `(pid, nonce)` pair, so
/// it is kept as an unused reserved field for byte-layout fidelity and
/// this wider word does the actual work. Recorded in `DESIGN.md`.
const SESSION_LOCK_OFFSET: usize = ROOT_HEADER_DECLARED_LEN;
const ROOT_HEADER_RESERVED_LEN: usize = 512;
const SESSION_TABLE_OFFSET: usize = 512;

/// Byte-exact little-endian view over the first page's root header.
/// Field order matches the declaration exactly; every accessor is a
/// `read_unaligned`/`write_unaligned` of an `i32` at its fixed offset
/// (the file is always mapped at the start of a page, so offset 0 is at
/// least 4-byte aligned and every field offset below is a multiple of 4).
struct RootHeaderView {
    ptr: *mut u8,
}

macro_rules! i32_field {
    ($getter:ident, $setter:ident, $offset:expr) => {
        fn $getter(&self) -> i32 {
            unsafe { (self.ptr.add($offset) as *const i32).read_unaligned() }
        }
        fn $setter(&self, v: i32) {
            unsafe { (self.ptr.add($offset) as *mut i32).write_unaligned(v) }
        }
    };
}

impl RootHeaderView {
    unsafe fn at(ptr: *mut u8) -> Self {
        RootHeaderView { ptr }
    }

    i32_field!(page_size, set_page_size, 0);
    i32_field!(page_capacity, set_page_capacity, 4);
    i32_field!(mmf_id, set_mmf_id, 8);
    i32_field!(max_concurrency, set_max_concurrency, 12);
    i32_field!(offset_session_info, set_offset_session_info, 16);
    i32_field!(max_session_count, set_max_session_count, 20);
    i32_field!(session_info_lock, set_session_info_lock, 24);
    i32_field!(session_count, set_session_count, 28);
    i32_field!(offset_page_bitfield, set_offset_page_bitfield, 32);
    i32_field!(page_bitfield_size, set_page_bitfield_size, 36);
    i32_field!(offset_page_directory, set_offset_page_directory, 40);
    i32_field!(page_directory_size, set_page_directory_size, 44);
    i32_field!(offset_block_allocators, set_offset_block_allocators, 48);
    i32_field!(block_allocators_size, set_block_allocators_size, 52);
    i32_field!(offset_user_data, set_offset_user_data, 56);
    i32_field!(user_data_size, set_user_data_size, 60);
    i32_field!(allocator_robin_counter, set_allocator_robin_counter, 64);
    i32_field!(data_store_page_index, set_data_store_page_index, 68);
    i32_field!(
        resource_locator_dictionary_index,
        set_resource_locator_dictionary_index,
        72
    );
    i32_field!(resource_capacity, set_resource_capacity, 76);

    /// The real session-table lock, not the declared reserved field.
    fn session_lock(&self) -> &CrossProcessLock {
        // SAFETY: `CrossProcessLock` is `#[repr(transparent)]` over one
        // `AtomicU64`; this offset is 8-byte aligned (page-aligned base +
        // a multiple-of-8 offset).
        unsafe { &*(self.ptr.add(SESSION_LOCK_OFFSET) as *const CrossProcessLock) }
    }

    fn next_robin(&self) -> u32 {
        // `allocator_robin_counter` is declared `i32` but only ever holds
        // non-negative values; an `AtomicU32` view over the same bytes
        // gives a real fetch-add instead of a lock-guarded read-modify-write.
        let word = unsafe { &*(self.ptr.add(64) as *const AtomicU32) };
        word.fetch_add(1, Ordering::Relaxed)
    }
}

/// One allocator root, living at the start of an allocator page. Layout:
/// `lock: u64, occupied_head: u32, freed_head: u32, high_water: u32,
/// next_page: u32`, then padding up to a 32-byte boundary so the data
/// area (immediately following) starts [`LARGE_HEADER_SLOT`]-aligned.
struct AllocatorPageView {
    ptr: *mut u8,
}

const ALLOCATOR_PAGE_DATA_OFFSET: usize = 32;

impl AllocatorPageView {
    unsafe fn at(ptr: *mut u8) -> Self {
        AllocatorPageView { ptr }
    }

    fn lock(&self) -> &CrossProcessLock {
        unsafe { &*(self.ptr as *const CrossProcessLock) }
    }

    fn occupied_head(&self) -> u32 {
        unsafe { (self.ptr.add(8) as *const u32).read_unaligned() }
    }
    fn set_occupied_head(&self, v: u32) {
        unsafe { (self.ptr.add(8) as *mut u32).write_unaligned(v) }
    }
    fn freed_head(&self) -> u32 {
        unsafe { (self.ptr.add(12) as *const u32).read_unaligned() }
    }
    fn set_freed_head(&self, v: u32) {
        unsafe { (self.ptr.add(12) as *mut u32).write_unaligned(v) }
    }
    fn high_water(&self) -> u32 {
        unsafe { (self.ptr.add(16) as *const u32).read_unaligned() }
    }
    fn set_high_water(&self, v: u32) {
        unsafe { (self.ptr.add(16) as *mut u32).write_unaligned(v) }
    }
    fn next_page(&self) -> u32 {
        unsafe { (self.ptr.add(20) as *const u32).read_unaligned() }
    }
    fn set_next_page(&self, v: u32) {
        unsafe { (self.ptr.add(20) as *mut u32).write_unaligned(v) }
    }

    fn data_base(&self) -> *mut u8 {
        unsafe { self.ptr.add(ALLOCATOR_PAGE_DATA_OFFSET) }
    }

    fn header_at(&self, offset: usize) -> LargeHeaderView {
        unsafe { LargeHeaderView::at(self.data_base().add(offset)) }
    }

    fn id_to_offset(id: u32) -> usize {
        id as usize * 16
    }
    fn offset_to_id(offset: usize) -> u32 {
        (offset / 16) as u32
    }

    fn try_allocate(
        &self,
        payload_len: usize,
        data_capacity: usize,
        block_allocator_index: u32,
    ) -> Option<MemoryBlock> {
        let needed = LARGE_HEADER_SLOT + os::align_up(payload_len.max(1), 16);
        if self.high_water() as usize + needed > data_capacity {
            return None;
        }
        let offset = self.high_water() as usize;
        self.set_high_water((offset + needed) as u32);
        let id = Self::offset_to_id(offset);

        let h = self.header_at(offset);
        h.set_prev_id(NULL_LARGE_ID);
        h.set_next_id(self.occupied_head());
        if self.occupied_head() != NULL_LARGE_ID {
            self.header_at(Self::id_to_offset(self.occupied_head()))
                .set_prev_id(id);
        }
        self.set_occupied_head(id);
        h.set_size(payload_len as u32);
        let gh = h.gen_header();
        gh.set_is_free(false);
        gh.set_is_in_mapped_file(true);
        gh.set_ref_counter(1);
        gh.set_block_allocator_index(block_allocator_index);
        gh.bump_generation();

        Some(MemoryBlock::new(h.payload_ptr(), payload_len, block_allocator_index))
    }

    fn free_payload(&self, data_offset: usize) -> bool {
        let h = self.header_at(data_offset);
        let gh = h.gen_header();
        if gh.is_free() {
            return false;
        }
        if gh.fetch_sub_ref() > 0 {
            return false;
        }
        gh.set_is_free(true);
        let id = Self::offset_to_id(data_offset);
        let prev = h.prev_id();
        let next = h.next_id();
        if prev != NULL_LARGE_ID {
            self.header_at(Self::id_to_offset(prev)).set_next_id(next);
        } else {
            self.set_occupied_head(next);
        }
        if next != NULL_LARGE_ID {
            self.header_at(Self::id_to_offset(next)).set_prev_id(prev);
        }
        h.set_next_id(self.freed_head());
        h.set_prev_id(NULL_LARGE_ID);
        if self.freed_head() != NULL_LARGE_ID {
            self.header_at(Self::id_to_offset(self.freed_head()))
                .set_prev_id(id);
        }
        self.set_freed_head(id);
        true
    }
}

/// An interned 64-byte resource key. Longer keys are rejected at
/// construction.
#[derive(Debug, Clone, Copy)]
pub struct String64 {
    bytes: [u8; 64],
    len: u8,
}

impl String64 {
    pub fn new(s: &str) -> CoreResult<Self> {
        let b = s.as_bytes();
        if b.len() > 63 {
            return Err(CoreError::InvalidChunk("resource key longer than 63 bytes"));
        }
        let mut bytes = [0u8; 64];
        bytes[..b.len()].copy_from_slice(b);
        Ok(String64 { bytes, len: b.len() as u8 })
    }

    fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

/// One resource-locator slot: a 64-byte key, a data-store handle, and an
/// occupancy byte. `72` bytes total, laid out so the dictionary can be
/// addressed as a flat array inside the user-data region.
const RESOURCE_SLOT_LEN: usize = 64 + 8 + 8;

/// A fixed-size, file-resident dictionary from [`String64`] keys to
/// data-store handles (`u64`). Linear-probed open addressing; mutation
/// is serialized by one cross-process lock shared with the session
/// table (the dictionary is small and updates are rare relative to
/// allocator traffic, so a dedicated lock per slot is not worth the
/// byte budget).
struct ResourceLocator {
    base: *mut u8,
    capacity: usize,
}

impl ResourceLocator {
    unsafe fn at(base: *mut u8, capacity: usize) -> Self {
        ResourceLocator { base, capacity }
    }

    fn slot_ptr(&self, idx: usize) -> *mut u8 {
        unsafe { self.base.add(idx * RESOURCE_SLOT_LEN) }
    }

    fn occupied(&self, idx: usize) -> bool {
        unsafe { *self.slot_ptr(idx).add(72) != 0 }
    }

    fn key_matches(&self, idx: usize, key: &String64) -> bool {
        let p = self.slot_ptr(idx);
        let stored = unsafe { std::slice::from_raw_parts(p, 64) };
        stored == &key.bytes[..]
    }

    fn write_slot(&self, idx: usize, key: &String64, handle: u64) {
        let p = self.slot_ptr(idx);
        unsafe {
            std::ptr::copy_nonoverlapping(key.bytes.as_ptr(), p, 64);
            (p.add(64) as *mut u64).write_unaligned(handle);
            *p.add(72) = 1;
        }
    }

    fn clear_slot(&self, idx: usize) {
        let p = self.slot_ptr(idx);
        unsafe {
            std::ptr::write_bytes(p, 0, RESOURCE_SLOT_LEN);
        }
    }

    fn handle_at(&self, idx: usize) -> u64 {
        unsafe { (self.slot_ptr(idx).add(64) as *const u64).read_unaligned() }
    }

    fn slot_for(&self, key: &String64) -> usize {
        let mut h: u64 = 1469598103934665603;
        for &b in &key.bytes[..key.len as usize] {
            h ^= b as u64;
            h = h.wrapping_mul(1099511628211);
        }
        (h as usize) % self.capacity
    }

    fn add(&self, key: &String64, handle: u64) -> CoreResult<()> {
        let start = self.slot_for(key);
        for probe in 0..self.capacity {
            let idx = (start + probe) % self.capacity;
            if !self.occupied(idx) {
                self.write_slot(idx, key, handle);
                return Ok(());
            }
            if self.key_matches(idx, key) {
                return Err(CoreError::DuplicateKey);
            }
            if probe > self.capacity {
                return Err(CoreError::ConcurrentMutation);
            }
        }
        Err(CoreError::OutOfMemory)
    }

    fn get(&self, key: &String64) -> Option<u64> {
        let start = self.slot_for(key);
        for probe in 0..self.capacity {
            let idx = (start + probe) % self.capacity;
            if !self.occupied(idx) {
                return None;
            }
            if self.key_matches(idx, key) {
                return Some(self.handle_at(idx));
            }
        }
        None
    }

    fn remove(&self, key: &String64) -> bool {
        let start = self.slot_for(key);
        for probe in 0..self.capacity {
            let idx = (start + probe) % self.capacity;
            if !self.occupied(idx) {
                return false;
            }
            if self.key_matches(idx, key) {
                self.clear_slot(idx);
                return true;
            }
        }
        false
    }
}

thread_local! {
    static ASSIGNED_ALLOCATOR_PAGE: std::cell::Cell<Option<u32>> = const { std::cell::Cell::new(None) };
}

/// A cross-process allocator over a single memory-mapped file.
pub struct Smm {
    mmap: MmapMut,
    options: SmmOptions,
    stats: Stats,
    data_area_len: usize,
    lock_timeout: std::time::Duration,
    index: u32,
    path: PathBuf,
}

impl Smm {
    /// Create a fresh backing file at `path`, sized and laid out per
    /// `options`, and register it with the host-wide MMF registry.
    pub fn create(path: &Path, options: SmmOptions) -> CoreResult<Self> {
        let page_size = options.page_size as usize;
        let page_capacity = (options.file_size as usize / page_size).max(2) as i32;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(page_capacity as u64 * page_size as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let bitfield_words = (page_capacity as usize).div_ceil(64);
        let bitfield_bytes = bitfield_words * 8;
        let directory_bytes = page_capacity as usize * 4;
        let allocators_bytes = options.max_session_count as usize * 4;

        let offset_session_info = SESSION_TABLE_OFFSET as i32;
        let offset_page_bitfield =
            offset_session_info + options.max_session_count as i32 * 4;
        let offset_page_directory = offset_page_bitfield + bitfield_bytes as i32;
        let offset_block_allocators = offset_page_directory + directory_bytes as i32;
        let resource_bytes = options.resource_capacity as usize * RESOURCE_SLOT_LEN;
        let offset_user_data = offset_block_allocators + allocators_bytes;

        {
            let root = unsafe { RootHeaderView::at(mmap.as_mut_ptr()) };
            root.set_page_size(page_size as i32);
            root.set_page_capacity(page_capacity);
            // Overwritten below with the real registry slot once this
            // file is registered; zeroed here only so the header is
            // fully initialized if registration fails and the caller
            // inspects the file.
            root.set_mmf_id(0);
            root.set_max_concurrency(options.max_session_count as i32);
            root.set_offset_session_info(offset_session_info);
            root.set_max_session_count(options.max_session_count as i32);
            root.set_session_info_lock(0);
            root.set_session_count(0);
            root.set_offset_page_bitfield(offset_page_bitfield);
            root.set_page_bitfield_size(bitfield_bytes as i32);
            root.set_offset_page_directory(offset_page_directory);
            root.set_page_directory_size(directory_bytes as i32);
            root.set_offset_block_allocators(offset_block_allocators);
            root.set_block_allocators_size(allocators_bytes as i32);
            root.set_offset_user_data(offset_user_data);
            root.set_user_data_size(resource_bytes as i32);
            root.set_allocator_robin_counter(0);
            root.set_data_store_page_index(0);
            root.set_resource_locator_dictionary_index(offset_user_data);
            root.set_resource_capacity(options.resource_capacity as i32);
        }

        // Seal the tail of page 0 and page 1 (always reserved, never
        // handed to the page allocator) so scans never return them.
        {
            let root = unsafe { RootHeaderView::at(mmap.as_mut_ptr()) };
            let words = unsafe {
                std::slice::from_raw_parts(
                    mmap.as_ptr().add(root.offset_page_bitfield() as usize) as *const AtomicU64,
                    bitfield_words,
                )
            };
            let view = BitmapView::new(words, page_capacity as usize);
            view.seal_tail();
            view.try_claim_range(0, 1); // page 0 (root header) is reserved
        }

        let stats = Stats::default();
        stats.reserved.bump(page_capacity as i64 * page_size as i64);
        stats.committed.bump(page_capacity as i64 * page_size as i64);

        let registry_slot = crate::mmf_registry::MmfRegistry::global()
            .register(path, mmap.as_ptr() as usize)?;
        // Persist the slot so a later `open()` on this same file can read
        // it back and re-attach without claiming a fresh one.
        unsafe { RootHeaderView::at(mmap.as_mut_ptr()) }.set_mmf_id(registry_slot as i32);
        let index = BlockReferential::global().register(Owner::Mmf {
            registry_slot,
            allocator_page_offset: 0,
        });

        let lock_timeout = options.lock_timeout;
        Ok(Smm {
            mmap,
            options,
            stats,
            data_area_len: page_size - ALLOCATOR_PAGE_DATA_OFFSET,
            lock_timeout,
            index,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing backing file at `path` without touching its
    /// contents: layout offsets and sizing come from the root header
    /// already on disk, not from `options` (only `lock_timeout` and
    /// `shrink_on_final_close` are taken from the caller, since those
    /// govern this handle's own behavior rather than the file's layout).
    /// Re-attaches this process's local mapped base address to the
    /// registry slot the file was created under, so a second process (or
    /// a second handle in the same process) sees the same live state
    /// instead of a freshly re-initialized file.
    pub fn open(path: &Path, options: SmmOptions) -> CoreResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let root = unsafe { RootHeaderView::at(mmap.as_ptr() as *mut u8) };
        if root.page_size() <= 0 || root.page_capacity() <= 0 {
            return Err(CoreError::Registry("not a valid tomate MMF"));
        }
        let page_size = root.page_size() as usize;
        let page_capacity = root.page_capacity();

        let registry_slot = root.mmf_id() as u32;
        crate::mmf_registry::MmfRegistry::global().reattach(
            registry_slot,
            path,
            mmap.as_ptr() as usize,
        )?;
        let index = BlockReferential::global().register(Owner::Mmf {
            registry_slot,
            allocator_page_offset: 0,
        });

        let stats = Stats::default();
        stats.reserved.bump(page_capacity as i64 * page_size as i64);
        stats.committed.bump(page_capacity as i64 * page_size as i64);

        let lock_timeout = options.lock_timeout;
        Ok(Smm {
            mmap,
            options,
            stats,
            data_area_len: page_size - ALLOCATOR_PAGE_DATA_OFFSET,
            lock_timeout,
            index,
            path: path.to_path_buf(),
        })
    }

    fn root(&self) -> RootHeaderView {
        unsafe { RootHeaderView::at(self.mmap.as_ptr() as *mut u8) }
    }

    fn page_ptr(&self, page_index: u32) -> *mut u8 {
        let page_size = self.root().page_size() as usize;
        unsafe { (self.mmap.as_ptr() as *mut u8).add(page_index as usize * page_size) }
    }

    fn page_bitmap(&self) -> BitmapView<'_> {
        let root = self.root();
        let words = unsafe {
            std::slice::from_raw_parts(
                self.mmap.as_ptr().add(root.offset_page_bitfield() as usize) as *const AtomicU64,
                (root.page_bitfield_size() as usize) / 8,
            )
        };
        BitmapView::new(words, root.page_capacity() as usize)
    }

    /// Claim one fresh page for use as an allocator root, stamping its
    /// header fields to zero/sentinel.
    fn alloc_allocator_page(&self) -> CoreResult<u32> {
        let view = self.page_bitmap();
        let idx = view.find_and_claim_one().ok_or(CoreError::OutOfMemory)?;
        self.stats.pages.bump(1);
        let page = unsafe { AllocatorPageView::at(self.page_ptr(idx as u32)) };
        page.set_occupied_head(NULL_LARGE_ID);
        page.set_freed_head(NULL_LARGE_ID);
        page.set_high_water(0);
        page.set_next_page(0);
        Ok(idx as u32)
    }

    fn allocator_table_slot_ptr(&self, slot: u32) -> *mut u32 {
        let root = self.root();
        unsafe {
            (self
                .mmap
                .as_ptr()
                .add(root.offset_block_allocators() as usize) as *mut u32)
                .add(slot as usize)
        }
    }

    /// Assign the calling thread an allocator slot, round-robin over the
    /// shared counter, lazily creating its first page.
    fn my_allocator_page(&self) -> CoreResult<u32> {
        if let Some(page) = ASSIGNED_ALLOCATOR_PAGE.with(|c| c.get()) {
            return Ok(page);
        }
        let root = self.root();
        let slot = root.next_robin() % root.max_concurrency().max(1) as u32;
        let slot_ptr = self.allocator_table_slot_ptr(slot);
        let existing = unsafe { slot_ptr.read_unaligned() };
        let page = if existing != 0 {
            existing
        } else {
            let session_guard = root
                .session_lock()
                .lock_timeout(self.lock_timeout)
                .ok_or(CoreError::ConcurrentMutation)?;
            let existing = unsafe { slot_ptr.read_unaligned() };
            let page = if existing != 0 {
                existing
            } else {
                let page = self.alloc_allocator_page()?;
                unsafe { slot_ptr.write_unaligned(page) };
                page
            };
            drop(session_guard);
            page
        };
        ASSIGNED_ALLOCATOR_PAGE.with(|c| c.set(Some(page)));
        Ok(page)
    }

    fn allocator_view(&self, page_index: u32) -> AllocatorPageView {
        unsafe { AllocatorPageView::at(self.page_ptr(page_index)) }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Allocate `n` bytes from this process's assigned allocator,
    /// following the page chain and growing it on exhaustion.
    pub fn allocate(&self, n: usize) -> CoreResult<MemoryBlock> {
        if n == 0 {
            return Ok(MemoryBlock::empty());
        }
        let max_payload = self.data_area_len - LARGE_HEADER_SLOT;
        if n > max_payload * 64 {
            return Err(CoreError::InvalidAllocationSize(n));
        }
        let mut page_index = self.my_allocator_page()?;
        loop {
            let page = self.allocator_view(page_index);
            let _guard = page
                .lock()
                .lock_timeout(self.lock_timeout)
                .ok_or(CoreError::ConcurrentMutation)?;
            if let Some(block) = page.try_allocate(n, self.data_area_len, self.index) {
                self.stats.malloc.bump(1);
                return Ok(block);
            }
            let next = page.next_page();
            if next != 0 {
                drop(_guard);
                page_index = next;
                continue;
            }
            let new_page = self.alloc_allocator_page()?;
            page.set_next_page(new_page);
            drop(_guard);
            page_index = new_page;
        }
    }

    /// Free a block previously returned by [`Smm::allocate`]. `addr` is
    /// this process's local mapped address for the payload.
    pub fn free(&self, block: MemoryBlock) -> bool {
        if block.is_empty() {
            return true;
        }
        let base = self.mmap.as_ptr() as usize;
        let page_size = self.root().page_size() as usize;
        let rel = block.addr().wrapping_sub(base);
        let page_index = (rel / page_size) as u32;
        let page = self.allocator_view(page_index);
        let _guard = match page.lock().lock_timeout(self.lock_timeout) {
            Some(g) => g,
            None => return false,
        };
        let data_offset = rel % page_size - ALLOCATOR_PAGE_DATA_OFFSET;
        page.free_payload(data_offset)
    }

    fn resource_locator(&self) -> ResourceLocator {
        let root = self.root();
        unsafe {
            ResourceLocator::at(
                self.mmap
                    .as_ptr()
                    .add(root.resource_locator_dictionary_index() as usize) as *mut u8,
                root.resource_capacity() as usize,
            )
        }
    }

    pub fn add_resource(&self, key: &str, handle: u64) -> CoreResult<()> {
        let key = String64::new(key)?;
        let _guard = self
            .root()
            .session_lock()
            .lock_timeout(self.lock_timeout)
            .ok_or(CoreError::ConcurrentMutation)?;
        self.resource_locator().add(&key, handle)
    }

    pub fn try_get_resource(&self, key: &str) -> Option<u64> {
        let key = String64::new(key).ok()?;
        self.resource_locator().get(&key)
    }

    pub fn remove_resource(&self, key: &str) -> CoreResult<bool> {
        let key = String64::new(key)?;
        let _guard = self
            .root()
            .session_lock()
            .lock_timeout(self.lock_timeout)
            .ok_or(CoreError::ConcurrentMutation)?;
        Ok(self.resource_locator().remove(&key))
    }

    /// Truncate the file to the highest still-allocated page, if
    /// `shrink_on_final_close` is set. Call only once every attaching
    /// process has detached (the caller, typically a single-process
    /// test harness or a supervising process, is responsible for that
    /// coordination — this crate has no attach/detach refcount beyond
    /// the session table `try_attach`/`detach` pair below).
    pub fn shutdown(self) -> CoreResult<()> {
        if !self.options.shrink_on_final_close {
            return Ok(());
        }
        let highest = self
            .page_bitmap()
            .find_first_set()
            .map(|_| {
                // Scan backward for the true highest set bit; the bitmap
                // has no reverse-scan primitive, so this is linear in
                // page count, acceptable at shutdown.
                let mut last = 0usize;
                for i in 0..self.root().page_capacity() as usize {
                    if self.page_bitmap().is_set(i) {
                        last = i;
                    }
                }
                last
            })
            .unwrap_or(0);
        let page_size = self.root().page_size() as u64;
        let new_len = (highest as u64 + 1) * page_size;
        let path = self.path.clone();
        drop(self.mmap);
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(new_len)?;
        Ok(())
    }

    /// Record the calling process's attachment in the session table.
    /// Returns `SessionTableFull` if no free slot remains.
    pub fn try_attach(&self) -> CoreResult<()> {
        let root = self.root();
        let _guard = root
            .session_lock()
            .lock_timeout(self.lock_timeout)
            .ok_or(CoreError::ConcurrentMutation)?;
        let table = unsafe {
            std::slice::from_raw_parts_mut(
                self.mmap
                    .as_ptr()
                    .add(root.offset_session_info() as usize) as *mut i32,
                root.max_session_count() as usize,
            )
        };
        let pid = std::process::id() as i32;
        for slot in table.iter_mut() {
            if *slot == 0 {
                *slot = pid;
                root.set_session_count(root.session_count() + 1);
                return Ok(());
            }
        }
        Err(CoreError::SessionTableFull)
    }

    pub fn detach(&self) {
        let root = self.root();
        let Some(_guard) = root.session_lock().lock_timeout(self.lock_timeout) else {
            return;
        };
        let table = unsafe {
            std::slice::from_raw_parts_mut(
                self.mmap
                    .as_ptr()
                    .add(root.offset_session_info() as usize) as *mut i32,
                root.max_session_count() as usize,
            )
        };
        let pid = std::process::id() as i32;
        for slot in table.iter_mut() {
            if *slot == pid {
                *slot = 0;
                root.set_session_count((root.session_count() - 1).max(0));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SmmOptions;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("tomate-smm-test-{name}-{}", std::process::id()));
        p
    }

    #[test]
    fn create_allocate_free_roundtrip() {
        let path = temp_path("roundtrip");
        let options = SmmOptions {
            file_size: 4 << 20,
            page_size: 1 << 20,
            ..SmmOptions::default()
        };
        let smm = Smm::create(&path, options).unwrap();
        let block = smm.allocate(128).unwrap();
        assert_eq!(block.len(), 128);
        assert!(smm.free(block));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn resource_locator_add_get_remove() {
        let path = temp_path("resources");
        let options = SmmOptions {
            file_size: 4 << 20,
            page_size: 1 << 20,
            resource_capacity: 16,
            ..SmmOptions::default()
        };
        let smm = Smm::create(&path, options).unwrap();
        smm.add_resource("widget", 42).unwrap();
        assert_eq!(smm.try_get_resource("widget"), Some(42));
        assert!(matches!(
            smm.add_resource("widget", 99),
            Err(CoreError::DuplicateKey)
        ));
        assert!(smm.remove_resource("widget").unwrap());
        assert_eq!(smm.try_get_resource("widget"), None);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn session_attach_detach_roundtrip() {
        let path = temp_path("sessions");
        let options = SmmOptions {
            file_size: 4 << 20,
            page_size: 1 << 20,
            max_session_count: 4,
            ..SmmOptions::default()
        };
        let smm = Smm::create(&path, options).unwrap();
        smm.try_attach().unwrap();
        smm.detach();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn open_sees_state_written_by_create() {
        // Simulates two independent processes attaching to the same
        // backing file: one creates and writes a resource, a second,
        // unrelated handle opens the same file and must see it without
        // the file having been re-truncated or re-initialized.
        let path = temp_path("open-roundtrip");
        let options = SmmOptions {
            file_size: 4 << 20,
            page_size: 1 << 20,
            resource_capacity: 16,
            ..SmmOptions::default()
        };
        let creator = Smm::create(&path, options.clone()).unwrap();
        creator.add_resource("widget", 42).unwrap();
        let block = creator.allocate(64).unwrap();

        let opener = Smm::open(&path, options).unwrap();
        assert_eq!(opener.try_get_resource("widget"), Some(42));
        assert_eq!(opener.root().page_capacity(), creator.root().page_capacity());

        // The opener can itself allocate, landing in the same file.
        let second_block = opener.allocate(64).unwrap();
        assert_eq!(second_block.len(), 64);
        opener.free(second_block);
        creator.free(block);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn open_on_missing_file_fails() {
        let path = temp_path("open-missing");
        let _ = std::fs::remove_file(&path);
        assert!(Smm::open(&path, SmmOptions::default()).is_err());
    }

    #[test]
    fn shutdown_truncates_file_to_highest_allocated_page() {
        let path = temp_path("shutdown-shrink");
        let options = SmmOptions {
            file_size: 8 << 20,
            page_size: 1 << 20,
            shrink_on_final_close: true,
            ..SmmOptions::default()
        };
        let smm = Smm::create(&path, options).unwrap();
        let original_len = std::fs::metadata(&path).unwrap().len();
        smm.shutdown().unwrap();
        let shrunk_len = std::fs::metadata(&path).unwrap().len();
        assert!(shrunk_len < original_len);
        let _ = std::fs::remove_file(&path);
    }
}
