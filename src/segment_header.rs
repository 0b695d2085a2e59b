//! Segment header layouts shared by GPMM (Module D) and SMM (Module E).
//!
//! Two header shapes share one layout family: a 14-byte "small-block"
//! header (16-bit links) and a 20-byte "large-block / MMF" header
//! (32-bit links, 32-bit size). Both embed the same 8-byte *generational
//! block header* bitfield:
//!
//! ```text
//! bit 0      is_free
//! bit 1      is_in_mapped_file
//! bits 2-15  ref_counter        (14 bits)
//! bits 16-35 block_allocator_index (20 bits)
//! bits 36-51 generation         (16 bits)
//! bits 52-63 unused
//! ```
//!
//! Every read/write goes through `read_unaligned`/`write_unaligned`:
//! a header's byte offset within its arena is only guaranteed to be
//! 16-byte aligned as a *slot*, not aligned to the size of each
//! individual sub-field, since small headers are 14 bytes of useful
//! data inside a 16-byte slot.

const IS_FREE_BIT: u64 = 1 << 0;
const IS_MAPPED_BIT: u64 = 1 << 1;
const REFCOUNT_SHIFT: u32 = 2;
const REFCOUNT_BITS: u32 = 14;
const REFCOUNT_MASK: u64 = ((1u64 << REFCOUNT_BITS) - 1) << REFCOUNT_SHIFT;
const INDEX_SHIFT: u32 = 16;
const INDEX_BITS: u32 = 20;
const INDEX_MASK: u64 = ((1u64 << INDEX_BITS) - 1) << INDEX_SHIFT;
const GEN_SHIFT: u32 = 36;
const GEN_BITS: u32 = 16;
const GEN_MASK: u64 = ((1u64 << GEN_BITS) - 1) << GEN_SHIFT;

pub const MAX_REF_COUNT: u32 = (1 << REFCOUNT_BITS) - 1;
pub const MAX_BLOCK_ALLOCATOR_INDEX: u32 = (1 << INDEX_BITS) - 1;

/// A byte-exact view over the 8-byte generational header word. All
/// mutation goes through plain (non-atomic) load/modify/store; callers
/// are required to hold whatever lock guards this header (see
/// [`GenHeaderView::fetch_add_ref`] for why).
#[derive(Clone, Copy)]
pub struct GenHeaderView {
    ptr: *mut u8,
}

impl GenHeaderView {
    /// # Safety
    /// `ptr` must point to 8 live, writable bytes for the lifetime of
    /// every call made through this view.
    pub unsafe fn at(ptr: *mut u8) -> Self {
        GenHeaderView { ptr }
    }

    fn load(&self) -> u64 {
        unsafe { (self.ptr as *const u64).read_unaligned() }
    }

    fn store(&self, value: u64) {
        unsafe { (self.ptr as *mut u64).write_unaligned(value) }
    }

    pub fn is_free(&self) -> bool {
        self.load() & IS_FREE_BIT != 0
    }

    pub fn set_is_free(&self, free: bool) {
        let mut w = self.load();
        if free {
            w |= IS_FREE_BIT;
        } else {
            w &= !IS_FREE_BIT;
        }
        self.store(w);
    }

    pub fn is_in_mapped_file(&self) -> bool {
        self.load() & IS_MAPPED_BIT != 0
    }

    pub fn set_is_in_mapped_file(&self, mapped: bool) {
        let mut w = self.load();
        if mapped {
            w |= IS_MAPPED_BIT;
        } else {
            w &= !IS_MAPPED_BIT;
        }
        self.store(w);
    }

    pub fn ref_counter(&self) -> u32 {
        ((self.load() & REFCOUNT_MASK) >> REFCOUNT_SHIFT) as u32
    }

    pub fn set_ref_counter(&self, count: u32) {
        debug_assert!(count <= MAX_REF_COUNT);
        let mut w = self.load();
        w &= !REFCOUNT_MASK;
        w |= (count as u64) << REFCOUNT_SHIFT;
        self.store(w);
    }

    /// Increment and return the new count. The generational header's
    /// sub-fields straddle byte boundaries that make a true
    /// natively-aligned `AtomicU64` unsound here (a small header's word
    /// starts at offset 6 in its 16-byte slot; a large header's at
    /// offset 12 in its 32-byte slot) — so ref-count changes are plain
    /// load/modify/store and rely on the caller already holding the
    /// allocator's exclusive lock (GPMM/SMM) or a writer guard (resource
    /// dictionary). Linearizability between allocations and frees is a
    /// property of that lock, not of this field in isolation.
    pub fn fetch_add_ref(&self) -> u32 {
        let count = self.ref_counter() + 1;
        self.set_ref_counter(count);
        count
    }

    /// Decrement and return the new count. See [`Self::fetch_add_ref`]
    /// for the synchronization contract.
    pub fn fetch_sub_ref(&self) -> u32 {
        let count = self.ref_counter().saturating_sub(1);
        self.set_ref_counter(count);
        count
    }

    pub fn block_allocator_index(&self) -> u32 {
        ((self.load() & INDEX_MASK) >> INDEX_SHIFT) as u32
    }

    pub fn set_block_allocator_index(&self, index: u32) {
        debug_assert!(index <= MAX_BLOCK_ALLOCATOR_INDEX);
        let mut w = self.load();
        w &= !INDEX_MASK;
        w |= (index as u64) << INDEX_SHIFT;
        self.store(w);
    }

    pub fn generation(&self) -> u16 {
        ((self.load() & GEN_MASK) >> GEN_SHIFT) as u16
    }

    pub fn bump_generation(&self) {
        let mut w = self.load();
        let gen = ((w & GEN_MASK) >> GEN_SHIFT) as u16;
        let next = gen.wrapping_add(1);
        w &= !GEN_MASK;
        w |= (next as u64) << GEN_SHIFT;
        self.store(w);
    }
}

pub const SMALL_HEADER_LOGICAL_SIZE: usize = 14;
pub const SMALL_HEADER_SLOT: usize = 16;
pub const NULL_SMALL_ID: u16 = u16::MAX;

/// View over a small-block segment header: `prev_id: u16, next_id: u16,
/// size: u16, gen_header: u64` (14 logical bytes, in a 16-byte slot).
#[derive(Clone, Copy)]
pub struct SmallHeaderView {
    ptr: *mut u8,
}

impl SmallHeaderView {
    /// # Safety
    /// `ptr` must point to `SMALL_HEADER_SLOT` live, writable bytes.
    pub unsafe fn at(ptr: *mut u8) -> Self {
        SmallHeaderView { ptr }
    }

    pub fn prev_id(&self) -> u16 {
        unsafe { (self.ptr as *const u16).read_unaligned() }
    }
    pub fn set_prev_id(&self, v: u16) {
        unsafe { (self.ptr as *mut u16).write_unaligned(v) }
    }
    pub fn next_id(&self) -> u16 {
        unsafe { (self.ptr.add(2) as *const u16).read_unaligned() }
    }
    pub fn set_next_id(&self, v: u16) {
        unsafe { (self.ptr.add(2) as *mut u16).write_unaligned(v) }
    }
    pub fn size(&self) -> u16 {
        unsafe { (self.ptr.add(4) as *const u16).read_unaligned() }
    }
    pub fn set_size(&self, v: u16) {
        unsafe { (self.ptr.add(4) as *mut u16).write_unaligned(v) }
    }
    pub fn gen_header(&self) -> GenHeaderView {
        unsafe { GenHeaderView::at(self.ptr.add(6)) }
    }
    /// Address of the payload immediately following this slot.
    pub fn payload_ptr(&self) -> *mut u8 {
        unsafe { self.ptr.add(SMALL_HEADER_SLOT) }
    }
}

pub const LARGE_HEADER_LOGICAL_SIZE: usize = 20;
pub const LARGE_HEADER_SLOT: usize = 32;
pub const NULL_LARGE_ID: u32 = u32::MAX;

/// View over a large-block / MMF segment header: `prev_id: u32,
/// next_id: u32, size: u32, gen_header: u64` (20 logical bytes, in a
/// 32-byte slot). `size` holds a 31-bit payload length when
/// `is_in_mapped_file()`.
#[derive(Clone, Copy)]
pub struct LargeHeaderView {
    ptr: *mut u8,
}

impl LargeHeaderView {
    /// # Safety
    /// `ptr` must point to `LARGE_HEADER_SLOT` live, writable bytes.
    pub unsafe fn at(ptr: *mut u8) -> Self {
        LargeHeaderView { ptr }
    }

    pub fn prev_id(&self) -> u32 {
        unsafe { (self.ptr as *const u32).read_unaligned() }
    }
    pub fn set_prev_id(&self, v: u32) {
        unsafe { (self.ptr as *mut u32).write_unaligned(v) }
    }
    pub fn next_id(&self) -> u32 {
        unsafe { (self.ptr.add(4) as *const u32).read_unaligned() }
    }
    pub fn set_next_id(&self, v: u32) {
        unsafe { (self.ptr.add(4) as *mut u32).write_unaligned(v) }
    }
    pub fn size(&self) -> u32 {
        unsafe { (self.ptr.add(8) as *const u32).read_unaligned() & 0x7FFF_FFFF }
    }
    pub fn set_size(&self, v: u32) {
        debug_assert!(v <= 0x7FFF_FFFF);
        unsafe { (self.ptr.add(8) as *mut u32).write_unaligned(v) }
    }
    pub fn gen_header(&self) -> GenHeaderView {
        unsafe { GenHeaderView::at(self.ptr.add(12)) }
    }
    pub fn payload_ptr(&self) -> *mut u8 {
        unsafe { self.ptr.add(LARGE_HEADER_SLOT) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gen_header_bitfield_roundtrip() {
        let mut buf = [0u8; 8];
        let view = unsafe { GenHeaderView::at(buf.as_mut_ptr()) };
        view.set_is_free(true);
        view.set_is_in_mapped_file(true);
        view.set_ref_counter(42);
        view.set_block_allocator_index(12345);
        view.bump_generation();
        view.bump_generation();
        assert!(view.is_free());
        assert!(view.is_in_mapped_file());
        assert_eq!(view.ref_counter(), 42);
        assert_eq!(view.block_allocator_index(), 12345);
        assert_eq!(view.generation(), 2);
    }

    #[test]
    fn small_header_roundtrip() {
        let mut buf = [0u8; SMALL_HEADER_SLOT];
        let h = unsafe { SmallHeaderView::at(buf.as_mut_ptr()) };
        h.set_prev_id(7);
        h.set_next_id(NULL_SMALL_ID);
        h.set_size(256);
        h.gen_header().set_ref_counter(1);
        assert_eq!(h.prev_id(), 7);
        assert_eq!(h.next_id(), NULL_SMALL_ID);
        assert_eq!(h.size(), 256);
        assert_eq!(h.gen_header().ref_counter(), 1);
    }

    #[test]
    fn large_header_size_is_31_bit() {
        let mut buf = [0u8; LARGE_HEADER_SLOT];
        let h = unsafe { LargeHeaderView::at(buf.as_mut_ptr()) };
        h.set_size(0x7FFF_FFFF);
        assert_eq!(h.size(), 0x7FFF_FFFF);
    }
}
