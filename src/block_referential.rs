//! Process-wide block-allocator index table (Module G).
//!
//! Every segment header (small-block, large-block, or MMF) carries a
//! 20-bit "block-allocator index" rather than a pointer to its owning
//! allocator. This table is the indirection that turns that index back
//! into a live allocator, so any thread can `free(addr)` in O(1) without
//! knowing in advance which allocator produced `addr`. A closed variant
//! (`Owner`) distinguishes in-process allocators (GPMM) from
//! MMF-registry-indirected ones (SMM), avoiding a generic
//! virtual-dispatch free list for what are really two closed cases.

use crate::gpmm::MemoryBlock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Anything that can satisfy a free/addref/resize request dispatched
/// through the block referential. Implemented by GPMM's small- and
/// large-block allocators. Trait-object dispatch is justified here
/// specifically (unlike the closed small/large/huge variant used inside
/// a single GPMM instance) because the referential must hold both GPMM
/// and SMM-style owners behind one 20-bit index space, and is reached
/// only on the cold "I don't know which allocator this came from" path
/// — never the allocator's own hot allocate/free loop.
pub trait AllocatorHandle: Send + Sync {
    /// Release one reference to the segment whose payload starts at
    /// `payload_addr`. Returns `true` if the segment's ref count reached
    /// zero and the segment was returned to its allocator's free list.
    fn free(&self, payload_addr: usize) -> bool;

    /// Increment the segment's reference count.
    fn add_ref(&self, payload_addr: usize);

    /// Human-readable label, used only for logging/debugging.
    fn label(&self) -> &str;

    /// Current reference count of the segment at `payload_addr`. Used by
    /// resize's copy path to carry the count forward onto the relocated
    /// block rather than resetting it to 1.
    fn ref_count(&self, payload_addr: usize) -> u32;

    /// Overwrite the segment's reference count directly, bypassing the
    /// usual add/sub-by-one protocol. Used only by resize.
    fn set_ref_count(&self, payload_addr: usize, count: u32);

    /// Unconditionally return the segment to its allocator's free list,
    /// regardless of its current reference count. Used only by resize's
    /// copy path: the references the old segment held are being relocated
    /// onto a freshly allocated one, not released.
    fn force_free(&self, payload_addr: usize);

    /// Attempt to grow or shrink the segment at `payload_addr` without
    /// moving it. Returns `None` when the allocator kind doesn't support
    /// in-place resize, or there isn't enough adjacent free space.
    fn try_resize_in_place(&self, _payload_addr: usize, _new_len: usize) -> Option<MemoryBlock> {
        None
    }
}

/// Either an in-process allocator, or an indirection into the
/// cross-process MMF registry (slot id + the offset of the owning
/// allocator's root page within that file).
pub enum Owner {
    InProcess(Arc<dyn AllocatorHandle>),
    Mmf {
        registry_slot: u32,
        allocator_page_offset: u64,
    },
}

/// `2^20 - 1` usable slots (index `0` is reserved to mean "unregistered"
/// so a zeroed header is never mistaken for a live one).
pub const MAX_BLOCK_ALLOCATORS: usize = (1 << 20) - 1;

struct Slot {
    owner: RwLock<Option<Owner>>,
}

pub struct BlockReferential {
    slots: Box<[Slot]>,
    next_free: AtomicU32,
}

impl BlockReferential {
    fn new() -> Self {
        let slots = (0..MAX_BLOCK_ALLOCATORS)
            .map(|_| Slot {
                owner: RwLock::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        BlockReferential {
            slots,
            next_free: AtomicU32::new(1), // index 0 reserved
        }
    }

    /// The process-wide singleton. Lazily initialized the first time any
    /// allocator registers itself; torn down implicitly at process exit.
    pub fn global() -> &'static BlockReferential {
        static INSTANCE: OnceLock<BlockReferential> = OnceLock::new();
        INSTANCE.get_or_init(BlockReferential::new)
    }

    /// Register a new owner and return its 20-bit index. Linear probing
    /// from a monotonic counter is sufficient here: indices are only
    /// reclaimed when an allocator is torn down, which is rare relative
    /// to allocate/free traffic.
    pub fn register(&self, owner: Owner) -> u32 {
        loop {
            let idx = self.next_free.fetch_add(1, Ordering::Relaxed) as usize;
            let idx = idx % MAX_BLOCK_ALLOCATORS;
            if idx == 0 {
                continue;
            }
            let mut slot = self.slots[idx].owner.write().unwrap();
            if slot.is_none() {
                *slot = Some(owner);
                return idx as u32;
            }
            // Extremely unlikely (would require wraparound into a still
            // live slot); retry with the next index.
        }
    }

    pub fn unregister(&self, index: u32) {
        if index == 0 {
            return;
        }
        let mut slot = self.slots[index as usize].owner.write().unwrap();
        *slot = None;
    }

    /// Dispatch a free through the table. Returns `false` if the index is
    /// unregistered (a bug in the caller, since every live header must
    /// carry a registered index) or if the owner is an MMF indirection
    /// (those are resolved by `crate::smm`, which holds the registry).
    pub fn free_in_process(&self, index: u32, payload_addr: usize) -> bool {
        if index == 0 {
            return false;
        }
        let slot = self.slots[index as usize].owner.read().unwrap();
        match slot.as_ref() {
            Some(Owner::InProcess(handle)) => handle.free(payload_addr),
            _ => false,
        }
    }

    pub fn add_ref_in_process(&self, index: u32, payload_addr: usize) {
        if index == 0 {
            return;
        }
        let slot = self.slots[index as usize].owner.read().unwrap();
        if let Some(Owner::InProcess(handle)) = slot.as_ref() {
            handle.add_ref(payload_addr);
        }
    }

    /// Current reference count of a registered segment, or `0` if the
    /// index is unregistered or not an in-process owner.
    pub fn ref_count_in_process(&self, index: u32, payload_addr: usize) -> u32 {
        if index == 0 {
            return 0;
        }
        let slot = self.slots[index as usize].owner.read().unwrap();
        match slot.as_ref() {
            Some(Owner::InProcess(handle)) => handle.ref_count(payload_addr),
            _ => 0,
        }
    }

    pub fn set_ref_count_in_process(&self, index: u32, payload_addr: usize, count: u32) {
        if index == 0 {
            return;
        }
        let slot = self.slots[index as usize].owner.read().unwrap();
        if let Some(Owner::InProcess(handle)) = slot.as_ref() {
            handle.set_ref_count(payload_addr, count);
        }
    }

    /// Unconditionally release a segment, ignoring its reference count.
    pub fn force_free_in_process(&self, index: u32, payload_addr: usize) {
        if index == 0 {
            return;
        }
        let slot = self.slots[index as usize].owner.read().unwrap();
        if let Some(Owner::InProcess(handle)) = slot.as_ref() {
            handle.force_free(payload_addr);
        }
    }

    /// Attempt an in-place resize, dispatched to the owning allocator.
    pub fn try_resize_in_place(&self, index: u32, payload_addr: usize, new_len: usize) -> Option<MemoryBlock> {
        if index == 0 {
            return None;
        }
        let slot = self.slots[index as usize].owner.read().unwrap();
        match slot.as_ref() {
            Some(Owner::InProcess(handle)) => handle.try_resize_in_place(payload_addr, new_len),
            _ => None,
        }
    }

    /// Resolve the MMF indirection for a given index, if any.
    pub fn mmf_indirection(&self, index: u32) -> Option<(u32, u64)> {
        if index == 0 {
            return None;
        }
        let slot = self.slots[index as usize].owner.read().unwrap();
        match slot.as_ref() {
            Some(Owner::Mmf {
                registry_slot,
                allocator_page_offset,
            }) => Some((*registry_slot, *allocator_page_offset)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct Dummy(AtomicBool);
    impl AllocatorHandle for Dummy {
        fn free(&self, _payload_addr: usize) -> bool {
            self.0.store(true, Ordering::SeqCst);
            true
        }
        fn add_ref(&self, _payload_addr: usize) {}
        fn label(&self) -> &str {
            "dummy"
        }
        fn ref_count(&self, _payload_addr: usize) -> u32 {
            1
        }
        fn set_ref_count(&self, _payload_addr: usize, _count: u32) {}
        fn force_free(&self, _payload_addr: usize) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn register_and_dispatch_free() {
        let referential = BlockReferential::new();
        let dummy = Arc::new(Dummy(AtomicBool::new(false)));
        let idx = referential.register(Owner::InProcess(dummy.clone()));
        assert!(idx != 0);
        assert!(referential.free_in_process(idx, 0x1000));
        assert!(dummy.0.load(Ordering::SeqCst));
    }

    #[test]
    fn unregistered_index_fails_closed() {
        let referential = BlockReferential::new();
        assert!(!referential.free_in_process(5, 0x1000));
    }
}
