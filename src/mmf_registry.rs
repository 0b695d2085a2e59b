//! Host-wide MMF registry (Module I).
//!
//! A single file, `Tomate.MMF.Registry.bin`, shared by every process on
//! the host that creates or opens a Tomate-managed mapped file. It does
//! not hold any memory itself: it maps a 1024-slot bitset to the
//! absolute path of each mapped file, so a block-allocator index
//! carrying a registry slot can be turned back into a live mapping by
//! any process — including one that never created the file. Per-process
//! base addresses differ across processes even for the same file, so
//! they are never written to the shared file; each process keeps its
//! own local cache after mapping the path itself.

use crate::error::{CoreError, CoreResult};
use crate::lock::CrossProcessLock;
use memmap2::MmapMut;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

const MAGIC: u32 = 0x524D_4D54;
const SLOT_COUNT: usize = 1024;
const PATH_SLOT_LEN: usize = 256;
const HEADER_LEN: usize = 32;
const BITSET_OFFSET: usize = HEADER_LEN;
const BITSET_LEN: usize = SLOT_COUNT / 8;
const STRING_TABLE_OFFSET: usize = BITSET_OFFSET + BITSET_LEN;
const FILE_LEN: usize = STRING_TABLE_OFFSET + SLOT_COUNT * PATH_SLOT_LEN;

const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// The directory this crate uses for host-wide singleton files. Resolved
/// manually from environment variables rather than pulling in a
/// directories crate for one file: `XDG_DATA_HOME`, falling back to
/// `$HOME/.local/share`, on Unix; `LOCALAPPDATA` on Windows.
fn local_app_data_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(dir) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(dir);
        }
        PathBuf::from(".")
    }
    #[cfg(not(windows))]
    {
        if let Ok(dir) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(dir);
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share");
        }
        PathBuf::from("/tmp")
    }
}

fn registry_path() -> PathBuf {
    local_app_data_dir().join("Tomate.MMF.Registry.bin")
}

struct RegistryHeaderView {
    ptr: *mut u8,
}

impl RegistryHeaderView {
    unsafe fn at(ptr: *mut u8) -> Self {
        RegistryHeaderView { ptr }
    }
    fn magic(&self) -> u32 {
        unsafe { (self.ptr as *const u32).read_unaligned() }
    }
    fn set_magic(&self, v: u32) {
        unsafe { (self.ptr as *mut u32).write_unaligned(v) }
    }
    fn lock(&self) -> &CrossProcessLock {
        unsafe { &*(self.ptr.add(8) as *const CrossProcessLock) }
    }
    fn entry_count(&self) -> u32 {
        unsafe { (self.ptr.add(16) as *const u32).read_unaligned() }
    }
    fn set_entry_count(&self, v: u32) {
        unsafe { (self.ptr.add(16) as *mut u32).write_unaligned(v) }
    }
}

struct MmfFile {
    mmap: MmapMut,
}

impl MmfFile {
    fn open_or_create() -> CoreResult<Self> {
        let path = registry_path();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let is_new = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(FILE_LEN as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let header = unsafe { RegistryHeaderView::at(mmap.as_mut_ptr()) };
        if is_new {
            header.set_magic(MAGIC);
            header.set_entry_count(0);
        } else if header.magic() != MAGIC {
            return Err(CoreError::Registry("magic mismatch"));
        }
        Ok(MmfFile { mmap })
    }

    fn header(&self) -> RegistryHeaderView {
        unsafe { RegistryHeaderView::at(self.mmap.as_ptr() as *mut u8) }
    }

    fn bit_byte(&self, slot: usize) -> (*mut u8, u8) {
        let byte_idx = BITSET_OFFSET + slot / 8;
        let mask = 1u8 << (slot % 8);
        let ptr = unsafe { (self.mmap.as_ptr() as *mut u8).add(byte_idx) };
        (ptr, mask)
    }

    fn is_occupied(&self, slot: usize) -> bool {
        let (ptr, mask) = self.bit_byte(slot);
        unsafe { *ptr & mask != 0 }
    }

    fn set_occupied(&self, slot: usize, occupied: bool) {
        let (ptr, mask) = self.bit_byte(slot);
        unsafe {
            if occupied {
                *ptr |= mask;
            } else {
                *ptr &= !mask;
            }
        }
    }

    fn path_slot_ptr(&self, slot: usize) -> *mut u8 {
        unsafe {
            (self.mmap.as_ptr() as *mut u8).add(STRING_TABLE_OFFSET + slot * PATH_SLOT_LEN)
        }
    }

    fn write_path(&self, slot: usize, path: &Path) -> CoreResult<()> {
        let bytes = path.to_string_lossy();
        let bytes = bytes.as_bytes();
        if bytes.len() >= PATH_SLOT_LEN {
            return Err(CoreError::Registry("path too long for registry slot"));
        }
        let ptr = self.path_slot_ptr(slot);
        unsafe {
            std::ptr::write_bytes(ptr, 0, PATH_SLOT_LEN);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }
        Ok(())
    }

    fn read_path(&self, slot: usize) -> PathBuf {
        let ptr = self.path_slot_ptr(slot);
        let slice = unsafe { std::slice::from_raw_parts(ptr, PATH_SLOT_LEN) };
        let end = slice.iter().position(|&b| b == 0).unwrap_or(PATH_SLOT_LEN);
        PathBuf::from(String::from_utf8_lossy(&slice[..end]).into_owned())
    }

    fn claim_slot(&self, path: &Path) -> CoreResult<u32> {
        let _guard = self
            .header()
            .lock()
            .lock_timeout(LOCK_TIMEOUT)
            .ok_or(CoreError::ConcurrentMutation)?;
        for slot in 0..SLOT_COUNT {
            if !self.is_occupied(slot) {
                self.set_occupied(slot, true);
                self.write_path(slot, path)?;
                self.header().set_entry_count(self.header().entry_count() + 1);
                return Ok(slot as u32);
            }
        }
        Err(CoreError::OutOfMemory)
    }

    fn release_slot(&self, slot: u32) -> CoreResult<()> {
        let _guard = self
            .header()
            .lock()
            .lock_timeout(LOCK_TIMEOUT)
            .ok_or(CoreError::ConcurrentMutation)?;
        if self.is_occupied(slot as usize) {
            self.set_occupied(slot as usize, false);
            self.header()
                .set_entry_count(self.header().entry_count().saturating_sub(1));
        }
        Ok(())
    }
}

/// Process-local view of the host-wide registry: the shared file
/// (opened lazily, on first use) plus a cache of slot -> (path, this
/// process's mapped base address) for slots this process has resolved.
pub struct MmfRegistry {
    file: Mutex<Option<MmfFile>>,
    local_cache: Mutex<HashMap<u32, (PathBuf, usize)>>,
}

impl MmfRegistry {
    /// The process-wide singleton. Lazily opens (or creates) the shared
    /// file on first actual use, not at singleton construction, so a
    /// process that never touches an MMF never pays for it.
    pub fn global() -> &'static MmfRegistry {
        static INSTANCE: OnceLock<MmfRegistry> = OnceLock::new();
        INSTANCE.get_or_init(|| MmfRegistry {
            file: Mutex::new(None),
            local_cache: Mutex::new(HashMap::new()),
        })
    }

    fn with_file<R>(&self, f: impl FnOnce(&MmfFile) -> CoreResult<R>) -> CoreResult<R> {
        let mut guard = self.file.lock().unwrap();
        if guard.is_none() {
            *guard = Some(MmfFile::open_or_create()?);
        }
        f(guard.as_ref().unwrap())
    }

    /// Register a freshly mapped file under its absolute path, recording
    /// this process's local base address, and return the slot index
    /// other processes will use to find it.
    pub fn register(&self, path: &Path, local_base_addr: usize) -> CoreResult<u32> {
        let absolute = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());
        let slot = self.with_file(|mf| mf.claim_slot(&absolute))?;
        self.local_cache
            .lock()
            .unwrap()
            .insert(slot, (absolute, local_base_addr));
        Ok(slot)
    }

    /// Re-attach this process's local base address to a slot that was
    /// claimed earlier, by this process or another one (read back from
    /// the MMF's own root header on open). Unlike [`Self::register`],
    /// this never claims a fresh slot — it only updates the local cache
    /// entry for a slot the file itself already knows about.
    pub fn reattach(&self, slot: u32, path: &Path, local_base_addr: usize) -> CoreResult<()> {
        let absolute = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());
        self.with_file(|mf| {
            if !mf.is_occupied(slot as usize) {
                return Err(CoreError::Registry("slot not occupied"));
            }
            Ok(())
        })?;
        self.local_cache
            .lock()
            .unwrap()
            .insert(slot, (absolute, local_base_addr));
        Ok(())
    }

    /// Resolve a registry slot to this process's local mapped base
    /// address, mapping the file for the first time if this process has
    /// not seen it before.
    pub fn resolve_local_base(&self, slot: u32) -> CoreResult<usize> {
        if let Some((_, addr)) = self.local_cache.lock().unwrap().get(&slot) {
            return Ok(*addr);
        }
        let path = self.with_file(|mf| {
            if !mf.is_occupied(slot as usize) {
                return Err(CoreError::Registry("slot not occupied"));
            }
            Ok(mf.read_path(slot as usize))
        })?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let addr = mmap.as_ptr() as usize;
        // Leak the mapping: it must stay live for the life of the
        // process, same as any other MMF this process has attached to.
        std::mem::forget(mmap);
        self.local_cache
            .lock()
            .unwrap()
            .insert(slot, (path, addr));
        Ok(addr)
    }

    pub fn unregister(&self, slot: u32) -> CoreResult<()> {
        self.local_cache.lock().unwrap().remove(&slot);
        self.with_file(|mf| mf.release_slot(slot))
    }

    pub fn entry_count(&self) -> CoreResult<u32> {
        self.with_file(|mf| Ok(mf.header().entry_count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_resolve_roundtrip() {
        let registry = MmfRegistry::global();
        let path = std::env::temp_dir().join(format!(
            "tomate-mmf-registry-test-{}.bin",
            std::process::id()
        ));
        std::fs::write(&path, [0u8; 64]).unwrap();
        let slot = registry.register(&path, 0xDEAD_BEEF).unwrap();
        assert_eq!(registry.resolve_local_base(slot).unwrap(), 0xDEAD_BEEF);
        registry.unregister(slot).unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
