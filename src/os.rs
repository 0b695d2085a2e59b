//! Primitive OS memory operations: reserve, commit, decommit, protect,
//! reset, free. Split between a `libc`-backed Unix path and a
//! `winapi`-backed Windows path. This module is the foundation GPMM's
//! native arenas are carved from. Nothing here is public outside the
//! crate — callers go through `gpmm` or `smm`.

use crate::stats::Stats;
use std::ptr::null_mut;

/// Round `size` up to a multiple of `align` (`align` must be a power of
/// two). Returns 0 on overflow (saturating behavior).
pub fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    match size.checked_add(mask) {
        Some(v) => v & !mask,
        None => 0,
    }
}

pub fn align_down(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    size & !(align - 1)
}

/// The OS's native page granularity (4 KiB on essentially every
/// platform we target; queried once and cached).
pub fn os_page_size() -> usize {
    static PAGE_SIZE: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            let r = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if r > 0 {
                r as usize
            } else {
                4096
            }
        }
        #[cfg(windows)]
        {
            use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
            unsafe {
                let mut si: SYSTEM_INFO = std::mem::zeroed();
                GetSystemInfo(&mut si);
                if si.dwPageSize > 0 {
                    si.dwPageSize as usize
                } else {
                    4096
                }
            }
        }
    })
}

/// Round a requested size up to a good OS allocation granularity
/// (a page-size multiple, the allocation granularity
/// `VirtualAlloc`/`sysconf` report).
pub fn good_alloc_size(size: usize) -> usize {
    if size >= usize::MAX - os_page_size() {
        return size;
    }
    align_up(size, os_page_size())
}

/// Reserve and commit anonymous, zero-initialized memory from the OS.
/// Returns `None` on failure (caller maps this to `CoreError::OutOfMemory`).
pub fn reserve_commit(size: usize, stats: &Stats) -> Option<*mut u8> {
    if size == 0 {
        return None;
    }
    let size = good_alloc_size(size);
    let p = unsafe { raw_mmap(size) };
    if p.is_null() {
        log::warn!("os: failed to reserve {size} bytes: {}", last_os_error());
        return None;
    }
    stats.mmap_calls.bump(1);
    stats.reserved.bump(size as i64);
    stats.committed.bump(size as i64);
    Some(p)
}

/// Release memory obtained from [`reserve_commit`].
///
/// # Safety
/// `addr`/`size` must exactly describe a live reservation from this module.
pub unsafe fn free(addr: *mut u8, size: usize, stats: &Stats) {
    if addr.is_null() || size == 0 {
        return;
    }
    let size = good_alloc_size(size);
    let ok = raw_munmap(addr, size);
    stats.committed.bump(-(size as i64));
    stats.reserved.bump(-(size as i64));
    if !ok {
        log::warn!(
            "os: munmap failed for {addr:p} ({size} bytes): {}",
            last_os_error()
        );
    }
}

/// Advise the OS that `[addr, addr+size)` is not presently needed; the
/// range stays committed but its physical pages may be reclaimed
/// (`MADV_DONTNEED` / `MEM_RESET`).
///
/// # Safety
/// `addr`/`size` must lie within a live reservation.
pub unsafe fn reset(addr: *mut u8, size: usize, stats: &Stats) {
    if size == 0 {
        return;
    }
    stats.reset.bump(size as i64);
    #[cfg(unix)]
    {
        let r = libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED);
        if r != 0 {
            log::warn!("os: madvise(MADV_DONTNEED) failed: {}", last_os_error());
        }
    }
    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_RESET, PAGE_READWRITE};
        let p = VirtualAlloc(addr as _, size, MEM_RESET, PAGE_READWRITE);
        if p.is_null() {
            log::warn!("os: VirtualAlloc(MEM_RESET) failed: {}", last_os_error());
        }
    }
}

fn last_os_error() -> String {
    #[cfg(unix)]
    {
        errno::errno().to_string()
    }
    #[cfg(windows)]
    {
        use winapi::um::errhandlingapi::GetLastError;
        unsafe { format!("winerr {}", GetLastError()) }
    }
}

#[cfg(unix)]
unsafe fn raw_mmap(size: usize) -> *mut u8 {
    let p = libc::mmap(
        null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if p == libc::MAP_FAILED {
        null_mut()
    } else {
        p as *mut u8
    }
}

#[cfg(unix)]
unsafe fn raw_munmap(addr: *mut u8, size: usize) -> bool {
    libc::munmap(addr as *mut libc::c_void, size) == 0
}

#[cfg(windows)]
unsafe fn raw_mmap(size: usize) -> *mut u8 {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
    VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) as *mut u8
}

#[cfg(windows)]
unsafe fn raw_munmap(addr: *mut u8, _size: usize) -> bool {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;
    VirtualFree(addr as _, 0, MEM_RELEASE) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_down(31, 16), 16);
    }

    #[test]
    fn reserve_and_free_roundtrip() {
        let stats = Stats::default();
        let p = reserve_commit(4096, &stats).expect("reserve");
        assert!(!p.is_null());
        unsafe {
            std::ptr::write_bytes(p, 0xAB, 4096);
            free(p, 4096, &stats);
        }
        assert_eq!(stats.committed.current(), 0);
    }
}
