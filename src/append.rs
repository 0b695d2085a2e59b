//! Append collection (Module J): a forward-growing arena over the page
//! allocator with no free operation — the whole collection is disposed
//! together.
//!
//! Reserved spans are addressed by a 32-bit logical id equal to the
//! write offset at the time of reservation. Because every page is the
//! same fixed size and a reservation that doesn't fit the current page
//! wastes the remainder and starts a fresh page, that id decodes back
//! into `(page index, offset in page)` by plain division, no directory
//! lookup needed for the decode itself (a directory lookup is still
//! needed to turn the page index into a live segment).

use crate::error::{CoreError, CoreResult};
use crate::page_allocator::{PageAllocator, Segment};
use std::sync::Mutex;

struct AppendState {
    directory: Vec<Segment>,
    write_offset: u64,
}

/// A single-direction byte arena. `page_size` must match the backing
/// [`PageAllocator`]'s page size exactly, since logical ids are decoded
/// by dividing by it.
pub struct AppendCollection {
    pages: PageAllocator,
    page_size: u64,
    state: Mutex<AppendState>,
}

impl AppendCollection {
    pub fn new(page_size: u32, page_capacity: u32) -> CoreResult<Self> {
        let pages = PageAllocator::new(page_size, page_capacity)?;
        Ok(AppendCollection {
            pages,
            page_size: page_size as u64,
            state: Mutex::new(AppendState {
                directory: Vec::new(),
                write_offset: 0,
            }),
        })
    }

    /// Reserve `n` contiguous bytes and return their logical id. `n`
    /// must not exceed the page size (a reservation never spans pages).
    pub fn reserve(&self, n: usize) -> CoreResult<u32> {
        if n == 0 || n as u64 > self.page_size {
            return Err(CoreError::InvalidAllocationSize(n));
        }
        let mut state = self.state.lock().unwrap();
        let offset_in_page = state.write_offset % self.page_size;
        let remaining = self.page_size - offset_in_page;
        if state.directory.is_empty() || (remaining as usize) < n {
            // Waste the remainder of the current page (if any) and
            // start a fresh one at the next page boundary.
            if !state.directory.is_empty() {
                state.write_offset += remaining;
            }
            let segment = self.pages.allocate_pages(1)?;
            state.directory.push(segment);
        }
        let id = state.write_offset;
        if id > u32::MAX as u64 {
            return Err(CoreError::OutOfMemory);
        }
        state.write_offset += n as u64;
        Ok(id as u32)
    }

    /// Decode `id` and return a pointer to its reserved `n`-byte span.
    pub fn get(&self, id: u32, n: usize) -> CoreResult<*mut u8> {
        let id = id as u64;
        let page_index = (id / self.page_size) as usize;
        let offset_in_page = (id % self.page_size) as usize;
        if offset_in_page + n > self.page_size as usize {
            return Err(CoreError::InvalidHandle);
        }
        let state = self.state.lock().unwrap();
        let segment = state
            .directory
            .get(page_index)
            .copied()
            .ok_or(CoreError::InvalidHandle)?;
        Ok((segment.base + offset_in_page) as *mut u8)
    }

    pub fn allocated_page_count(&self) -> usize {
        self.state.lock().unwrap().directory.len()
    }

    pub fn page_capacity(&self) -> u32 {
        self.pages.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_get_roundtrip() {
        let collection = AppendCollection::new(256, 8).unwrap();
        let id = collection.reserve(64).unwrap();
        let ptr = collection.get(id, 64).unwrap();
        unsafe {
            std::ptr::write_bytes(ptr, 0xAB, 64);
            assert_eq!(*ptr, 0xAB);
        }
    }

    #[test]
    fn reservation_that_overflows_page_wastes_remainder() {
        let collection = AppendCollection::new(128, 4).unwrap();
        let _first = collection.reserve(100).unwrap();
        let second = collection.reserve(64).unwrap();
        assert_eq!(collection.allocated_page_count(), 2);
        assert_eq!(second, 128);
    }

    #[test]
    fn oversized_reservation_rejected() {
        let collection = AppendCollection::new(128, 4).unwrap();
        assert!(matches!(
            collection.reserve(200),
            Err(CoreError::InvalidAllocationSize(_))
        ));
    }
}
