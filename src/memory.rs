//! Registered memory pools for the in-process memory servers.
//!
//! Each memory server owns one page-aligned pool; region extents are carved
//! out of the pool and data items are carved out of extents, both with the
//! same first-fit free-list allocator.

use crate::error::{FamError, FamResult};
use parking_lot::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;

const POOL_ALIGNMENT: usize = 4096;

/// First-fit allocator over a contiguous range of bytes.
///
/// Frees go onto a free list keyed by offset; allocation prefers a free
/// block before bumping the high-water mark. Adjacent free blocks are
/// coalesced on deallocation to keep long create/destroy loops from
/// fragmenting the range.
#[derive(Debug)]
pub(crate) struct RangeAllocator {
    cursor: u64,
    capacity: u64,
    alignment: u64,
    free_list: BTreeMap<u64, u64>,
}

impl RangeAllocator {
    pub(crate) fn new(capacity: u64, alignment: u64) -> Self {
        Self {
            cursor: 0,
            capacity,
            alignment,
            free_list: BTreeMap::new(),
        }
    }

    pub(crate) fn allocate(&mut self, size: u64) -> Option<u64> {
        let size = align_up(size.max(1), self.alignment);

        let found = self
            .free_list
            .iter()
            .find(|(_, &block_size)| block_size >= size)
            .map(|(&offset, &block_size)| (offset, block_size));
        if let Some((offset, block_size)) = found {
            self.free_list.remove(&offset);
            if block_size > size {
                self.free_list.insert(offset + size, block_size - size);
            }
            return Some(offset);
        }

        let offset = align_up(self.cursor, self.alignment);
        if offset + size > self.capacity {
            return None;
        }
        self.cursor = offset + size;
        Some(offset)
    }

    pub(crate) fn deallocate(&mut self, offset: u64, size: u64) {
        let mut offset = offset;
        let mut size = align_up(size.max(1), self.alignment);

        // Coalesce with the previous and next free blocks when contiguous.
        if let Some((&prev_off, &prev_size)) = self.free_list.range(..offset).next_back() {
            if prev_off + prev_size == offset {
                self.free_list.remove(&prev_off);
                offset = prev_off;
                size += prev_size;
            }
        }
        if let Some(&next_size) = self.free_list.get(&(offset + size)) {
            self.free_list.remove(&(offset + size));
            size += next_size;
        }
        self.free_list.insert(offset, size);
    }

    pub(crate) fn used(&self) -> u64 {
        self.cursor - self.free_list.values().sum::<u64>()
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// A page-aligned pool registered with the fabric.
pub(crate) struct RegisteredPool {
    base: NonNull<u8>,
    layout: Layout,
    allocator: Mutex<RangeAllocator>,
}

// The pool hands out raw addresses; concurrent access to disjoint
// allocations is coordinated by the allocator and by the key/bounds checks
// on the data path.
unsafe impl Send for RegisteredPool {}
unsafe impl Sync for RegisteredPool {}

impl RegisteredPool {
    pub(crate) fn new(size: u64) -> FamResult<Self> {
        let layout = Layout::from_size_align(size as usize, POOL_ALIGNMENT)
            .map_err(|e| FamError::resource(format!("bad pool layout: {}", e)))?;
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base)
            .ok_or_else(|| FamError::resource("failed to allocate memory pool"))?;
        Ok(Self {
            base,
            layout,
            allocator: Mutex::new(RangeAllocator::new(size, POOL_ALIGNMENT as u64)),
        })
    }

    pub(crate) fn allocate(&self, size: u64) -> FamResult<u64> {
        self.allocator
            .lock()
            .allocate(size)
            .ok_or_else(|| FamError::new(crate::error::FamErrorKind::Allocator, "pool exhausted"))
    }

    pub(crate) fn deallocate(&self, offset: u64, size: u64) {
        self.allocator.lock().deallocate(offset, size);
    }

    pub(crate) fn base_addr(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    pub(crate) fn addr_at(&self, offset: u64) -> u64 {
        self.base_addr() + offset
    }

    pub(crate) fn size(&self) -> u64 {
        self.layout.size() as u64
    }

    pub(crate) fn used(&self) -> u64 {
        self.allocator.lock().used()
    }
}

impl Drop for RegisteredPool {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_do_not_overlap() {
        let pool = RegisteredPool::new(1 << 20).unwrap();
        let a = pool.allocate(100).unwrap();
        let b = pool.allocate(200).unwrap();
        assert_ne!(a, b);
        assert!(b >= a + 4096 || a >= b + 4096);
    }

    #[test]
    fn freed_space_is_reused() {
        let mut alloc = RangeAllocator::new(64 * 1024, 4096);
        let a = alloc.allocate(4096).unwrap();
        let b = alloc.allocate(4096).unwrap();
        alloc.deallocate(a, 4096);
        let c = alloc.allocate(4096).unwrap();
        assert_eq!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn adjacent_free_blocks_coalesce() {
        let mut alloc = RangeAllocator::new(16 * 4096, 4096);
        let a = alloc.allocate(4096).unwrap();
        let b = alloc.allocate(4096).unwrap();
        let c = alloc.allocate(4096).unwrap();
        alloc.deallocate(a, 4096);
        alloc.deallocate(c, 4096);
        alloc.deallocate(b, 4096);
        // All three merged into one block large enough for a big request.
        let big = alloc.allocate(3 * 4096).unwrap();
        assert_eq!(big, a);
    }

    #[test]
    fn exhaustion_reports_allocator_error() {
        let pool = RegisteredPool::new(8 * 1024).unwrap();
        pool.allocate(4096).unwrap();
        pool.allocate(4096).unwrap();
        assert!(pool.allocate(1).is_err());
    }

    #[test]
    fn pool_memory_is_zeroed_and_addressable() {
        let pool = RegisteredPool::new(64 * 1024).unwrap();
        let offset = pool.allocate(4096).unwrap();
        let addr = pool.addr_at(offset);
        let slice = unsafe { std::slice::from_raw_parts(addr as *const u8, 4096) };
        assert!(slice.iter().all(|&b| b == 0));
    }
}
