//! Sub-allocation of code and data slots from a region.
//!
//! An [`AllocationPool`] manages one arena: an address-ordered free list with
//! coalescing, falling back to a bump pointer bounded by the region's current
//! footprint. [`CodeSpace`] pairs a region with its code and data pools.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::blob::CODE_ALIGNMENT;
use crate::mem_map::{align_down, align_up, page_size};
use crate::region::MemoryRegion;

/// Alignment of data-arena allocations.
pub const DATA_ALIGNMENT: usize = 8;

// =============================================================================
// AllocationPool
// =============================================================================

/// Result of returning a chunk to a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Freed {
    /// Bytes returned.
    pub size: usize,
    /// Whole pages that became unused and may be handed back to the kernel.
    pub releasable: Option<Range<usize>>,
}

/// Free-list allocator over one arena.
#[derive(Debug)]
pub struct AllocationPool {
    base: usize,
    reserved: usize,
    footprint: usize,
    alignment: usize,
    /// Bump offset; everything below it has been handed out at least once.
    top: usize,
    /// Free chunks, offset -> size.
    free: BTreeMap<usize, usize>,
    /// Live allocations, offset -> size.
    live: FxHashMap<usize, usize>,
    /// Pages (by offset) given back to the kernel and not reused since.
    released: FxHashSet<usize>,
    used: usize,
}

impl AllocationPool {
    /// Create a pool over `base..base + reserved` that may initially use
    /// `footprint` bytes.
    pub fn new(base: usize, reserved: usize, footprint: usize, alignment: usize) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            base,
            reserved,
            footprint: footprint.min(reserved),
            alignment,
            top: 0,
            free: BTreeMap::new(),
            live: FxHashMap::default(),
            released: FxHashSet::default(),
            used: 0,
        }
    }

    /// Allocate `size` bytes; returns the address or `None` when the
    /// footprint is exhausted.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        let size = align_up(size.max(1), self.alignment);

        let fit = self
            .free
            .iter()
            .find(|&(_, &chunk)| chunk >= size)
            .map(|(&offset, &chunk)| (offset, chunk));
        let offset = match fit {
            Some((offset, chunk)) => {
                self.free.remove(&offset);
                if chunk > size {
                    self.free.insert(offset + size, chunk - size);
                }
                offset
            }
            None => {
                if self.top + size > self.footprint {
                    return None;
                }
                let offset = self.top;
                self.top += size;
                offset
            }
        };

        self.touch(offset, size);
        self.live.insert(offset, size);
        self.used += size;
        Some(self.base + offset)
    }

    /// Return the allocation starting at `addr`.
    ///
    /// Returns `None` when `addr` is not a live allocation of this pool.
    pub fn free(&mut self, addr: usize) -> Option<Freed> {
        let offset = addr.checked_sub(self.base)?;
        let size = self.live.remove(&offset)?;
        self.used -= size;

        let mut start = offset;
        let mut end = offset + size;
        if let Some((&prev, &prev_size)) = self.free.range(..offset).next_back() {
            if prev + prev_size == offset {
                self.free.remove(&prev);
                start = prev;
            }
        }
        if let Some(next_size) = self.free.remove(&end) {
            end += next_size;
        }
        self.free.insert(start, end - start);

        let page = page_size();
        let first = align_up(start, page);
        let last = align_down(end, page);
        let releasable = (last > first)
            .then(|| first..last)
            .filter(|pages| (pages.start..pages.end).step_by(page).any(|p| !self.released.contains(&p)))
            .map(|pages| self.base + pages.start..self.base + pages.end);
        Some(Freed { size, releasable })
    }

    /// Record that the pages of `range` were handed back to the kernel.
    pub fn mark_released(&mut self, range: Range<usize>) {
        let page = page_size();
        for addr in range.step_by(page) {
            self.released.insert(addr - self.base);
        }
    }

    fn touch(&mut self, offset: usize, size: usize) {
        if self.released.is_empty() {
            return;
        }
        let page = page_size();
        let mut p = align_down(offset, page);
        while p < offset + size {
            self.released.remove(&p);
            p += page;
        }
    }

    /// Raise (never lower) the footprint limit.
    pub fn set_footprint_limit(&mut self, footprint: usize) {
        self.footprint = self.footprint.max(footprint.min(self.reserved));
    }

    /// Size of the live allocation starting at `addr`.
    pub fn allocation_size(&self, addr: usize) -> Option<usize> {
        self.live.get(&addr.checked_sub(self.base)?).copied()
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.reserved
    }

    #[inline]
    pub fn footprint(&self) -> usize {
        self.footprint
    }

    /// Bytes in live allocations.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Bytes of pages touched and not handed back to the kernel.
    pub fn resident_bytes(&self) -> usize {
        align_up(self.top, page_size()) - self.released.len() * page_size()
    }

    /// Number of live allocations.
    #[inline]
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }
}

// =============================================================================
// CodeSpace
// =============================================================================

/// Code and data slots reserved together for one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceReservation {
    /// Start of the code allocation (the blob header).
    pub code: usize,
    pub code_len: usize,
    /// Start of the data allocation, 0 when none was needed.
    pub data: usize,
    pub data_len: usize,
}

/// A writable region with its two pools.
#[derive(Debug)]
pub struct CodeSpace {
    region: Arc<MemoryRegion>,
    code: AllocationPool,
    data: AllocationPool,
}

impl CodeSpace {
    pub fn new(region: Arc<MemoryRegion>) -> Self {
        let code = AllocationPool::new(
            region.exec_begin(),
            region.arena_size(),
            region.code_capacity(),
            CODE_ALIGNMENT,
        );
        let data = AllocationPool::new(
            region.data_begin(),
            region.arena_size(),
            region.data_capacity(),
            DATA_ALIGNMENT,
        );
        Self { region, code, data }
    }

    #[inline]
    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    /// Reserve a code slot of `code_len` bytes and a data slot of
    /// `data_len` bytes (none when zero). Both succeed or neither does.
    pub fn reserve(&mut self, code_len: usize, data_len: usize) -> Option<SpaceReservation> {
        let code = self.code.allocate(code_len)?;
        let data = if data_len == 0 {
            0
        } else {
            match self.data.allocate(data_len) {
                Some(data) => data,
                None => {
                    self.free_code(code);
                    return None;
                }
            }
        };
        Some(SpaceReservation {
            code,
            code_len: align_up(code_len.max(1), CODE_ALIGNMENT),
            data,
            data_len: if data == 0 { 0 } else { align_up(data_len, DATA_ALIGNMENT) },
        })
    }

    /// Allocate a data-only slot (profiling records, zygote map).
    pub fn allocate_data(&mut self, len: usize) -> Option<usize> {
        self.data.allocate(len)
    }

    pub fn free_code(&mut self, addr: usize) -> usize {
        match self.code.free(addr) {
            Some(freed) => {
                if let Some(pages) = freed.releasable {
                    if self.region.release_pages(pages.start, pages.len()) {
                        self.code.mark_released(pages);
                    }
                }
                freed.size
            }
            None => 0,
        }
    }

    pub fn free_data(&mut self, addr: usize) -> usize {
        match self.data.free(addr) {
            Some(freed) => {
                if let Some(pages) = freed.releasable {
                    if self.region.release_pages(pages.start, pages.len()) {
                        self.data.mark_released(pages);
                    }
                }
                freed.size
            }
            None => 0,
        }
    }

    /// Grow the region and both footprints. Returns false at maximum size.
    pub fn grow(&mut self) -> bool {
        if !self.region.increase_capacity() {
            return false;
        }
        self.code.set_footprint_limit(self.region.code_capacity());
        self.data.set_footprint_limit(self.region.data_capacity());
        true
    }

    #[inline]
    pub fn code_pool(&self) -> &AllocationPool {
        &self.code
    }

    #[inline]
    pub fn data_pool(&self) -> &AllocationPool {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionOptions;

    const BASE: usize = 0x10_0000;

    #[test]
    fn test_bump_allocation_respects_footprint() {
        let mut pool = AllocationPool::new(BASE, 4096, 64, 16);
        assert_eq!(pool.allocate(10), Some(BASE));
        assert_eq!(pool.allocate(16), Some(BASE + 16));
        assert_eq!(pool.allocate(32), Some(BASE + 32));
        assert_eq!(pool.allocate(1), None);
        pool.set_footprint_limit(128);
        assert_eq!(pool.allocate(1), Some(BASE + 64));
    }

    #[test]
    fn test_free_list_reuse_and_coalescing() {
        let mut pool = AllocationPool::new(BASE, 4096, 4096, 16);
        let a = pool.allocate(16).unwrap();
        let b = pool.allocate(16).unwrap();
        let c = pool.allocate(16).unwrap();
        let _d = pool.allocate(16).unwrap();
        assert_eq!(pool.used_bytes(), 64);

        pool.free(a).unwrap();
        pool.free(c).unwrap();
        pool.free(b).unwrap();
        assert_eq!(pool.used_bytes(), 16);

        // a, b and c merged into one 48-byte chunk at the start.
        assert_eq!(pool.allocate(48), Some(a));
    }

    #[test]
    fn test_free_unknown_address() {
        let mut pool = AllocationPool::new(BASE, 4096, 4096, 16);
        pool.allocate(16).unwrap();
        assert!(pool.free(BASE + 16).is_none());
        assert!(pool.free(BASE - 16).is_none());
        assert_eq!(pool.allocation_size(BASE), Some(16));
    }

    #[test]
    fn test_whole_pages_become_releasable() {
        let page = page_size();
        let mut pool = AllocationPool::new(BASE, 8 * page, 8 * page, 16);
        let small = pool.allocate(16).unwrap();
        let big = pool.allocate(3 * page).unwrap();
        let freed = pool.free(big).unwrap();
        // The chunk starts 16 bytes into page 0, so only pages 1 and 2 are whole.
        assert_eq!(freed.releasable, Some(BASE + page..BASE + 3 * page));
        pool.mark_released(BASE + page..BASE + 3 * page);
        assert_eq!(pool.resident_bytes(), 2 * page);

        let freed = pool.free(small).unwrap();
        assert_eq!(freed.releasable, Some(BASE..BASE + 3 * page));

        // Reusing a released page makes it resident again.
        pool.mark_released(BASE..BASE + page);
        assert_eq!(pool.resident_bytes(), page);
        pool.allocate(16).unwrap();
        assert_eq!(pool.resident_bytes(), 2 * page);
    }

    #[test]
    fn test_code_space_reserve_is_all_or_nothing() {
        let page = page_size();
        let region = Arc::new(
            MemoryRegion::new(RegionOptions {
                initial_capacity: 4 * page,
                max_capacity: 8 * page,
                dual_view: true,
                shared: false,
                lazy_release_bug: false,
            })
            .unwrap(),
        );
        let mut space = CodeSpace::new(region);
        let reservation = space.reserve(100, 40).unwrap();
        assert_eq!(reservation.code_len, 112);
        assert_eq!(reservation.data_len, 40);
        assert!(space.region().in_exec(reservation.code));
        assert!(space.region().in_data(reservation.data));

        // Code fits but data does not: nothing stays allocated.
        let before = space.code_pool().used_bytes();
        assert!(space.reserve(16, 3 * page).is_none());
        assert_eq!(space.code_pool().used_bytes(), before);

        assert!(space.grow());
        assert!(space.reserve(16, 3 * page).is_some());
        assert!(!space.grow());
    }
}
