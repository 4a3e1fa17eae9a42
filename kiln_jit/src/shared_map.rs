//! Method → code map a zygote hands to its children.
//!
//! The map lives in the zygote's shared data arena. The zygote fills it once,
//! before any child exists; children only read it. A slot is claimed by
//! writing its code first and its method second with release ordering, so a
//! reader that sees a method also sees its code. Probing stops at the first
//! empty method slot.

use std::hash::BuildHasher;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use rustc_hash::FxBuildHasher;

use crate::host::MethodHandle;
use crate::region::MemoryRegion;

/// Progress of the zygote's pre-compilation, visible to children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ZygoteCompilationState {
    InProgress = 0,
    Done = 1,
    /// Children forked after this point know the map is complete.
    NotifiedChildren = 2,
}

impl ZygoteCompilationState {
    fn from_u32(value: u32) -> Self {
        match value {
            1 => ZygoteCompilationState::Done,
            2 => ZygoteCompilationState::NotifiedChildren,
            _ => ZygoteCompilationState::InProgress,
        }
    }
}

#[repr(C)]
struct MapHeader {
    state: AtomicU32,
    capacity: u32,
}

#[repr(C)]
struct Slot {
    method: AtomicUsize,
    code: AtomicUsize,
}

/// Open-addressed, write-once map in shared memory.
#[derive(Debug)]
pub struct SharedMap {
    base: usize,
    capacity: usize,
}

// SAFETY: the map only hands out atomics living in a mapping that outlives it.
unsafe impl Send for SharedMap {}
unsafe impl Sync for SharedMap {}

impl SharedMap {
    /// Slots needed for `count` methods: 1.25x, rounded to a power of two.
    pub fn capacity_for(count: usize) -> usize {
        (count + count / 4).max(1).next_power_of_two()
    }

    /// Bytes of a map with `capacity` slots.
    pub const fn bytes_for(capacity: usize) -> usize {
        size_of::<MapHeader>() + capacity * size_of::<Slot>()
    }

    /// Initialise an empty map at `base` in `region`'s data arena.
    pub fn create(region: &MemoryRegion, base: usize, capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        debug_assert_eq!(base % size_of::<usize>(), 0);
        region.write_data(base, &vec![0u8; Self::bytes_for(capacity)]);
        let header = MapHeader {
            state: AtomicU32::new(ZygoteCompilationState::InProgress as u32),
            capacity: capacity as u32,
        };
        // SAFETY: MapHeader is plain old data of known size.
        let bytes = unsafe {
            std::slice::from_raw_parts((&header as *const MapHeader).cast::<u8>(), size_of::<MapHeader>())
        };
        region.write_data(base, bytes);
        Self { base, capacity }
    }

    fn header(&self) -> &MapHeader {
        // SAFETY: `create` wrote a header at `base`.
        unsafe { &*(self.base as *const MapHeader) }
    }

    fn slots(&self) -> &[Slot] {
        // SAFETY: `capacity` zeroed slots follow the header.
        unsafe {
            std::slice::from_raw_parts(
                (self.base + size_of::<MapHeader>()) as *const Slot,
                self.capacity,
            )
        }
    }

    #[inline]
    fn home(&self, method: MethodHandle) -> usize {
        FxBuildHasher.hash_one(method) as usize & (self.capacity - 1)
    }

    /// Record `code` for `method`. Returns false when the method is already
    /// present or the map is full.
    pub fn insert(&self, method: MethodHandle, code: usize) -> bool {
        debug_assert_ne!(method.addr(), 0);
        let slots = self.slots();
        let start = self.home(method);
        for i in 0..self.capacity {
            let slot = &slots[(start + i) & (self.capacity - 1)];
            match slot.method.load(Ordering::Acquire) {
                0 => {
                    slot.code.store(code, Ordering::Relaxed);
                    slot.method.store(method.addr(), Ordering::Release);
                    return true;
                }
                existing if existing == method.addr() => return false,
                _ => {}
            }
        }
        false
    }

    /// Code recorded for `method`.
    pub fn get(&self, method: MethodHandle) -> Option<usize> {
        let slots = self.slots();
        let start = self.home(method);
        for i in 0..self.capacity {
            let slot = &slots[(start + i) & (self.capacity - 1)];
            match slot.method.load(Ordering::Acquire) {
                0 => return None,
                existing if existing == method.addr() => {
                    return Some(slot.code.load(Ordering::Relaxed));
                }
                _ => {}
            }
        }
        None
    }

    /// Every (method, code) pair, in slot order.
    pub fn entries(&self) -> impl Iterator<Item = (MethodHandle, usize)> + '_ {
        self.slots().iter().filter_map(|slot| {
            let method = slot.method.load(Ordering::Acquire);
            (method != 0).then(|| (MethodHandle::from_addr(method), slot.code.load(Ordering::Relaxed)))
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> ZygoteCompilationState {
        ZygoteCompilationState::from_u32(self.header().state.load(Ordering::Acquire))
    }

    /// Only the zygote may call this; children see the map read-only.
    pub fn set_state(&self, state: ZygoteCompilationState) {
        self.header().state.store(state as u32, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_map::page_size;
    use crate::region::RegionOptions;

    fn region() -> MemoryRegion {
        MemoryRegion::new(RegionOptions {
            initial_capacity: 4 * page_size(),
            max_capacity: 4 * page_size(),
            dual_view: false,
            shared: true,
            lazy_release_bug: false,
        })
        .unwrap()
    }

    #[test]
    fn test_capacity_for() {
        assert_eq!(SharedMap::capacity_for(0), 1);
        assert_eq!(SharedMap::capacity_for(8), 16);
        assert_eq!(SharedMap::capacity_for(12), 16);
        assert_eq!(SharedMap::capacity_for(13), 16);
        assert_eq!(SharedMap::capacity_for(100), 128);
    }

    #[test]
    fn test_insert_and_get() {
        let region = region();
        let map = SharedMap::create(&region, region.data_begin(), 16);
        for i in 1..=8 {
            assert!(map.insert(MethodHandle::from_addr(i * 0x40), 0x1000 * i));
        }
        assert!(!map.insert(MethodHandle::from_addr(0x40), 0xdead));
        for i in 1..=8 {
            assert_eq!(map.get(MethodHandle::from_addr(i * 0x40)), Some(0x1000 * i));
        }
        assert_eq!(map.get(MethodHandle::from_addr(0x44)), None);
        assert_eq!(map.len(), 8);
    }

    #[test]
    fn test_full_map_rejects_inserts() {
        let region = region();
        let map = SharedMap::create(&region, region.data_begin(), 2);
        assert!(map.insert(MethodHandle::from_addr(8), 1));
        assert!(map.insert(MethodHandle::from_addr(16), 2));
        assert!(!map.insert(MethodHandle::from_addr(24), 3));
        assert_eq!(map.get(MethodHandle::from_addr(24)), None);
    }

    #[test]
    fn test_state_transitions() {
        let region = region();
        let map = SharedMap::create(&region, region.data_begin(), 4);
        assert_eq!(map.state(), ZygoteCompilationState::InProgress);
        map.set_state(ZygoteCompilationState::Done);
        assert_eq!(map.state(), ZygoteCompilationState::Done);
    }

    #[test]
    fn test_readable_after_freeze() {
        let region = region();
        let map = SharedMap::create(&region, region.data_begin(), 4);
        map.insert(MethodHandle::from_addr(8), 0x1234);
        region.protect_read_only();
        assert_eq!(map.get(MethodHandle::from_addr(8)), Some(0x1234));
    }
}
