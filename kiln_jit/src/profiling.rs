//! Per-method profiling records.
//!
//! Baseline code updates a record in place: a hotness counter that counts
//! down from `u16::MAX`, one inline cache per virtual call site and a pair of
//! counters per branch. Records live in the data arena next to the root
//! tables and stay valid until their method is unloaded.
//!
//! ```text
//! ┌──────────────────────────┬─────────────────────────┬──────────────────┐
//! │ ProfilingRecord (16 B)   │ InlineCache[n] (48 B)   │ BranchCache[m]   │
//! │ method | hotness | n | m │ dex_pc | classes[5]     │ dex_pc | taken.. │
//! └──────────────────────────┴─────────────────────────┴──────────────────┘
//! ```
//!
//! Inline-cache classes are weak: the GC sweep clears classes it found dead.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use smallvec::SmallVec;

use crate::cache::JitCodeCache;
use crate::host::{MethodHandle, ObjectRef, PackageId};

/// Classes remembered per call site; a full cache is megamorphic.
pub const INLINE_CACHE_SIZE: usize = 5;

// =============================================================================
// Record layout
// =============================================================================

/// Header of a profiling record.
#[repr(C)]
pub struct ProfilingRecord {
    method: usize,
    baseline_hotness: AtomicU16,
    num_inline_caches: u16,
    num_branches: u16,
    _pad: u16,
}

/// Receiver classes seen at one call site.
#[repr(C)]
pub struct InlineCache {
    dex_pc: u32,
    _pad: u32,
    classes: [AtomicUsize; INLINE_CACHE_SIZE],
}

/// Outcome counters of one conditional branch.
#[repr(C)]
pub struct BranchCache {
    dex_pc: u32,
    taken: AtomicU16,
    not_taken: AtomicU16,
}

impl ProfilingRecord {
    /// Bytes of a record with the given number of call sites and branches.
    pub const fn size_for(inline_caches: usize, branches: usize) -> usize {
        size_of::<ProfilingRecord>()
            + inline_caches * size_of::<InlineCache>()
            + branches * size_of::<BranchCache>()
    }

    /// Serialise a fresh record for `method`.
    pub(crate) fn encode(method: MethodHandle, inline_cache_pcs: &[u32], branch_pcs: &[u32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::size_for(inline_cache_pcs.len(), branch_pcs.len()));
        bytes.extend_from_slice(&method.addr().to_ne_bytes());
        bytes.extend_from_slice(&u16::MAX.to_ne_bytes());
        bytes.extend_from_slice(&(inline_cache_pcs.len() as u16).to_ne_bytes());
        bytes.extend_from_slice(&(branch_pcs.len() as u16).to_ne_bytes());
        bytes.extend_from_slice(&0u16.to_ne_bytes());
        for pc in inline_cache_pcs {
            bytes.extend_from_slice(&pc.to_ne_bytes());
            bytes.extend_from_slice(&0u32.to_ne_bytes());
            bytes.extend_from_slice(&[0u8; INLINE_CACHE_SIZE * size_of::<usize>()]);
        }
        for pc in branch_pcs {
            bytes.extend_from_slice(&pc.to_ne_bytes());
            bytes.extend_from_slice(&0u32.to_ne_bytes());
        }
        bytes
    }

    #[inline]
    pub fn method(&self) -> MethodHandle {
        MethodHandle::from_addr(self.method)
    }

    #[inline]
    pub fn baseline_hotness(&self) -> u16 {
        self.baseline_hotness.load(Ordering::Relaxed)
    }

    pub fn set_baseline_hotness(&self, value: u16) {
        self.baseline_hotness.store(value, Ordering::Relaxed);
    }

    /// Count one more hot event; saturates at zero. Returns the new value.
    pub fn decrement_hotness(&self) -> u16 {
        let previous = self
            .baseline_hotness
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn inline_caches(&self) -> &[InlineCache] {
        // SAFETY: `num_inline_caches` caches directly follow the header.
        unsafe {
            let first = (self as *const Self).add(1).cast::<InlineCache>();
            std::slice::from_raw_parts(first, self.num_inline_caches as usize)
        }
    }

    pub fn branch_caches(&self) -> &[BranchCache] {
        let caches = self.inline_caches();
        // SAFETY: `num_branches` counters follow the inline caches.
        unsafe {
            let first = caches.as_ptr().add(caches.len()).cast::<BranchCache>();
            std::slice::from_raw_parts(first, self.num_branches as usize)
        }
    }

    pub fn inline_cache(&self, dex_pc: u32) -> Option<&InlineCache> {
        self.inline_caches().iter().find(|ic| ic.dex_pc == dex_pc)
    }

    pub fn branch_cache(&self, dex_pc: u32) -> Option<&BranchCache> {
        self.branch_caches().iter().find(|bc| bc.dex_pc == dex_pc)
    }
}

impl InlineCache {
    #[inline]
    pub fn dex_pc(&self) -> u32 {
        self.dex_pc
    }

    /// Remember `class` as a receiver. No-op when already present or full.
    pub fn update(&self, class: ObjectRef) {
        if !class.is_object() {
            return;
        }
        for slot in &self.classes {
            match slot.compare_exchange(0, class.addr(), Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(existing) if existing == class.addr() => return,
                Err(_) => {}
            }
        }
    }

    /// Classes currently recorded.
    pub fn classes(&self) -> SmallVec<[ObjectRef; INLINE_CACHE_SIZE]> {
        self.classes
            .iter()
            .map(|slot| ObjectRef::from_addr(slot.load(Ordering::Acquire)))
            .filter(|class| class.is_object())
            .collect()
    }

    /// Every slot holds a class.
    pub fn is_megamorphic(&self) -> bool {
        self.classes.iter().all(|slot| slot.load(Ordering::Acquire) != 0)
    }

    /// Clear or update classes after a GC marked the heap.
    pub(crate) fn sweep(&self, is_marked: &mut dyn FnMut(ObjectRef) -> Option<ObjectRef>) {
        for slot in &self.classes {
            let class = ObjectRef::from_addr(slot.load(Ordering::Relaxed));
            if !class.is_object() {
                continue;
            }
            match is_marked(class) {
                None => slot.store(0, Ordering::Relaxed),
                Some(moved) if moved != class => slot.store(moved.addr(), Ordering::Relaxed),
                Some(_) => {}
            }
        }
    }
}

impl BranchCache {
    #[inline]
    pub fn dex_pc(&self) -> u32 {
        self.dex_pc
    }

    /// Count one execution of the branch; counters saturate.
    pub fn record(&self, taken: bool) {
        let counter = if taken { &self.taken } else { &self.not_taken };
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_add(1));
    }

    pub fn taken(&self) -> u16 {
        self.taken.load(Ordering::Relaxed)
    }

    pub fn not_taken(&self) -> u16 {
        self.not_taken.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Export
// =============================================================================

/// A class as seen from the profiled method's package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfiledClass {
    pub package: PackageId,
    pub type_index: u32,
}

/// Exported inline cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfiledInlineCache {
    pub dex_pc: u32,
    pub classes: Vec<ProfiledClass>,
    /// Some receiver class cannot be named from the method's package.
    pub is_missing_types: bool,
    pub is_megamorphic: bool,
}

/// Exported profile of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfiledMethod {
    pub method: MethodHandle,
    pub inline_caches: Vec<ProfiledInlineCache>,
}

impl JitCodeCache {
    /// Allocate the profiling record of `method`, or return the existing one.
    ///
    /// The pointer stays valid until the method is removed with
    /// [`JitCodeCache::remove_methods_in`] or the process forks.
    pub fn add_profiling_record(
        &self,
        method: MethodHandle,
        inline_cache_pcs: &[u32],
        branch_pcs: &[u32],
    ) -> Option<NonNull<ProfilingRecord>> {
        let mut state = self.state.lock();
        if let Some(&existing) = state.profiling.get(&method) {
            return NonNull::new(existing as *mut ProfilingRecord);
        }
        let space = state.space.as_mut()?;
        let bytes = ProfilingRecord::encode(method, inline_cache_pcs, branch_pcs);
        let addr = match space.allocate_data(bytes.len()) {
            Some(addr) => addr,
            None if space.grow() => {
                self.stats.record_capacity_increase();
                space.allocate_data(bytes.len())?
            }
            None => {
                tracing::debug!(?method, "no room for profiling record");
                return None;
            }
        };
        space.region().write_data(addr, &bytes);
        state.profiling.insert(method, addr);
        NonNull::new(addr as *mut ProfilingRecord)
    }

    /// The profiling record of `method`, if one was allocated.
    pub fn profiling_record(&self, method: MethodHandle) -> Option<NonNull<ProfilingRecord>> {
        let state = self.state.lock();
        state
            .profiling
            .get(&method)
            .and_then(|&addr| NonNull::new(addr as *mut ProfilingRecord))
    }

    /// Profiles worth exporting: methods with live compiled code and a
    /// record whose hotness counter dropped below `threshold`.
    pub fn get_profiled_methods(&self, threshold: u16) -> Vec<ProfiledMethod> {
        let state = self.state.lock();
        let index = self.index.read();
        let mut out = Vec::new();
        for (&method, &addr) in &state.profiling {
            let live = index
                .code
                .entries_for(method)
                .iter()
                .any(|&entry| !state.zombies.contains(entry));
            if !live {
                continue;
            }
            // SAFETY: records stay allocated while listed in `profiling`.
            let record = unsafe { &*(addr as *const ProfilingRecord) };
            if record.baseline_hotness() >= threshold {
                continue;
            }
            let package = self.host.method_info(method).package;
            let inline_caches = record
                .inline_caches()
                .iter()
                .map(|ic| self.export_inline_cache(ic, package))
                .collect();
            out.push(ProfiledMethod {
                method,
                inline_caches,
            });
        }
        out.sort_unstable_by_key(|p| p.method);
        out
    }

    fn export_inline_cache(&self, ic: &InlineCache, package: PackageId) -> ProfiledInlineCache {
        let mut exported = ProfiledInlineCache {
            dex_pc: ic.dex_pc(),
            classes: Vec::new(),
            is_missing_types: false,
            is_megamorphic: ic.is_megamorphic(),
        };
        for class in ic.classes() {
            let info = self.host.class_info(class);
            let type_index = if info.package == package {
                Some(info.type_index)
            } else if info.is_array {
                self.host.find_type_index(package, &info.descriptor)
            } else {
                None
            };
            match type_index {
                Some(type_index) => exported.classes.push(ProfiledClass {
                    package,
                    type_index,
                }),
                None => exported.is_missing_types = true,
            }
        }
        exported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(size_of::<ProfilingRecord>(), 16);
        assert_eq!(size_of::<InlineCache>(), 48);
        assert_eq!(size_of::<BranchCache>(), 8);
        assert_eq!(ProfilingRecord::size_for(2, 3), 16 + 96 + 24);
    }

    #[test]
    fn test_encoded_record_reads_back() {
        let bytes = ProfilingRecord::encode(MethodHandle::from_addr(0x40), &[3, 9], &[12]);
        // Re-home the bytes at an 8-aligned address.
        let mut storage = vec![0u64; bytes.len().div_ceil(8)];
        let base = storage.as_mut_ptr().cast::<u8>();
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), base, bytes.len()) };
        let record = unsafe { &*(base as *const ProfilingRecord) };

        assert_eq!(record.method(), MethodHandle::from_addr(0x40));
        assert_eq!(record.baseline_hotness(), u16::MAX);
        assert_eq!(record.inline_caches().len(), 2);
        assert_eq!(record.inline_caches()[1].dex_pc(), 9);
        assert_eq!(record.branch_caches().len(), 1);
        assert_eq!(record.branch_cache(12).unwrap().taken(), 0);

        let ic = record.inline_cache(3).unwrap();
        ic.update(ObjectRef::from_addr(0x1000));
        ic.update(ObjectRef::from_addr(0x1000));
        ic.update(ObjectRef::NULL);
        assert_eq!(ic.classes().as_slice(), &[ObjectRef::from_addr(0x1000)]);
        assert!(!ic.is_megamorphic());
        for class in 2..=6 {
            ic.update(ObjectRef::from_addr(class * 0x1000));
        }
        assert!(ic.is_megamorphic());
        assert_eq!(ic.classes().len(), INLINE_CACHE_SIZE);

        let branch = record.branch_cache(12).unwrap();
        branch.record(true);
        branch.record(true);
        branch.record(false);
        assert_eq!((branch.taken(), branch.not_taken()), (2, 1));
        drop(storage);
    }

    #[test]
    fn test_hotness_counts_down_and_saturates() {
        let bytes = ProfilingRecord::encode(MethodHandle::from_addr(8), &[], &[]);
        let mut storage = [0u64; 2];
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), storage.as_mut_ptr().cast::<u8>(), 16)
        };
        let record = unsafe { &*(storage.as_ptr() as *const ProfilingRecord) };
        assert_eq!(record.decrement_hotness(), u16::MAX - 1);
        record.set_baseline_hotness(1);
        assert_eq!(record.decrement_hotness(), 0);
        assert_eq!(record.decrement_hotness(), 0);
    }

    #[test]
    fn test_sweep_clears_dead_classes() {
        let bytes = ProfilingRecord::encode(MethodHandle::from_addr(8), &[1], &[]);
        let mut storage = vec![0u64; bytes.len() / 8];
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), storage.as_mut_ptr().cast::<u8>(), bytes.len())
        };
        let record = unsafe { &*(storage.as_ptr() as *const ProfilingRecord) };
        let ic = &record.inline_caches()[0];
        ic.update(ObjectRef::from_addr(0x1000));
        ic.update(ObjectRef::from_addr(0x2000));
        ic.sweep(&mut |class| match class.addr() {
            0x1000 => None,
            _ => Some(ObjectRef::from_addr(0x3000)),
        });
        assert_eq!(ic.classes().as_slice(), &[ObjectRef::from_addr(0x3000)]);
    }
}
