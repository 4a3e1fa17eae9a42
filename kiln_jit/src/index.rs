//! Entry point ↔ method index of the private region.
//!
//! The index is ordered by entry point so that a PC inside a blob resolves
//! with one floor lookup. A reverse map lists every blob of a method (a
//! method may have several variants alive at once: a retired one still on
//! some stack, a baseline and an optimized one) and a separate map holds the
//! current OSR variant of each method.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::blob::CompilationKind;
use crate::host::MethodHandle;

/// What the index remembers about a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedBlob {
    pub method: MethodHandle,
    pub kind: CompilationKind,
    pub code_size: u32,
}

impl IndexedBlob {
    #[inline]
    fn covers(&self, entry: usize, pc: usize) -> bool {
        pc >= entry && pc < entry + self.code_size as usize
    }
}

/// Index of the blobs committed to the private region.
#[derive(Debug, Default)]
pub struct CodeIndex {
    by_entry: BTreeMap<usize, IndexedBlob>,
    by_method: FxHashMap<MethodHandle, SmallVec<[usize; 2]>>,
    osr: FxHashMap<MethodHandle, usize>,
}

impl CodeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a blob. OSR blobs also become the method's OSR entry; the OSR
    /// entry they replace is returned.
    pub fn insert(&mut self, entry: usize, blob: IndexedBlob) -> Option<usize> {
        let previous = self.by_entry.insert(entry, blob);
        debug_assert!(previous.is_none(), "entry {entry:#x} indexed twice");
        let entries = self.by_method.entry(blob.method).or_default();
        if !entries.contains(&entry) {
            entries.push(entry);
        }
        if blob.kind == CompilationKind::Osr {
            self.osr.insert(blob.method, entry).filter(|&old| old != entry)
        } else {
            None
        }
    }

    /// Forget the blob at `entry`.
    pub fn remove(&mut self, entry: usize) -> Option<IndexedBlob> {
        let blob = self.by_entry.remove(&entry)?;
        if let Some(entries) = self.by_method.get_mut(&blob.method) {
            entries.retain(|e| *e != entry);
            if entries.is_empty() {
                self.by_method.remove(&blob.method);
            }
        }
        if self.osr.get(&blob.method) == Some(&entry) {
            self.osr.remove(&blob.method);
        }
        Some(blob)
    }

    #[inline]
    pub fn get(&self, entry: usize) -> Option<&IndexedBlob> {
        self.by_entry.get(&entry)
    }

    #[inline]
    pub fn contains_entry(&self, entry: usize) -> bool {
        self.by_entry.contains_key(&entry)
    }

    /// The blob whose code covers `pc`.
    pub fn lookup_by_pc(&self, pc: usize) -> Option<(usize, &IndexedBlob)> {
        let (&entry, blob) = self.by_entry.range(..=pc).next_back()?;
        blob.covers(entry, pc).then_some((entry, blob))
    }

    /// The blob of `method` whose code covers `pc`.
    pub fn lookup_for_method(&self, pc: usize, method: MethodHandle) -> Option<(usize, &IndexedBlob)> {
        self.entries_for(method).iter().find_map(|&entry| {
            let blob = self.by_entry.get(&entry)?;
            blob.covers(entry, pc).then_some((entry, blob))
        })
    }

    /// Every indexed entry of `method`, oldest first.
    pub fn entries_for(&self, method: MethodHandle) -> &[usize] {
        self.by_method.get(&method).map_or(&[][..], |entries| entries.as_slice())
    }

    #[inline]
    pub fn osr_entry(&self, method: MethodHandle) -> Option<usize> {
        self.osr.get(&method).copied()
    }

    /// Stop offering OSR entry to `method`; the blob stays indexed.
    pub fn clear_osr(&mut self, method: MethodHandle) -> Option<usize> {
        self.osr.remove(&method)
    }

    /// Empty the OSR map, returning its (method, entry) pairs.
    pub fn take_osr(&mut self) -> Vec<(MethodHandle, usize)> {
        self.osr.drain().collect()
    }

    /// Call `f(entry, blob)` for every blob in entry order.
    pub fn visit_all(&self, mut f: impl FnMut(usize, &IndexedBlob)) {
        for (&entry, blob) in &self.by_entry {
            f(entry, blob);
        }
    }

    /// Methods with at least one indexed blob.
    pub fn methods(&self) -> impl Iterator<Item = MethodHandle> + '_ {
        self.by_method.keys().copied()
    }

    /// Remove every blob whose method matches `pred`; returns their entries.
    pub fn remove_methods_where(&mut self, mut pred: impl FnMut(MethodHandle) -> bool) -> Vec<usize> {
        let doomed: Vec<MethodHandle> = self.by_method.keys().copied().filter(|&m| pred(m)).collect();
        let mut removed = Vec::new();
        for method in doomed {
            if let Some(entries) = self.by_method.remove(&method) {
                for entry in entries {
                    self.by_entry.remove(&entry);
                    removed.push(entry);
                }
            }
            self.osr.remove(&method);
        }
        removed
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_entry.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_entry.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_entry.clear();
        self.by_method.clear();
        self.osr.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(method: usize, kind: CompilationKind, code_size: u32) -> IndexedBlob {
        IndexedBlob {
            method: MethodHandle::from_addr(method),
            kind,
            code_size,
        }
    }

    #[test]
    fn test_lookup_by_pc_covers_whole_blob() {
        let mut index = CodeIndex::new();
        index.insert(0x1000, blob(1, CompilationKind::Baseline, 0x40));
        index.insert(0x1100, blob(2, CompilationKind::Optimized, 0x20));

        assert_eq!(index.lookup_by_pc(0x1000).map(|(e, _)| e), Some(0x1000));
        assert_eq!(index.lookup_by_pc(0x103f).map(|(e, _)| e), Some(0x1000));
        assert!(index.lookup_by_pc(0x1040).is_none());
        assert!(index.lookup_by_pc(0xfff).is_none());
        assert_eq!(index.lookup_by_pc(0x111f).map(|(e, _)| e), Some(0x1100));
        assert!(index.lookup_by_pc(0x1120).is_none());
    }

    #[test]
    fn test_reverse_map_tracks_variants() {
        let mut index = CodeIndex::new();
        let method = MethodHandle::from_addr(7);
        index.insert(0x1000, blob(7, CompilationKind::Baseline, 0x10));
        index.insert(0x2000, blob(7, CompilationKind::Optimized, 0x10));
        assert_eq!(index.entries_for(method), &[0x1000, 0x2000]);
        assert_eq!(
            index.lookup_for_method(0x2008, method).map(|(e, _)| e),
            Some(0x2000)
        );

        index.remove(0x1000);
        assert_eq!(index.entries_for(method), &[0x2000]);
        index.remove(0x2000);
        assert!(index.entries_for(method).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_osr_replacement_returns_previous() {
        let mut index = CodeIndex::new();
        let method = MethodHandle::from_addr(3);
        assert_eq!(index.insert(0x1000, blob(3, CompilationKind::Osr, 0x10)), None);
        assert_eq!(index.insert(0x2000, blob(3, CompilationKind::Osr, 0x10)), Some(0x1000));
        assert_eq!(index.osr_entry(method), Some(0x2000));
        assert_eq!(index.take_osr(), vec![(method, 0x2000)]);
        assert_eq!(index.osr_entry(method), None);
        // Drained OSR blobs stay indexed until freed.
        assert!(index.contains_entry(0x2000));
    }

    #[test]
    fn test_remove_methods_where() {
        let mut index = CodeIndex::new();
        index.insert(0x1000, blob(0x10, CompilationKind::Baseline, 0x10));
        index.insert(0x2000, blob(0x20, CompilationKind::Baseline, 0x10));
        index.insert(0x3000, blob(0x30, CompilationKind::Osr, 0x10));
        let mut removed = index.remove_methods_where(|m| m.addr() >= 0x20);
        removed.sort_unstable();
        assert_eq!(removed, vec![0x2000, 0x3000]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.osr_entry(MethodHandle::from_addr(0x30)), None);
    }
}
