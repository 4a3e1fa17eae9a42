//! Shared stubs for native methods.
//!
//! Native methods with the same signature shape and flags can share one
//! compiled transition stub. The table is keyed by [`JniStubKey`]; each entry
//! owns the stub's code (once compiled) and the list of methods using it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::host::{MethodFlags, MethodHandle, MethodInfo};

// =============================================================================
// JniStubKey
// =============================================================================

/// Signature shape of a native method.
///
/// The shorty is shared with one of the methods using the stub and rebound
/// when that method goes away.
#[derive(Debug, Clone)]
pub struct JniStubKey {
    shorty: Arc<str>,
    is_static: bool,
    is_fast_native: bool,
    is_critical_native: bool,
    is_synchronized: bool,
}

impl JniStubKey {
    pub fn new(info: &MethodInfo) -> Self {
        Self {
            shorty: Arc::clone(&info.shorty),
            is_static: info.flags.contains(MethodFlags::STATIC),
            is_fast_native: info.flags.contains(MethodFlags::FAST_NATIVE),
            is_critical_native: info.flags.contains(MethodFlags::CRITICAL_NATIVE),
            is_synchronized: info.flags.contains(MethodFlags::SYNCHRONIZED),
        }
    }

    #[inline]
    pub fn shorty(&self) -> &Arc<str> {
        &self.shorty
    }

    fn flag_tuple(&self) -> (bool, bool, bool, bool) {
        (
            self.is_static,
            self.is_fast_native,
            self.is_critical_native,
            self.is_synchronized,
        )
    }

    fn rebound(&self, shorty: Arc<str>) -> Self {
        debug_assert_eq!(*shorty, *self.shorty);
        Self {
            shorty,
            ..self.clone()
        }
    }
}

impl PartialEq for JniStubKey {
    fn eq(&self, other: &Self) -> bool {
        self.flag_tuple() == other.flag_tuple() && *self.shorty == *other.shorty
    }
}

impl Eq for JniStubKey {}

impl Hash for JniStubKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.flag_tuple().hash(state);
        self.shorty.hash(state);
    }
}

impl Ord for JniStubKey {
    /// Flags first, then the argument characters, then the return type.
    fn cmp(&self, other: &Self) -> Ordering {
        fn split(s: &str) -> (&str, &str) {
            s.split_at(s.len().min(1))
        }
        let (self_ret, self_args) = split(&self.shorty);
        let (other_ret, other_args) = split(&other.shorty);
        self.flag_tuple()
            .cmp(&other.flag_tuple())
            .then_with(|| self_args.cmp(other_args))
            .then_with(|| self_ret.cmp(other_ret))
    }
}

impl PartialOrd for JniStubKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// =============================================================================
// JniStubTable
// =============================================================================

/// One shared stub.
#[derive(Debug, Default)]
pub struct JniStubData {
    code: Option<usize>,
    methods: SmallVec<[(MethodHandle, Arc<str>); 4]>,
}

impl JniStubData {
    /// Entry point, once compiled.
    #[inline]
    pub fn code(&self) -> Option<usize> {
        self.code
    }

    pub fn methods(&self) -> impl Iterator<Item = MethodHandle> + '_ {
        self.methods.iter().map(|(method, _)| *method)
    }

    #[inline]
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

/// Outcome of [`JniStubTable::remove_method`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JniRemoval {
    /// The method was not in the entry.
    NotFound,
    /// Other methods still use the stub.
    Kept,
    /// The entry is gone; its code, if any, must be retired.
    Dropped(Option<usize>),
}

/// Ordered table of shared native stubs.
///
/// Stubs unbound from their entry stay listed as retired until the collector
/// frees them, so PCs inside them still resolve.
#[derive(Debug, Default)]
pub struct JniStubTable {
    stubs: BTreeMap<JniStubKey, JniStubData>,
    retired: BTreeSet<usize>,
}

impl JniStubTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure an entry for `key` exists.
    ///
    /// Returns true when the stub still needs compiling.
    pub fn intern(&mut self, key: &JniStubKey) -> bool {
        self.stubs.entry(key.clone()).or_default().code.is_none()
    }

    /// Record `method` as a user of the stub, once.
    pub fn add_method(&mut self, key: &JniStubKey, method: MethodHandle) {
        let data = self.stubs.entry(key.clone()).or_default();
        if !data.methods.iter().any(|(m, _)| *m == method) {
            data.methods.push((method, Arc::clone(&key.shorty)));
        }
    }

    /// Stop tracking `method` as a user of the stub.
    ///
    /// An entry left without methods is dropped; otherwise the key is rebound
    /// to the shorty of the new first method.
    pub fn remove_method(&mut self, key: &JniStubKey, method: MethodHandle) -> JniRemoval {
        let Some((stored_key, mut data)) = self.stubs.remove_entry(key) else {
            return JniRemoval::NotFound;
        };
        let before = data.methods.len();
        data.methods.retain(|(m, _)| *m != method);
        if data.methods.len() == before {
            self.stubs.insert(stored_key, data);
            return JniRemoval::NotFound;
        }
        match data.methods.first() {
            None => JniRemoval::Dropped(data.code),
            Some((_, shorty)) => {
                let key = stored_key.rebound(Arc::clone(shorty));
                self.stubs.insert(key, data);
                JniRemoval::Kept
            }
        }
    }

    /// Install compiled code; returns the previous code, if any.
    pub fn set_code(&mut self, key: &JniStubKey, code: usize) -> Option<usize> {
        self.stubs.entry(key.clone()).or_default().code.replace(code)
    }

    #[inline]
    pub fn get(&self, key: &JniStubKey) -> Option<&JniStubData> {
        self.stubs.get(key)
    }

    /// The stored key equal to `key`, carrying its current shorty binding.
    pub fn stored_key(&self, key: &JniStubKey) -> Option<&JniStubKey> {
        self.stubs.get_key_value(key).map(|(k, _)| k)
    }

    /// Entry point of the compiled stub for `key`.
    pub fn code_for(&self, key: &JniStubKey) -> Option<usize> {
        self.stubs.get(key).and_then(|data| data.code)
    }

    /// Whether some compiled stub has its entry at `code`.
    pub fn contains_code(&self, code: usize) -> bool {
        self.stubs.values().any(|data| data.code == Some(code))
    }

    /// Compiled entries in key order.
    pub fn codes(&self) -> impl Iterator<Item = usize> + '_ {
        self.stubs.values().filter_map(|data| data.code)
    }

    /// Keep resolving `code` after it left its entry.
    pub fn retire(&mut self, code: usize) {
        self.retired.insert(code);
    }

    /// `code` was freed.
    pub fn forget_retired(&mut self, code: usize) -> bool {
        self.retired.remove(&code)
    }

    /// Retired stubs not yet freed, in address order.
    pub fn retired_codes(&self) -> impl Iterator<Item = usize> + '_ {
        self.retired.iter().copied()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&JniStubKey, &JniStubData)> {
        self.stubs.iter()
    }

    /// Remove every method matching `pred`; returns the code of entries that
    /// lost all their methods.
    pub fn remove_methods_where(&mut self, mut pred: impl FnMut(MethodHandle) -> bool) -> Vec<usize> {
        let mut retired = Vec::new();
        let keys: Vec<(JniStubKey, Vec<MethodHandle>)> = self
            .stubs
            .iter()
            .map(|(key, data)| (key.clone(), data.methods().filter(|&m| pred(m)).collect()))
            .filter(|(_, doomed): &(JniStubKey, Vec<MethodHandle>)| !doomed.is_empty())
            .collect();
        for (key, doomed) in keys {
            for method in doomed {
                if let JniRemoval::Dropped(Some(code)) = self.remove_method(&key, method) {
                    retired.push(code);
                }
            }
        }
        retired
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }

    pub fn clear(&mut self) {
        self.stubs.clear();
        self.retired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ObjectRef, PackageId};

    fn info(shorty: &str, flags: MethodFlags) -> MethodInfo {
        MethodInfo {
            shorty: Arc::from(shorty),
            flags: flags | MethodFlags::NATIVE,
            declaring_class: ObjectRef::NULL,
            package: PackageId(0),
        }
    }

    fn shorties(table: &JniStubTable) -> Vec<String> {
        table.iter().map(|(k, _)| k.shorty().to_string()).collect()
    }

    #[test]
    fn test_key_ordering() {
        let mut table = JniStubTable::new();
        for (i, shorty) in ["VV", "ILJ", "V"].into_iter().enumerate() {
            let key = JniStubKey::new(&info(shorty, MethodFlags::STATIC));
            table.intern(&key);
            table.add_method(&key, MethodHandle::from_addr(0x100 + i));
        }
        assert_eq!(shorties(&table), ["V", "ILJ", "VV"]);
    }

    #[test]
    fn test_flags_dominate_ordering() {
        let instance = JniStubKey::new(&info("V", MethodFlags::empty()));
        let fast = JniStubKey::new(&info("V", MethodFlags::FAST_NATIVE));
        let statik = JniStubKey::new(&info("V", MethodFlags::STATIC));
        assert!(instance < fast);
        assert!(fast < statik);
        assert_ne!(instance, statik);
    }

    #[test]
    fn test_add_method_deduplicates() {
        let mut table = JniStubTable::new();
        let key = JniStubKey::new(&info("IJ", MethodFlags::STATIC));
        assert!(table.intern(&key));
        table.add_method(&key, MethodHandle::from_addr(1));
        table.add_method(&key, MethodHandle::from_addr(1));
        assert_eq!(table.get(&key).unwrap().method_count(), 1);

        assert_eq!(table.set_code(&key, 0x4000), None);
        assert!(!table.intern(&key));
        assert_eq!(table.code_for(&key), Some(0x4000));
    }

    #[test]
    fn test_remove_rebinds_shorty_to_front() {
        let mut table = JniStubTable::new();
        let first = info("IJ", MethodFlags::STATIC);
        let second = info("IJ", MethodFlags::STATIC);
        let key_a = JniStubKey::new(&first);
        let key_b = JniStubKey::new(&second);
        assert_eq!(key_a, key_b);

        table.add_method(&key_a, MethodHandle::from_addr(1));
        table.add_method(&key_b, MethodHandle::from_addr(2));
        assert!(Arc::ptr_eq(table.stored_key(&key_a).unwrap().shorty(), &first.shorty));

        assert_eq!(table.remove_method(&key_a, MethodHandle::from_addr(1)), JniRemoval::Kept);
        let stored = table.stored_key(&key_a).unwrap();
        assert!(Arc::ptr_eq(stored.shorty(), &second.shorty));
        assert_eq!(table.get(&key_a).unwrap().method_count(), 1);
    }

    #[test]
    fn test_remove_last_method_drops_entry() {
        let mut table = JniStubTable::new();
        let key = JniStubKey::new(&info("V", MethodFlags::STATIC));
        table.add_method(&key, MethodHandle::from_addr(1));
        table.set_code(&key, 0x8000);
        assert_eq!(
            table.remove_method(&key, MethodHandle::from_addr(9)),
            JniRemoval::NotFound
        );
        assert_eq!(
            table.remove_method(&key, MethodHandle::from_addr(1)),
            JniRemoval::Dropped(Some(0x8000))
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_methods_where_retires_empty_entries() {
        let mut table = JniStubTable::new();
        let shared = JniStubKey::new(&info("V", MethodFlags::STATIC));
        let single = JniStubKey::new(&info("J", MethodFlags::STATIC));
        table.add_method(&shared, MethodHandle::from_addr(0x10));
        table.add_method(&shared, MethodHandle::from_addr(0x90));
        table.add_method(&single, MethodHandle::from_addr(0x20));
        table.set_code(&shared, 0x1000);
        table.set_code(&single, 0x2000);

        let retired = table.remove_methods_where(|m| m.addr() < 0x80);
        assert_eq!(retired, vec![0x2000]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.code_for(&shared), Some(0x1000));
    }

    #[test]
    fn test_retired_stubs_are_tracked_until_forgotten() {
        let mut table = JniStubTable::new();
        let key = JniStubKey::new(&info("V", MethodFlags::STATIC));
        table.set_code(&key, 0x1000);
        let old = table.set_code(&key, 0x2000).unwrap();
        table.retire(old);
        assert_eq!(table.codes().collect::<Vec<_>>(), [0x2000]);
        assert_eq!(table.retired_codes().collect::<Vec<_>>(), [0x1000]);

        assert!(table.forget_retired(0x1000));
        assert!(!table.forget_retired(0x1000));
        assert_eq!(table.retired_codes().count(), 0);
    }
}
