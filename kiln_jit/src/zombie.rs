//! Retired code and the live bitmap used to free it.
//!
//! Retiring a blob moves it into the pending set. A collection first moves
//! the pending set into the processed set, then marks every blob found on a
//! thread stack in the [`LiveBitmap`], and finally frees processed blobs whose
//! bit stayed clear. Marked blobs stay processed and are checked again by the
//! next collection.

use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::blob::CODE_ALIGNMENT;
use crate::host::MethodHandle;

// =============================================================================
// ZombieSet
// =============================================================================

/// Retired blobs waiting to be freed.
///
/// Code zombies remember the method they belonged to; JNI zombies are shared
/// stubs without an owner.
#[derive(Debug, Default)]
pub struct ZombieSet {
    pending_code: FxHashMap<usize, MethodHandle>,
    processed_code: FxHashMap<usize, MethodHandle>,
    pending_jni: FxHashSet<usize>,
    processed_jni: FxHashSet<usize>,
}

impl ZombieSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retire a method's blob. Returns false if it was already retired.
    pub fn add_code(&mut self, entry: usize, method: MethodHandle) -> bool {
        if self.processed_code.contains_key(&entry) {
            return false;
        }
        self.pending_code.insert(entry, method).is_none()
    }

    /// Retire a shared native stub. Returns false if it was already retired.
    pub fn add_jni(&mut self, entry: usize) -> bool {
        !self.processed_jni.contains(&entry) && self.pending_jni.insert(entry)
    }

    /// Whether `entry` is retired, pending or processed.
    pub fn contains(&self, entry: usize) -> bool {
        self.pending_code.contains_key(&entry)
            || self.processed_code.contains_key(&entry)
            || self.pending_jni.contains(&entry)
            || self.processed_jni.contains(&entry)
    }

    /// Retired blobs not yet seen by a collection.
    pub fn pending_len(&self) -> usize {
        self.pending_code.len() + self.pending_jni.len()
    }

    /// Retired blobs a collection has seen but could not free yet.
    pub fn processed_len(&self) -> usize {
        self.processed_code.len() + self.processed_jni.len()
    }

    pub fn len(&self) -> usize {
        self.pending_len() + self.processed_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a collection: everything pending becomes processed.
    pub fn begin_cycle(&mut self) {
        self.processed_code.extend(self.pending_code.drain());
        self.processed_jni.extend(self.pending_jni.drain());
    }

    /// Move a processed code zombie back to pending.
    pub fn requeue(&mut self, entry: usize) {
        if let Some(method) = self.processed_code.remove(&entry) {
            self.pending_code.insert(entry, method);
        }
    }

    /// Add straight to the processed set (OSR code drained by a collection).
    pub fn add_processed_code(&mut self, entry: usize, method: MethodHandle) {
        self.pending_code.remove(&entry);
        self.processed_code.insert(entry, method);
    }

    pub fn processed_code(&self) -> impl Iterator<Item = (usize, MethodHandle)> + '_ {
        self.processed_code.iter().map(|(&entry, &method)| (entry, method))
    }

    pub fn processed_jni(&self) -> impl Iterator<Item = usize> + '_ {
        self.processed_jni.iter().copied()
    }

    /// Drop a zombie from every set; used once its blob was freed.
    pub fn forget(&mut self, entry: usize) {
        self.pending_code.remove(&entry);
        self.processed_code.remove(&entry);
        self.pending_jni.remove(&entry);
        self.processed_jni.remove(&entry);
    }

    pub fn clear(&mut self) {
        self.pending_code.clear();
        self.processed_code.clear();
        self.pending_jni.clear();
        self.processed_jni.clear();
    }
}

// =============================================================================
// LiveBitmap
// =============================================================================

/// One bit per [`CODE_ALIGNMENT`] bytes of a code arena.
///
/// Bits are set concurrently by mutator threads running the marking
/// checkpoint.
#[derive(Debug)]
pub struct LiveBitmap {
    base: usize,
    limit: usize,
    words: Box<[AtomicU64]>,
}

impl LiveBitmap {
    /// Cover `base..base + len`.
    pub fn new(base: usize, len: usize) -> Self {
        let bits = len.div_ceil(CODE_ALIGNMENT);
        let words = (0..bits.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self {
            base,
            limit: base + len,
            words,
        }
    }

    #[inline]
    pub fn covers(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.limit
    }

    #[inline]
    fn slot(&self, addr: usize) -> (usize, u64) {
        let bit = (addr - self.base) / CODE_ALIGNMENT;
        (bit / 64, 1u64 << (bit % 64))
    }

    /// Atomically set the bit of `addr`; returns whether it was already set.
    ///
    /// Addresses outside the bitmap are ignored.
    pub fn mark(&self, addr: usize) -> bool {
        if !self.covers(addr) {
            return false;
        }
        let (word, mask) = self.slot(addr);
        self.words[word].fetch_or(mask, Ordering::Relaxed) & mask != 0
    }

    pub fn is_marked(&self, addr: usize) -> bool {
        if !self.covers(addr) {
            return false;
        }
        let (word, mask) = self.slot(addr);
        self.words[word].load(Ordering::Relaxed) & mask != 0
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }
}
