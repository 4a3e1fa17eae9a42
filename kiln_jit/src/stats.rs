//! Code cache statistics.
//!
//! Counters are updated with relaxed atomics from compiler threads, the
//! collector and the GC. Byte accounting lives in the pools and is sampled
//! into a [`CodeCacheSnapshot`] under the cache lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::blob::CompilationKind;

/// Counters of code cache activity.
#[derive(Debug)]
pub struct CodeCacheStats {
    // =========================================================================
    // Compilation
    // =========================================================================
    /// Committed baseline blobs.
    pub baseline_compilations: AtomicU64,
    /// Committed optimized blobs.
    pub optimized_compilations: AtomicU64,
    /// Committed OSR blobs.
    pub osr_compilations: AtomicU64,
    /// Committed shared native stubs.
    pub jni_stubs: AtomicU64,
    /// Commits thrown away (assumption broken, movable root, stale region).
    pub commits_discarded: AtomicU64,

    // =========================================================================
    // Capacity
    // =========================================================================
    /// Times the region doubled.
    pub capacity_increases: AtomicU64,
    /// Reservations refused at maximum capacity.
    pub reservation_failures: AtomicU64,

    // =========================================================================
    // Collection
    // =========================================================================
    pub collections: AtomicU64,
    /// Retired blobs freed.
    pub blobs_freed: AtomicU64,
    /// Retired blobs still installed and put back for the next cycle.
    pub blobs_requeued: AtomicU64,
    /// Retired blobs found on a stack and kept.
    pub blobs_kept: AtomicU64,
    /// Blobs retired by invalidation.
    pub invalidations: AtomicU64,
    /// Total time spent collecting (nanoseconds).
    pub collection_time_ns: AtomicU64,
}

impl CodeCacheStats {
    pub const fn new() -> Self {
        Self {
            baseline_compilations: AtomicU64::new(0),
            optimized_compilations: AtomicU64::new(0),
            osr_compilations: AtomicU64::new(0),
            jni_stubs: AtomicU64::new(0),
            commits_discarded: AtomicU64::new(0),
            capacity_increases: AtomicU64::new(0),
            reservation_failures: AtomicU64::new(0),
            collections: AtomicU64::new(0),
            blobs_freed: AtomicU64::new(0),
            blobs_requeued: AtomicU64::new(0),
            blobs_kept: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            collection_time_ns: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_compilation(&self, kind: CompilationKind) {
        let counter = match kind {
            CompilationKind::Baseline => &self.baseline_compilations,
            CompilationKind::Optimized => &self.optimized_compilations,
            CompilationKind::Osr => &self.osr_compilations,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_jni_stub(&self) {
        self.jni_stubs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_discard(&self) {
        self.commits_discarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_capacity_increase(&self) {
        self.capacity_increases.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reservation_failure(&self) {
        self.reservation_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished collection.
    pub fn record_collection(&self, freed: u64, kept: u64, requeued: u64, duration: Duration) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.blobs_freed.fetch_add(freed, Ordering::Relaxed);
        self.blobs_kept.fetch_add(kept, Ordering::Relaxed);
        self.blobs_requeued.fetch_add(requeued, Ordering::Relaxed);
        self.collection_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Total committed blobs of every kind, native stubs included.
    pub fn total_compilations(&self) -> u64 {
        self.baseline_compilations.load(Ordering::Relaxed)
            + self.optimized_compilations.load(Ordering::Relaxed)
            + self.osr_compilations.load(Ordering::Relaxed)
            + self.jni_stubs.load(Ordering::Relaxed)
    }

    pub fn total_collection_time(&self) -> Duration {
        Duration::from_nanos(self.collection_time_ns.load(Ordering::Relaxed))
    }
}

impl Default for CodeCacheStats {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time copy of the counters plus byte accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeCacheSnapshot {
    pub baseline_compilations: u64,
    pub optimized_compilations: u64,
    pub osr_compilations: u64,
    pub jni_stubs: u64,
    pub commits_discarded: u64,
    pub capacity_increases: u64,
    pub reservation_failures: u64,
    pub collections: u64,
    pub blobs_freed: u64,
    pub blobs_requeued: u64,
    pub blobs_kept: u64,
    pub invalidations: u64,
    pub collection_time: Duration,

    /// Current usable bytes of the private region (code + data).
    pub capacity: usize,
    pub code_used: usize,
    pub code_resident: usize,
    pub data_used: usize,
    pub data_resident: usize,
    /// Blobs in the private index.
    pub indexed_blobs: usize,
    /// Shared native stubs.
    pub jni_entries: usize,
    /// Retired blobs not freed yet.
    pub zombies: usize,
}

impl CodeCacheStats {
    /// Copy the counters; byte accounting is left zero.
    pub fn snapshot(&self) -> CodeCacheSnapshot {
        CodeCacheSnapshot {
            baseline_compilations: self.baseline_compilations.load(Ordering::Relaxed),
            optimized_compilations: self.optimized_compilations.load(Ordering::Relaxed),
            osr_compilations: self.osr_compilations.load(Ordering::Relaxed),
            jni_stubs: self.jni_stubs.load(Ordering::Relaxed),
            commits_discarded: self.commits_discarded.load(Ordering::Relaxed),
            capacity_increases: self.capacity_increases.load(Ordering::Relaxed),
            reservation_failures: self.reservation_failures.load(Ordering::Relaxed),
            collections: self.collections.load(Ordering::Relaxed),
            blobs_freed: self.blobs_freed.load(Ordering::Relaxed),
            blobs_requeued: self.blobs_requeued.load(Ordering::Relaxed),
            blobs_kept: self.blobs_kept.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            collection_time: self.total_collection_time(),
            ..Default::default()
        }
    }
}

impl fmt::Display for CodeCacheSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Code Cache ===")?;
        writeln!(f, "Capacity: {}", format_bytes(self.capacity as u64))?;
        writeln!(
            f,
            "Code: {} used, {} resident",
            format_bytes(self.code_used as u64),
            format_bytes(self.code_resident as u64)
        )?;
        writeln!(
            f,
            "Data: {} used, {} resident",
            format_bytes(self.data_used as u64),
            format_bytes(self.data_resident as u64)
        )?;
        writeln!(
            f,
            "Compilations: {} baseline, {} optimized, {} osr, {} jni",
            self.baseline_compilations, self.optimized_compilations, self.osr_compilations, self.jni_stubs
        )?;
        writeln!(
            f,
            "Index: {} blobs, {} jni stubs, {} zombies",
            self.indexed_blobs, self.jni_entries, self.zombies
        )?;
        writeln!(
            f,
            "Collections: {} ({:?}), {} freed, {} kept, {} requeued",
            self.collections, self.collection_time, self.blobs_freed, self.blobs_kept, self.blobs_requeued
        )?;
        write!(
            f,
            "Discarded commits: {}, invalidations: {}, capacity increases: {}, failed reservations: {}",
            self.commits_discarded, self.invalidations, self.capacity_increases, self.reservation_failures
        )
    }
}

/// Format bytes in human-readable form.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compilation_counters() {
        let stats = CodeCacheStats::new();
        stats.record_compilation(CompilationKind::Baseline);
        stats.record_compilation(CompilationKind::Optimized);
        stats.record_compilation(CompilationKind::Optimized);
        stats.record_jni_stub();
        assert_eq!(stats.optimized_compilations.load(Ordering::Relaxed), 2);
        assert_eq!(stats.total_compilations(), 4);
    }

    #[test]
    fn test_collection_recording() {
        let stats = CodeCacheStats::new();
        stats.record_collection(3, 1, 2, Duration::from_micros(100));
        stats.record_collection(1, 0, 0, Duration::from_micros(50));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.collections, 2);
        assert_eq!(snapshot.blobs_freed, 4);
        assert_eq!(snapshot.blobs_kept, 1);
        assert_eq!(snapshot.blobs_requeued, 2);
        assert_eq!(snapshot.collection_time, Duration::from_micros(150));
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = CodeCacheSnapshot {
            capacity: 64 * 1024,
            code_used: 512,
            ..Default::default()
        };
        let text = snapshot.to_string();
        assert!(text.contains("Capacity: 64.00 KB"));
        assert!(text.contains("Code: 512 bytes used"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }
}
