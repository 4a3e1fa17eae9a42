//! Collection of retired code.
//!
//! # State machine
//!
//! ```text
//!   Idle ──► Preparing ──► Marking ──► Sweeping ──► Idle
//!            (cache lock)  (no lock,   (cache lock,
//!                          checkpoint) index lock)
//! ```
//!
//! - **Preparing** moves pending zombies to the processed set, retires every
//!   OSR blob, and puts back any zombie whose method still enters it.
//! - **Marking** asks every mutator to walk its stack and mark each blob it
//!   is executing in the [`LiveBitmap`]; the collector waits on a barrier
//!   until all of them reported.
//! - **Sweeping** frees processed zombies left unmarked. Marked ones stay for
//!   the next cycle.
//!
//! Reservations block while a collection is in flight and are woken when it
//! returns to `Idle`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::cache::{CacheState, JitCodeCache};
use crate::host::{Checkpoint, Frame, StackWalker};
use crate::zombie::LiveBitmap;

/// Phase of the code collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CollectorState {
    Idle = 0,
    Preparing = 1,
    Marking = 2,
    Sweeping = 3,
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollectorState::Idle => "idle",
            CollectorState::Preparing => "preparing",
            CollectorState::Marking => "marking",
            CollectorState::Sweeping => "sweeping",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Checkpoint
// =============================================================================

/// Counts threads that finished a checkpoint.
#[derive(Debug, Default)]
pub(crate) struct CheckpointBarrier {
    passed: Mutex<usize>,
    cond: Condvar,
}

impl CheckpointBarrier {
    pub(crate) fn pass(&self) {
        let mut passed = self.passed.lock();
        *passed += 1;
        self.cond.notify_all();
    }

    /// Block until `threads` threads passed.
    pub(crate) fn wait_for(&self, threads: usize) {
        let mut passed = self.passed.lock();
        while *passed < threads {
            self.cond.wait(&mut passed);
        }
    }
}

/// Marks every blob found on the visited thread's stack.
struct MarkCodeClosure {
    cache: Arc<JitCodeCache>,
    bitmap: Arc<LiveBitmap>,
    barrier: Arc<CheckpointBarrier>,
}

impl Checkpoint for MarkCodeClosure {
    fn run(&self, thread: &dyn StackWalker) {
        thread.walk(&mut |frame: &Frame| {
            if frame.is_inlined || !self.bitmap.covers(frame.pc) {
                return;
            }
            if let Some(info) = self.cache.lookup_header(frame.pc, frame.method) {
                self.bitmap.mark(info.entry);
            }
        });
        self.barrier.pass();
    }
}

// =============================================================================
// Collection
// =============================================================================

impl JitCodeCache {
    /// Run one full collection cycle.
    ///
    /// Returns immediately when the cache is shutting down, has no writable
    /// region, or another collection is in flight.
    pub fn collect(&self) {
        let start = Instant::now();
        let (bitmap, requeued, pending) = {
            let mut state = self.state.lock();
            if self.is_shutting_down() || state.collector != CollectorState::Idle {
                return;
            }
            let Some(region) = state.space.as_ref().map(|space| Arc::clone(space.region())) else {
                return;
            };
            state.collector = CollectorState::Preparing;
            let requeued = self.prepare_locked(&mut state);
            let bitmap = Arc::new(LiveBitmap::new(region.exec_begin(), region.code_capacity()));
            state.live_bitmap = Some(Arc::clone(&bitmap));
            state.collector = CollectorState::Marking;
            (bitmap, requeued, state.zombies.pending_len())
        };

        self.mark_compiled_code_on_stacks();

        let mut state = self.state.lock();
        state.collector = CollectorState::Sweeping;
        let (freed, kept) = self.sweep_locked(&mut state, &bitmap);
        state.live_bitmap = None;
        state.collector = CollectorState::Idle;
        self.task_scheduled.store(false, Ordering::Release);
        // Code retired while marking found the flag still set.
        if state.zombies.pending_len() > pending {
            self.maybe_schedule_collection(&state);
        }
        self.cond.notify_all();
        drop(state);

        let duration = start.elapsed();
        self.stats
            .record_collection(freed as u64, kept as u64, requeued as u64, duration);
        tracing::info!(freed, kept, requeued, ?duration, "code cache collection finished");
    }

    /// Run the marking checkpoint of the collection in flight.
    ///
    /// Does nothing outside the marking phase.
    pub fn mark_compiled_code_on_stacks(&self) {
        let bitmap = {
            let state = self.state.lock();
            if state.collector != CollectorState::Marking {
                return;
            }
            match &state.live_bitmap {
                Some(bitmap) => Arc::clone(bitmap),
                None => return,
            }
        };
        let Some(cache) = self.this.upgrade() else {
            return;
        };
        let barrier = Arc::new(CheckpointBarrier::default());
        let closure = Arc::new(MarkCodeClosure {
            cache,
            bitmap,
            barrier: Arc::clone(&barrier),
        });
        let threads = self.host.run_checkpoint(closure);
        barrier.wait_for(threads);
    }

    /// Returns the number of zombies put back because their method still
    /// enters them.
    fn prepare_locked(&self, state: &mut CacheState) -> usize {
        state.zombies.begin_cycle();
        {
            let mut index = self.index.write();
            for (method, entry) in index.code.take_osr() {
                state.zombies.add_processed_code(entry, method);
            }
        }

        let installed: Vec<usize> = state
            .zombies
            .processed_code()
            .filter(|&(entry, method)| self.host.entry_point(method) == entry)
            .map(|(entry, _)| entry)
            .collect();
        for &entry in &installed {
            tracing::debug!(entry = format_args!("{entry:#x}"), "retired code still installed, requeued");
            state.zombies.requeue(entry);
        }
        installed.len()
    }

    /// Free unmarked processed zombies. Returns (freed, kept).
    fn sweep_locked(&self, state: &mut CacheState, bitmap: &LiveBitmap) -> (usize, usize) {
        let mut index = self.index.write();
        let mut freed = 0;
        let mut kept = 0;

        let code: Vec<usize> = state.zombies.processed_code().map(|(entry, _)| entry).collect();
        for entry in code {
            if bitmap.is_marked(entry) {
                kept += 1;
                continue;
            }
            index.code.remove(entry);
            self.free_blob_locked(state, entry);
            freed += 1;
        }

        let jni: Vec<usize> = state.zombies.processed_jni().collect();
        for entry in jni {
            if bitmap.is_marked(entry) {
                kept += 1;
                continue;
            }
            index.jni.forget_retired(entry);
            self.free_blob_locked(state, entry);
            freed += 1;
        }
        (freed, kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_barrier_waits_for_all_threads() {
        let barrier = Arc::new(CheckpointBarrier::default());
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || barrier.pass())
            })
            .collect();
        barrier.wait_for(3);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*barrier.passed.lock(), 3);
    }

    #[test]
    fn test_barrier_with_zero_threads() {
        CheckpointBarrier::default().wait_for(0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CollectorState::Marking.to_string(), "marking");
    }
}
