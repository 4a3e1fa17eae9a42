//! The JIT code cache.
//!
//! # Architecture
//!
//! ```text
//!  compiler threads            mutators / GC               background pool
//!  ────────────────            ─────────────               ───────────────
//!  reserve ──┐                 lookup_header ─┐            collect
//!  commit  ──┤                 contains      ─┤              │
//!  discard ──┤                 code_for      ─┤              │
//!            ▼                                ▼              ▼
//!   ┌─────────────────────┐      ┌───────────────────────────────┐
//!   │ cache lock (Mutex)  │ ───► │ index lock (RwLock)           │
//!   │  CodeSpace (pools)  │      │  CodeIndex   JniStubTable     │
//!   │  ZombieSet, bitmap  │      │  regions     SharedMap        │
//!   │  profiling records  │      │  AOT images                   │
//!   │  collector state    │      └───────────────────────────────┘
//!   └─────────────────────┘
//! ```
//!
//! Lock order is always cache lock, then index lock. Readers that only
//! resolve PCs take the index lock in shared mode. Entry points are switched
//! through the [`Host`] after the code was flushed, so any thread that sees a
//! new entry also sees its bytes.

use std::fmt::Write as _;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::aot::{AotImage, AotImageId};
use crate::blob::{
    self, BlobFlags, BlobHeader, BlobInfo, CompilationKind, HEADER_SIZE, allocation_of, entry_of,
};
use crate::collector::CollectorState;
use crate::config::CodeCacheConfig;
use crate::error::CacheError;
use crate::host::{Host, MethodHandle, ObjectRef};
use crate::index::{CodeIndex, IndexedBlob};
use crate::jni::{JniRemoval, JniStubKey, JniStubTable};
use crate::pool::{CodeSpace, SpaceReservation};
use crate::region::{MemoryRegion, RegionOptions};
use crate::shared_map::{SharedMap, ZygoteCompilationState};
use crate::stats::{CodeCacheSnapshot, CodeCacheStats, format_bytes};
use crate::zombie::{LiveBitmap, ZombieSet};

// =============================================================================
// Producer types
// =============================================================================

/// Slots handed to a compiler by [`JitCodeCache::reserve`].
///
/// Must be passed back to [`JitCodeCache::commit`] or
/// [`JitCodeCache::discard`].
#[derive(Debug)]
#[must_use = "reservations must be committed or discarded"]
pub struct Reservation {
    region: Arc<MemoryRegion>,
    slots: SpaceReservation,
    n_roots: usize,
}

impl Reservation {
    /// Where the code will start once committed.
    #[inline]
    pub fn entry(&self) -> usize {
        entry_of(self.slots.code)
    }

    /// Bytes of machine code the slot can hold.
    #[inline]
    pub fn code_capacity(&self) -> usize {
        self.slots.code_len - HEADER_SIZE
    }

    /// Bytes of stack map plus debug info the data slot can hold.
    pub fn data_capacity(&self) -> usize {
        if self.slots.data == 0 {
            return 0;
        }
        self.slots.data_len - blob::side_table_overhead(self.n_roots)
    }

    #[inline]
    pub fn root_capacity(&self) -> usize {
        self.n_roots
    }
}

/// Everything a compiler hands over for one blob.
#[derive(Debug, Clone, Copy)]
pub struct CommitRequest<'a> {
    pub method: MethodHandle,
    pub code: &'a [u8],
    pub roots: &'a [ObjectRef],
    pub stack_map: &'a [u8],
    pub debug_info: &'a [u8],
    pub kind: CompilationKind,
    /// Methods whose single-implementation status the code relies on.
    pub single_impl_methods: &'a [MethodHandle],
}

impl<'a> CommitRequest<'a> {
    /// A request carrying only code.
    pub fn new(method: MethodHandle, code: &'a [u8], kind: CompilationKind) -> Self {
        Self {
            method,
            code,
            roots: &[],
            stack_map: &[],
            debug_info: &[],
            kind,
            single_impl_methods: &[],
        }
    }

    pub fn with_roots(mut self, roots: &'a [ObjectRef]) -> Self {
        self.roots = roots;
        self
    }

    pub fn with_stack_map(mut self, stack_map: &'a [u8]) -> Self {
        self.stack_map = stack_map;
        self
    }

    pub fn with_debug_info(mut self, debug_info: &'a [u8]) -> Self {
        self.debug_info = debug_info;
        self
    }

    pub fn with_single_impl_methods(mut self, methods: &'a [MethodHandle]) -> Self {
        self.single_impl_methods = methods;
        self
    }
}

/// Outcome of [`JitCodeCache::prepare_jni_compilation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JniPrepare {
    /// No stub exists yet; compile one and commit it for this method.
    Compile,
    /// A compiled stub was installed for the method.
    Installed(usize),
}

// =============================================================================
// State
// =============================================================================

/// Everything guarded by the cache lock.
#[derive(Debug)]
pub(crate) struct CacheState {
    /// Writable region; `None` in a child without its own region.
    pub(crate) space: Option<CodeSpace>,
    pub(crate) collector: CollectorState,
    pub(crate) zombies: ZombieSet,
    pub(crate) live_bitmap: Option<Arc<LiveBitmap>>,
    pub(crate) profiling: FxHashMap<MethodHandle, usize>,
    in_flight: FxHashSet<(MethodHandle, CompilationKind)>,
    single_impl_dependents: FxHashMap<MethodHandle, SmallVec<[usize; 2]>>,
}

/// Everything guarded by the index (mutator) lock.
#[derive(Debug)]
pub(crate) struct IndexState {
    pub(crate) code: CodeIndex,
    pub(crate) jni: JniStubTable,
    pub(crate) private_region: Option<Arc<MemoryRegion>>,
    /// Region inherited from the zygote, read-only.
    pub(crate) shared_region: Option<Arc<MemoryRegion>>,
    pub(crate) shared_map: Option<SharedMap>,
    pub(crate) aot_images: Vec<(AotImageId, Arc<AotImage>)>,
}

// =============================================================================
// JitCodeCache
// =============================================================================

/// Owner of all dynamically compiled code.
pub struct JitCodeCache {
    config: CodeCacheConfig,
    pub(crate) host: Arc<dyn Host>,
    pub(crate) this: Weak<JitCodeCache>,
    pub(crate) state: Mutex<CacheState>,
    /// Signalled when a collection returns to idle.
    pub(crate) cond: Condvar,
    pub(crate) index: RwLock<IndexState>,
    pub(crate) stats: CodeCacheStats,
    pub(crate) task_scheduled: AtomicBool,
    disabled_for_shutdown: AtomicBool,
    next_image_id: AtomicU64,
}

impl std::fmt::Debug for JitCodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitCodeCache")
            .field("config", &self.config)
            .field("task_scheduled", &self.task_scheduled)
            .field("disabled_for_shutdown", &self.disabled_for_shutdown)
            .finish_non_exhaustive()
    }
}

impl JitCodeCache {
    /// Create a cache with a fresh region.
    pub fn new(config: CodeCacheConfig, host: Arc<dyn Host>) -> Result<Arc<Self>, CacheError> {
        config.validate()?;
        let region = Arc::new(MemoryRegion::new(Self::region_options(&config, config.is_zygote))?);
        tracing::info!(
            capacity = config.initial_capacity,
            max_capacity = config.max_capacity,
            zygote = config.is_zygote,
            "created code cache"
        );
        Ok(Arc::new_cyclic(|this| Self {
            host,
            this: this.clone(),
            state: Mutex::new(CacheState {
                space: Some(CodeSpace::new(Arc::clone(&region))),
                collector: CollectorState::Idle,
                zombies: ZombieSet::new(),
                live_bitmap: None,
                profiling: FxHashMap::default(),
                in_flight: FxHashSet::default(),
                single_impl_dependents: FxHashMap::default(),
            }),
            cond: Condvar::new(),
            index: RwLock::new(IndexState {
                code: CodeIndex::new(),
                jni: JniStubTable::new(),
                private_region: Some(region),
                shared_region: None,
                shared_map: None,
                aot_images: Vec::new(),
            }),
            stats: CodeCacheStats::new(),
            task_scheduled: AtomicBool::new(false),
            disabled_for_shutdown: AtomicBool::new(false),
            next_image_id: AtomicU64::new(1),
            config,
        }))
    }

    fn region_options(config: &CodeCacheConfig, shared: bool) -> RegionOptions {
        RegionOptions {
            initial_capacity: config.initial_capacity,
            max_capacity: config.max_capacity,
            dual_view: config.use_dual_view,
            shared,
            lazy_release_bug: config.lazy_release_bug,
        }
    }

    #[inline]
    pub fn config(&self) -> &CodeCacheConfig {
        &self.config
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.disabled_for_shutdown.load(Ordering::Acquire)
    }

    /// Whether a collection task is queued or running.
    #[inline]
    pub fn is_collection_scheduled(&self) -> bool {
        self.task_scheduled.load(Ordering::Acquire)
    }

    pub fn collector_state(&self) -> CollectorState {
        self.state.lock().collector
    }

    // =========================================================================
    // Producer interface
    // =========================================================================

    /// Reserve room for a blob of `code_size` bytes with `n_roots` roots and
    /// `data_size` bytes of stack map plus debug info.
    ///
    /// Waits for a collection in flight. Grows the region when full.
    pub fn reserve(
        &self,
        code_size: usize,
        data_size: usize,
        n_roots: usize,
    ) -> Result<Reservation, CacheError> {
        if self.is_shutting_down() {
            return Err(CacheError::Shutdown);
        }
        let code_len = HEADER_SIZE + code_size;
        let data_len = blob::side_table_size(n_roots, data_size);

        let mut state = self.state.lock();
        while state.collector != CollectorState::Idle {
            self.cond.wait(&mut state);
        }
        let space = state.space.as_mut().ok_or(CacheError::Disabled)?;
        loop {
            if let Some(slots) = space.reserve(code_len, data_len) {
                return Ok(Reservation {
                    region: Arc::clone(space.region()),
                    slots,
                    n_roots,
                });
            }
            if !space.grow() {
                let capacity = space.region().capacity();
                self.stats.record_reservation_failure();
                tracing::warn!(
                    code_size,
                    data_size,
                    n_roots,
                    capacity,
                    "code cache full, skipping compilation"
                );
                return Err(CacheError::CapacityExhausted {
                    requested: code_len + data_len,
                    capacity,
                });
            }
            self.stats.record_capacity_increase();
        }
    }

    /// Return unused slots.
    pub fn discard(&self, reservation: Reservation) {
        let mut state = self.state.lock();
        self.discard_locked(&mut state, reservation);
    }

    fn discard_locked(&self, state: &mut CacheState, reservation: Reservation) {
        let Some(space) = state.space.as_mut() else {
            return;
        };
        if !Arc::ptr_eq(space.region(), &reservation.region) {
            return;
        }
        if reservation.slots.data != 0 {
            space.free_data(reservation.slots.data);
        }
        space.free_code(reservation.slots.code);
    }

    /// Write a compiled blob into reserved slots and publish it.
    ///
    /// Returns false when the compilation had to be thrown away; the slots
    /// are released in that case.
    pub fn commit(&self, reservation: Reservation, request: &CommitRequest<'_>) -> bool {
        let method = request.method;
        let mut state = self.state.lock();

        let region = match state.space.as_ref() {
            Some(space) if Arc::ptr_eq(space.region(), &reservation.region) => {
                Arc::clone(space.region())
            }
            _ => {
                self.stats.record_discard();
                tracing::warn!(?method, "reservation belongs to a replaced region, discarding");
                return false;
            }
        };

        let payload = request.stack_map.len() + request.debug_info.len();
        if request.code.len() > reservation.code_capacity()
            || request.roots.len() > reservation.n_roots
            || payload > reservation.data_capacity()
            || (reservation.slots.data == 0 && !request.roots.is_empty())
        {
            tracing::warn!(
                ?method,
                code = request.code.len(),
                roots = request.roots.len(),
                payload,
                "commit does not fit its reservation, discarding"
            );
            self.stats.record_discard();
            self.discard_locked(&mut state, reservation);
            return false;
        }

        if region.is_shared() {
            let movable = request
                .roots
                .iter()
                .find(|root| root.is_object() && self.host.is_moving_object(**root));
            if let Some(root) = movable {
                tracing::debug!(?method, ?root, "movable root in shared region, discarding");
                self.stats.record_discard();
                self.discard_locked(&mut state, reservation);
                return false;
            }
        }

        let entry = reservation.entry();
        let side_table = if reservation.slots.data != 0 {
            blob::write_side_table(
                &region,
                reservation.slots.data,
                request.roots,
                request.stack_map,
                request.debug_info,
            )
        } else {
            0
        };
        let info = self.host.method_info(method);
        let mut flags = request.kind.flags();
        if info.is_native() {
            flags |= BlobFlags::JNI_STUB;
        }
        let header = BlobHeader::new(side_table, request.code.len() as u32, flags);
        region.write_code(reservation.slots.code, &header.to_bytes());
        region.commit_code(entry, request.code);

        if let Some(&broken) = request
            .single_impl_methods
            .iter()
            .find(|&&m| !self.host.has_single_implementation(m))
        {
            tracing::debug!(?method, ?broken, "single-implementation assumption broken, discarding");
            self.stats.record_discard();
            self.discard_locked(&mut state, reservation);
            return false;
        }
        for &dependency in request.single_impl_methods {
            state
                .single_impl_dependents
                .entry(dependency)
                .or_default()
                .push(entry);
        }

        let mut index = self.index.write();
        if info.is_native() {
            let key = JniStubKey::new(&info);
            index.jni.add_method(&key, method);
            if let Some(old) = index.jni.set_code(&key, entry).filter(|&old| old != entry) {
                index.jni.retire(old);
                if state.zombies.add_jni(old) {
                    self.maybe_schedule_collection(&state);
                }
            }
            if let Some(data) = index.jni.get(&key) {
                for user in data.methods() {
                    self.host.set_entry_point(user, entry);
                }
            }
            self.stats.record_jni_stub();
        } else {
            let blob = IndexedBlob {
                method,
                kind: request.kind,
                code_size: request.code.len() as u32,
            };
            if let Some(old_osr) = index.code.insert(entry, blob) {
                self.retire_code_locked(&mut state, old_osr, method);
            }
            if request.kind != CompilationKind::Osr {
                let previous = self.host.entry_point(method);
                self.host.set_entry_point(method, entry);
                if previous != entry && index.code.contains_entry(previous) {
                    self.retire_code_locked(&mut state, previous, method);
                }
            }
            self.stats.record_compilation(request.kind);
        }
        tracing::debug!(
            ?method,
            kind = ?request.kind,
            entry = format_args!("{entry:#x}"),
            size = request.code.len(),
            "committed compiled code"
        );
        true
    }

    // =========================================================================
    // Compilation bookkeeping
    // =========================================================================

    /// Claim the compilation of `method` as `kind`.
    ///
    /// Returns false when the same compilation is already in flight.
    pub fn notify_compilation_of(&self, method: MethodHandle, kind: CompilationKind) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        self.state.lock().in_flight.insert((method, kind))
    }

    /// Release a claim taken by [`JitCodeCache::notify_compilation_of`].
    pub fn done_compiling(&self, method: MethodHandle, kind: CompilationKind) {
        self.state.lock().in_flight.remove(&(method, kind));
    }

    pub fn is_compiling(&self, method: MethodHandle, kind: CompilationKind) -> bool {
        self.state.lock().in_flight.contains(&(method, kind))
    }

    /// Register a native method with the shared-stub table.
    ///
    /// When a compiled stub for the method's signature shape exists it is
    /// installed right away.
    pub fn prepare_jni_compilation(&self, method: MethodHandle) -> JniPrepare {
        let info = self.host.method_info(method);
        debug_assert!(info.is_native(), "{method:?} is not native");
        let key = JniStubKey::new(&info);
        let mut index = self.index.write();
        let needs_compilation = index.jni.intern(&key);
        index.jni.add_method(&key, method);
        match index.jni.code_for(&key) {
            Some(code) if !needs_compilation => {
                self.host.set_entry_point(method, code);
                JniPrepare::Installed(code)
            }
            _ => JniPrepare::Compile,
        }
    }

    // =========================================================================
    // Executor interface
    // =========================================================================

    /// Whether `pc` lies in code owned by the cache.
    pub fn contains(&self, pc: usize) -> bool {
        let index = self.index.read();
        index.private_region.as_ref().is_some_and(|r| r.in_exec(pc))
            || index.shared_region.as_ref().is_some_and(|r| r.in_exec(pc))
    }

    /// Whether `pc` lies in the writable region of this process.
    pub fn in_private_region(&self, pc: usize) -> bool {
        let index = self.index.read();
        index.private_region.as_ref().is_some_and(|r| r.in_exec(pc))
    }

    /// Whether `pc` lies in the region inherited from the zygote.
    pub fn in_shared_region(&self, pc: usize) -> bool {
        let index = self.index.read();
        index.shared_region.as_ref().is_some_and(|r| r.in_exec(pc))
    }

    /// The blob whose code covers `pc`.
    ///
    /// `method`, when known, narrows the search to that method's blobs (or to
    /// the shared stubs for a native method).
    pub fn lookup_header(&self, pc: usize, method: Option<MethodHandle>) -> Option<BlobInfo> {
        let index = self.index.read();

        if let (Some(map), Some(shared)) = (&index.shared_map, &index.shared_region) {
            if shared.in_exec(pc) {
                for (owner, code) in map.entries() {
                    // SAFETY: shared code is never freed.
                    let info = unsafe { read_info(code, Some(owner)) };
                    if info.contains(pc) {
                        return Some(info);
                    }
                }
            }
        }

        let in_private = index.private_region.as_ref().is_some_and(|r| r.in_exec(pc));
        if in_private {
            let native = method.is_some_and(|m| self.host.method_info(m).is_native());
            let found = match method {
                Some(m) if !native => index.code.lookup_for_method(pc, m),
                Some(_) => None,
                None => index.code.lookup_by_pc(pc),
            };
            if let Some((entry, blob)) = found {
                // SAFETY: indexed blobs stay allocated while the lock is held.
                return Some(unsafe { read_info(entry, Some(blob.method)) });
            }
            if native || method.is_none() {
                // Retired stubs stay resolvable until freed; threads may still run in them.
                for code in index.jni.codes().chain(index.jni.retired_codes()) {
                    // SAFETY: as above.
                    let info = unsafe { read_info(code, method) };
                    if info.contains(pc) {
                        return Some(info);
                    }
                }
            }
            return None;
        }

        index
            .aot_images
            .iter()
            .find(|(_, image)| image.contains(pc))
            .and_then(|(_, image)| image.lookup(pc))
    }

    /// Compiled code currently entered by `method`, or the zygote's code for
    /// it.
    pub fn code_for(&self, method: MethodHandle) -> Option<usize> {
        let index = self.index.read();
        let current = self.host.entry_point(method);
        if index.code.contains_entry(current) {
            return Some(current);
        }
        index.shared_map.as_ref().and_then(|map| map.get(method))
    }

    /// Entry of the shared stub of native `method`, if compiled.
    pub fn jni_stub_for(&self, method: MethodHandle) -> Option<usize> {
        let key = JniStubKey::new(&self.host.method_info(method));
        self.index.read().jni.code_for(&key)
    }

    /// Entry of the current OSR blob of `method`.
    pub fn osr_entry_for(&self, method: MethodHandle) -> Option<usize> {
        self.index.read().code.osr_entry(method)
    }

    /// Call `f(entry, method)` for every indexed blob.
    pub fn visit_all(&self, mut f: impl FnMut(usize, MethodHandle)) {
        self.index.read().code.visit_all(|entry, blob| f(entry, blob.method));
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Retire every blob of `method` and revert it to the interpreter.
    pub fn invalidate_compiled_code_for(&self, method: MethodHandle) {
        let mut state = self.state.lock();
        let mut index = self.index.write();
        if self.invalidate_locked(&mut state, &mut index, method) > 0 {
            self.maybe_schedule_collection(&state);
        }
    }

    /// Retire all compiled code; every method returns to the interpreter.
    ///
    /// Calling it again retires nothing.
    pub fn invalidate_all_compiled(&self) {
        let mut state = self.state.lock();
        let mut index = self.index.write();
        let mut methods: Vec<MethodHandle> = index.code.methods().collect();
        for (_, data) in index.jni.iter() {
            methods.extend(data.methods());
        }
        methods.sort_unstable();
        methods.dedup();

        let mut retired = 0;
        for method in methods {
            retired += self.invalidate_locked(&mut state, &mut index, method);
        }
        if let (Some(map), Some(shared)) = (&index.shared_map, &index.shared_region) {
            for (method, _) in map.entries() {
                if shared.in_exec(self.host.entry_point(method)) {
                    self.host.reinitialize_to_default(method);
                }
            }
        }
        if retired > 0 {
            tracing::info!(retired, "invalidated all compiled code");
            self.maybe_schedule_collection(&state);
        }
    }

    /// Retire the code that relied on `method` having a single
    /// implementation.
    pub fn invalidate_single_implementation(&self, method: MethodHandle) {
        let mut state = self.state.lock();
        let Some(dependents) = state.single_impl_dependents.remove(&method) else {
            return;
        };
        let mut index = self.index.write();
        let mut retired = 0;
        for entry in dependents {
            let Some(blob) = index.code.get(entry).copied() else {
                continue;
            };
            if self.host.entry_point(blob.method) == entry {
                self.host.reinitialize_to_default(blob.method);
            }
            if index.code.osr_entry(blob.method) == Some(entry) {
                index.code.clear_osr(blob.method);
            }
            if state.zombies.add_code(entry, blob.method) {
                self.stats.record_invalidation();
                retired += 1;
            }
        }
        if retired > 0 {
            tracing::debug!(?method, retired, "invalidated single-implementation dependents");
            self.maybe_schedule_collection(&state);
        }
    }

    /// Returns the number of blobs newly retired.
    fn invalidate_locked(
        &self,
        state: &mut CacheState,
        index: &mut IndexState,
        method: MethodHandle,
    ) -> usize {
        let info = self.host.method_info(method);
        let mut retired = 0;
        if info.is_native() {
            let key = JniStubKey::new(&info);
            match index.jni.remove_method(&key, method) {
                JniRemoval::NotFound => return 0,
                JniRemoval::Kept | JniRemoval::Dropped(None) => {}
                JniRemoval::Dropped(Some(code)) => {
                    index.jni.retire(code);
                    if state.zombies.add_jni(code) {
                        retired += 1;
                    }
                }
            }
            self.host.reinitialize_to_default(method);
        } else {
            for &entry in index.code.entries_for(method) {
                if state.zombies.add_code(entry, method) {
                    retired += 1;
                }
            }
            index.code.clear_osr(method);
            let current = self.host.entry_point(method);
            let in_shared = index.shared_region.as_ref().is_some_and(|r| r.in_exec(current));
            if index.code.contains_entry(current) || in_shared {
                self.host.reinitialize_to_default(method);
            }
        }
        for _ in 0..retired {
            self.stats.record_invalidation();
        }
        retired
    }

    fn retire_code_locked(&self, state: &mut CacheState, entry: usize, method: MethodHandle) {
        if state.zombies.add_code(entry, method) {
            self.maybe_schedule_collection(state);
        }
    }

    /// Queue one collection once enough code was retired.
    pub(crate) fn maybe_schedule_collection(&self, state: &CacheState) {
        if state.zombies.len() < self.config.collection_threshold || self.is_shutting_down() {
            return;
        }
        if self.task_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = self.this.clone();
        self.host.enqueue_task(Box::new(move || {
            if let Some(cache) = this.upgrade() {
                cache.collect();
            }
        }));
        tracing::debug!(zombies = state.zombies.len(), "scheduled code cache collection");
    }

    /// Release the memory of a blob that is no longer indexed.
    pub(crate) fn free_blob_locked(&self, state: &mut CacheState, entry: usize) {
        state.zombies.forget(entry);
        state.single_impl_dependents.retain(|_, entries| {
            entries.retain(|e| *e != entry);
            !entries.is_empty()
        });
        let Some(space) = state.space.as_mut() else {
            return;
        };
        if !space.region().in_exec(entry) {
            return;
        }
        // SAFETY: the blob was committed and is freed exactly once here.
        let header = unsafe { BlobHeader::read(entry) };
        if header.side_table != 0 {
            space.free_data(blob::side_table_allocation(header.side_table));
        }
        space.free_code(allocation_of(entry));
    }

    // =========================================================================
    // Class unloading
    // =========================================================================

    /// Drop everything belonging to methods whose records lie in `range`.
    ///
    /// Unloaded methods cannot be executing, so their code is freed at once.
    pub fn remove_methods_in(&self, range: Range<usize>) {
        let mut state = self.state.lock();
        let mut index = self.index.write();
        let in_range = |m: MethodHandle| range.contains(&m.addr());

        let mut freed = 0;
        for entry in index.code.remove_methods_where(in_range) {
            self.free_blob_locked(&mut state, entry);
            freed += 1;
        }
        for code in index.jni.remove_methods_where(in_range) {
            self.free_blob_locked(&mut state, code);
            freed += 1;
        }

        let records: Vec<(MethodHandle, usize)> = state
            .profiling
            .iter()
            .filter(|&(&m, _)| in_range(m))
            .map(|(&m, &addr)| (m, addr))
            .collect();
        for (method, addr) in records {
            state.profiling.remove(&method);
            if let Some(space) = state.space.as_mut() {
                space.free_data(addr);
            }
        }
        state.in_flight.retain(|(m, _)| !in_range(*m));
        state.single_impl_dependents.retain(|m, _| !in_range(*m));

        tracing::debug!(
            begin = format_args!("{:#x}", range.start),
            end = format_args!("{:#x}", range.end),
            freed,
            "removed unloaded methods"
        );
    }

    // =========================================================================
    // AOT images
    // =========================================================================

    /// Make a loaded AOT image known to PC lookups and root visiting.
    ///
    /// For an executable image every method not already running JIT code
    /// is switched to its precompiled entry point.
    pub fn register_aot_image(&self, image: AotImage) -> AotImageId {
        let id = AotImageId(self.next_image_id.fetch_add(1, Ordering::Relaxed));
        let mut index = self.index.write();
        let mut installed = 0;
        if image.executable {
            for aot in image.methods() {
                let current = self.host.entry_point(aot.method);
                let jitted = index.code.contains_entry(current)
                    || index.jni.contains_code(current)
                    || index.shared_region.as_ref().is_some_and(|r| r.in_exec(current));
                if !jitted {
                    self.host.set_entry_point(aot.method, aot.entry);
                    installed += 1;
                }
            }
        }
        tracing::debug!(
            location = %image.location,
            methods = image.methods().len(),
            installed,
            "registered AOT image"
        );
        index.aot_images.push((id, Arc::new(image)));
        id
    }

    /// Forget an image before it is unmapped.
    ///
    /// Methods still entering the image return to the interpreter.
    pub fn unregister_aot_image(&self, id: AotImageId) -> bool {
        let mut index = self.index.write();
        let Some(pos) = index.aot_images.iter().position(|(image_id, _)| *image_id == id) else {
            return false;
        };
        let (_, image) = index.aot_images.remove(pos);
        for aot in image.methods() {
            if self.host.entry_point(aot.method) == aot.entry {
                self.host.reinitialize_to_default(aot.method);
            }
        }
        true
    }

    // =========================================================================
    // Zygote and fork
    // =========================================================================

    /// Publish the zygote's compiled methods for its future children.
    ///
    /// Returns the number of methods published.
    pub fn publish_zygote_map(&self) -> usize {
        let mut state = self.state.lock();
        let mut index = self.index.write();
        let Some(space) = state.space.as_mut() else {
            return 0;
        };
        if !space.region().is_shared() {
            tracing::debug!("not a zygote region, no map to publish");
            return 0;
        }
        let entries: Vec<(MethodHandle, usize)> = index
            .code
            .methods()
            .filter_map(|method| {
                let entry = self.host.entry_point(method);
                let blob = index.code.get(entry)?;
                (blob.kind != CompilationKind::Osr && blob.method == method).then_some((method, entry))
            })
            .collect();
        let capacity = SharedMap::capacity_for(entries.len());
        let Some(base) = space.allocate_data(SharedMap::bytes_for(capacity)) else {
            tracing::warn!(methods = entries.len(), "no room for the zygote map");
            return 0;
        };
        let map = SharedMap::create(space.region(), base, capacity);
        let published = entries
            .iter()
            .filter(|&&(method, code)| map.insert(method, code))
            .count();
        map.set_state(ZygoteCompilationState::Done);
        index.shared_map = Some(map);
        tracing::info!(published, capacity, "published zygote code map");
        published
    }

    /// Progress of the zygote's pre-compilation.
    pub fn zygote_compilation_state(&self) -> ZygoteCompilationState {
        self.index
            .read()
            .shared_map
            .as_ref()
            .map_or(ZygoteCompilationState::InProgress, SharedMap::state)
    }

    /// Quiesce before the process forks.
    pub fn pre_fork(&self) {
        let mut state = self.state.lock();
        while state.collector != CollectorState::Idle {
            self.cond.wait(&mut state);
        }
        let writable = state.space.as_ref().is_some_and(|space| space.region().is_shared());
        let index = self.index.read();
        if let (true, Some(map)) = (writable, index.shared_map.as_ref()) {
            if map.state() == ZygoteCompilationState::Done {
                map.set_state(ZygoteCompilationState::NotifiedChildren);
            }
        }
    }

    /// Reset the cache in a freshly forked child.
    ///
    /// The inherited region becomes read-only shared code; everything
    /// indexed is forgotten. Unless the child is itself a zygote or runs in
    /// safe mode it gets a new private region.
    ///
    /// # Panics
    /// Panics when the new region cannot be created.
    pub fn post_fork_child(&self, is_zygote: bool, safe_mode: bool) {
        let mut state = self.state.lock();
        let mut index = self.index.write();

        if let Some(space) = state.space.take() {
            let region = Arc::clone(space.region());
            region.protect_read_only();
            index.shared_region = Some(region);
        }
        index.private_region = None;
        index.code.clear();
        index.jni.clear();
        state.zombies.clear();
        state.profiling.clear();
        state.in_flight.clear();
        state.single_impl_dependents.clear();
        state.live_bitmap = None;
        state.collector = CollectorState::Idle;
        self.host.discard_tasks();
        self.task_scheduled.store(false, Ordering::Release);

        if !is_zygote && !safe_mode {
            let options = Self::region_options(&self.config, false);
            let region = match MemoryRegion::new(options) {
                Ok(region) => Arc::new(region),
                Err(err) => panic!("failed to create code cache region after fork: {err}"),
            };
            index.private_region = Some(Arc::clone(&region));
            state.space = Some(CodeSpace::new(region));
        }
        tracing::info!(
            is_zygote,
            safe_mode,
            has_private_region = index.private_region.is_some(),
            shared_methods = index.shared_map.as_ref().map_or(0, SharedMap::len),
            "code cache reset after fork"
        );
    }

    // =========================================================================
    // Lifecycle & diagnostics
    // =========================================================================

    /// Stop accepting work; waits for a collection in flight.
    pub fn shutdown(&self) {
        self.disabled_for_shutdown.store(true, Ordering::Release);
        let mut state = self.state.lock();
        while state.collector != CollectorState::Idle {
            self.cond.wait(&mut state);
        }
        self.cond.notify_all();
        tracing::debug!("code cache shut down");
    }

    /// Counters plus current byte accounting.
    pub fn stats(&self) -> CodeCacheSnapshot {
        let state = self.state.lock();
        let index = self.index.read();
        let mut snapshot = self.stats.snapshot();
        if let Some(space) = state.space.as_ref() {
            snapshot.capacity = space.region().capacity();
            snapshot.code_used = space.code_pool().used_bytes();
            snapshot.code_resident = space.code_pool().resident_bytes();
            snapshot.data_used = space.data_pool().used_bytes();
            snapshot.data_resident = space.data_pool().resident_bytes();
        }
        snapshot.indexed_blobs = index.code.len();
        snapshot.jni_entries = index.jni.len();
        snapshot.zombies = state.zombies.len();
        snapshot
    }

    /// Human-readable state of the cache.
    pub fn dump(&self) -> String {
        let mut out = self.stats().to_string();
        let state = self.state.lock();
        let index = self.index.read();
        let _ = write!(out, "\nCollector: {}", state.collector);
        if let Some(region) = &index.private_region {
            let _ = write!(
                out,
                "\nPrivate region: {:#x} ({} of {})",
                region.exec_begin(),
                format_bytes(region.capacity() as u64),
                format_bytes(region.max_capacity() as u64)
            );
        }
        if let Some(region) = &index.shared_region {
            let _ = write!(out, "\nShared region: {:#x} (read-only)", region.exec_begin());
        }
        if let Some(map) = &index.shared_map {
            let _ = write!(
                out,
                "\nZygote map: {} of {} slots, {:?}",
                map.len(),
                map.capacity(),
                map.state()
            );
        }
        for (_, image) in &index.aot_images {
            let _ = write!(
                out,
                "\nAOT image: {} ({} methods)",
                image.location,
                image.methods().len()
            );
        }
        out
    }
}

/// # Safety
/// `entry` must be the entry point of a blob that stays allocated for the
/// duration of the call.
unsafe fn read_info(entry: usize, method: Option<MethodHandle>) -> BlobInfo {
    // SAFETY: forwarded to the caller.
    let header = unsafe { BlobHeader::read(entry) };
    BlobInfo {
        entry,
        code_size: header.code_size,
        flags: header.flags(),
        method,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Host, MethodFlags};
    use crate::testing::FakeHost;

    fn cache() -> (Arc<FakeHost>, Arc<JitCodeCache>) {
        let host = Arc::new(FakeHost::new());
        let cache = JitCodeCache::new(CodeCacheConfig::for_testing(), host.clone()).unwrap();
        (host, cache)
    }

    fn compile(cache: &JitCodeCache, method: MethodHandle, code: &[u8], kind: CompilationKind) -> usize {
        let reservation = cache.reserve(code.len(), 0, 0).unwrap();
        let entry = reservation.entry();
        assert!(cache.commit(reservation, &CommitRequest::new(method, code, kind)));
        entry
    }

    #[test]
    fn test_commit_installs_entry_point() {
        let (host, cache) = cache();
        let method = host.add_method(0x100, "V", MethodFlags::empty());
        let entry = compile(&cache, method, &[0x90; 32], CompilationKind::Baseline);
        assert_eq!(host.entry_point(method), entry);
        assert_eq!(cache.code_for(method), Some(entry));
        assert!(cache.contains(entry));
        assert!(cache.in_private_region(entry));
        let info = cache.lookup_header(entry + 31, None).unwrap();
        assert_eq!(info.entry, entry);
        assert_eq!(info.code_size, 32);
        assert!(info.flags.contains(BlobFlags::BASELINE));
    }

    #[test]
    fn test_osr_commit_does_not_switch_entry_point() {
        let (host, cache) = cache();
        let method = host.add_method(0x100, "V", MethodFlags::empty());
        let osr = compile(&cache, method, &[0x90; 16], CompilationKind::Osr);
        assert_eq!(host.entry_point(method), FakeHost::INTERPRETER_ENTRY);
        assert_eq!(cache.osr_entry_for(method), Some(osr));
    }

    #[test]
    fn test_recompilation_retires_previous_code() {
        let (host, cache) = cache();
        let method = host.add_method(0x100, "V", MethodFlags::empty());
        let baseline = compile(&cache, method, &[1; 16], CompilationKind::Baseline);
        let optimized = compile(&cache, method, &[2; 16], CompilationKind::Optimized);
        assert_eq!(host.entry_point(method), optimized);
        assert_eq!(cache.stats().zombies, 1);
        // The retired blob stays resolvable until swept.
        assert_eq!(cache.lookup_header(baseline, Some(method)).unwrap().entry, baseline);
    }

    #[test]
    fn test_commit_discarded_on_broken_assumption() {
        let (host, cache) = cache();
        let method = host.add_method(0x100, "V", MethodFlags::empty());
        let callee = host.add_method(0x200, "V", MethodFlags::empty());
        host.break_single_implementation(callee);
        let reservation = cache.reserve(16, 0, 0).unwrap();
        let entry = reservation.entry();
        let deps = [callee];
        let request = CommitRequest::new(method, &[0; 16], CompilationKind::Optimized)
            .with_single_impl_methods(&deps);
        assert!(!cache.commit(reservation, &request));
        assert!(cache.lookup_header(entry, None).is_none());
        assert_eq!(cache.stats().commits_discarded, 1);
        assert_eq!(cache.stats().code_used, 0);
    }

    #[test]
    fn test_invalidate_single_implementation_retires_dependents() {
        let (host, cache) = cache();
        let method = host.add_method(0x100, "V", MethodFlags::empty());
        let callee = host.add_method(0x200, "V", MethodFlags::empty());
        let reservation = cache.reserve(16, 0, 0).unwrap();
        let deps = [callee];
        let request = CommitRequest::new(method, &[0; 16], CompilationKind::Optimized)
            .with_single_impl_methods(&deps);
        assert!(cache.commit(reservation, &request));

        cache.invalidate_single_implementation(callee);
        assert_eq!(host.entry_point(method), FakeHost::INTERPRETER_ENTRY);
        assert_eq!(cache.stats().zombies, 1);
    }

    #[test]
    fn test_commit_larger_than_reservation_is_discarded() {
        let (host, cache) = cache();
        let method = host.add_method(0x100, "V", MethodFlags::empty());
        let reservation = cache.reserve(16, 0, 0).unwrap();
        let request = CommitRequest::new(method, &[0; 64], CompilationKind::Baseline);
        assert!(!cache.commit(reservation, &request));
        assert_eq!(cache.stats().code_used, 0);
    }

    #[test]
    fn test_in_flight_compilations_are_exclusive() {
        let (host, cache) = cache();
        let method = host.add_method(0x100, "V", MethodFlags::empty());
        assert!(cache.notify_compilation_of(method, CompilationKind::Optimized));
        assert!(!cache.notify_compilation_of(method, CompilationKind::Optimized));
        assert!(cache.notify_compilation_of(method, CompilationKind::Osr));
        cache.done_compiling(method, CompilationKind::Optimized);
        assert!(cache.notify_compilation_of(method, CompilationKind::Optimized));
    }

    #[test]
    fn test_jni_stub_shared_between_methods() {
        let (host, cache) = cache();
        let first = host.add_method(0x100, "IJ", MethodFlags::NATIVE | MethodFlags::STATIC);
        let second = host.add_method(0x200, "IJ", MethodFlags::NATIVE | MethodFlags::STATIC);

        assert_eq!(cache.prepare_jni_compilation(first), JniPrepare::Compile);
        let stub = compile(&cache, first, &[0xCC; 24], CompilationKind::Optimized);
        assert_eq!(cache.jni_stub_for(first), Some(stub));

        assert_eq!(cache.prepare_jni_compilation(second), JniPrepare::Installed(stub));
        assert_eq!(host.entry_point(second), stub);

        let info = cache.lookup_header(stub + 4, Some(second)).unwrap();
        assert!(info.flags.contains(BlobFlags::JNI_STUB));
    }

    #[test]
    fn test_reserve_grows_then_fails() {
        let (host, cache) = cache();
        let _ = host;
        let max_code = cache.config().max_capacity / 2;
        let first = cache.reserve(max_code / 2, 0, 0).unwrap();
        assert!(cache.stats().capacity_increases > 0);
        let err = cache.reserve(max_code, 0, 0).unwrap_err();
        assert!(matches!(err, CacheError::CapacityExhausted { .. }));
        assert_eq!(cache.stats().reservation_failures, 1);
        cache.discard(first);
        assert_eq!(cache.stats().code_used, 0);
    }

    #[test]
    fn test_shutdown_rejects_reservations() {
        let (_host, cache) = cache();
        cache.shutdown();
        assert!(matches!(cache.reserve(16, 0, 0), Err(CacheError::Shutdown)));
    }

    #[test]
    fn test_dump_mentions_region() {
        let (_host, cache) = cache();
        let dump = cache.dump();
        assert!(dump.contains("=== Code Cache ==="));
        assert!(dump.contains("Private region"));
        assert!(dump.contains("Collector: idle"));
    }
}
