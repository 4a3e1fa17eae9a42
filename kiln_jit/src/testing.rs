//! In-memory [`Host`] for tests and benchmarks.
//!
//! Methods, classes and thread stacks are plain tables the test fills in.
//! Checkpoints run synchronously on the calling thread against the recorded
//! stacks, and background tasks queue up until [`FakeHost::run_pending_tasks`]
//! is called.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::host::{
    Checkpoint, ClassInfo, Frame, Host, MethodFlags, MethodHandle, MethodInfo, ObjectRef,
    PackageId, RootKind, StackWalker,
};

type Task = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone)]
struct FakeMethod {
    info: MethodInfo,
    entry: usize,
}

/// A recorded thread stack.
struct FakeThread<'a>(&'a [Frame]);

impl StackWalker for FakeThread<'_> {
    fn walk(&self, visitor: &mut dyn FnMut(&Frame)) {
        for frame in self.0 {
            visitor(frame);
        }
    }
}

/// Table-driven host.
#[derive(Default)]
pub struct FakeHost {
    methods: RwLock<FxHashMap<MethodHandle, FakeMethod>>,
    root_kinds: RwLock<FxHashMap<ObjectRef, RootKind>>,
    moving: RwLock<FxHashSet<ObjectRef>>,
    classes: RwLock<FxHashMap<ObjectRef, ClassInfo>>,
    type_indices: RwLock<FxHashMap<(PackageId, Arc<str>), u32>>,
    broken_single_impl: RwLock<FxHashSet<MethodHandle>>,
    stacks: Mutex<Vec<Vec<Frame>>>,
    tasks: Mutex<Vec<Task>>,
    checkpoint_hooks: Mutex<Vec<Task>>,
    write_barriers: Mutex<Vec<ObjectRef>>,
}

impl FakeHost {
    /// Entry point every method starts with.
    pub const INTERPRETER_ENTRY: usize = 0x1;

    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method in package 0 declared by class `0x8000_0000 + addr`.
    pub fn add_method(&self, addr: usize, shorty: &str, flags: MethodFlags) -> MethodHandle {
        self.add_method_info(
            addr,
            MethodInfo {
                shorty: Arc::from(shorty),
                flags,
                declaring_class: ObjectRef::from_addr(0x8000_0000 + addr),
                package: PackageId(0),
            },
        )
    }

    pub fn add_method_info(&self, addr: usize, info: MethodInfo) -> MethodHandle {
        let method = MethodHandle::from_addr(addr);
        self.methods.write().insert(
            method,
            FakeMethod {
                info,
                entry: Self::INTERPRETER_ENTRY,
            },
        );
        method
    }

    pub fn set_root_kind(&self, obj: ObjectRef, kind: RootKind) {
        self.root_kinds.write().insert(obj, kind);
    }

    pub fn set_moving(&self, obj: ObjectRef, moving: bool) {
        let mut set = self.moving.write();
        if moving {
            set.insert(obj);
        } else {
            set.remove(&obj);
        }
    }

    pub fn add_class(&self, class: ObjectRef, info: ClassInfo) {
        self.classes.write().insert(class, info);
    }

    /// Make `descriptor` resolvable in `package`.
    pub fn add_type_index(&self, package: PackageId, descriptor: &str, type_index: u32) {
        self.type_indices
            .write()
            .insert((package, Arc::from(descriptor)), type_index);
    }

    /// Declare that `method` gained a second implementation.
    pub fn break_single_implementation(&self, method: MethodHandle) {
        self.broken_single_impl.write().insert(method);
    }

    /// Replace the stacks reported to checkpoints, one per thread.
    pub fn set_thread_stacks(&self, stacks: Vec<Vec<Frame>>) {
        *self.stacks.lock() = stacks;
    }

    /// Run `hook` once, at the start of the next checkpoint, as a mutator
    /// would before reaching its safe point.
    pub fn before_next_checkpoint(&self, hook: impl FnOnce() + Send + 'static) {
        self.checkpoint_hooks.lock().push(Box::new(hook));
    }

    pub fn enqueued_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run queued tasks on the calling thread. Returns how many ran.
    pub fn run_pending_tasks(&self) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }

    /// Holders passed to the write barrier so far.
    pub fn write_barriers(&self) -> Vec<ObjectRef> {
        self.write_barriers.lock().clone()
    }
}

impl Host for FakeHost {
    fn method_info(&self, method: MethodHandle) -> MethodInfo {
        match self.methods.read().get(&method) {
            Some(m) => m.info.clone(),
            None => panic!("unknown method {method:?}"),
        }
    }

    fn entry_point(&self, method: MethodHandle) -> usize {
        self.methods
            .read()
            .get(&method)
            .map_or(Self::INTERPRETER_ENTRY, |m| m.entry)
    }

    fn set_entry_point(&self, method: MethodHandle, entry: usize) {
        if let Some(m) = self.methods.write().get_mut(&method) {
            m.entry = entry;
        }
    }

    fn reinitialize_to_default(&self, method: MethodHandle) {
        self.set_entry_point(method, Self::INTERPRETER_ENTRY);
    }

    fn has_single_implementation(&self, method: MethodHandle) -> bool {
        !self.broken_single_impl.read().contains(&method)
    }

    fn root_kind(&self, obj: ObjectRef) -> RootKind {
        self.root_kinds
            .read()
            .get(&obj)
            .copied()
            .unwrap_or(RootKind::Other)
    }

    fn is_moving_object(&self, obj: ObjectRef) -> bool {
        self.moving.read().contains(&obj)
    }

    fn write_barrier(&self, holder: ObjectRef) {
        self.write_barriers.lock().push(holder);
    }

    fn class_info(&self, class: ObjectRef) -> ClassInfo {
        match self.classes.read().get(&class) {
            Some(info) => info.clone(),
            None => panic!("unknown class {class:?}"),
        }
    }

    fn find_type_index(&self, package: PackageId, descriptor: &str) -> Option<u32> {
        self.type_indices
            .read()
            .get(&(package, Arc::from(descriptor)))
            .copied()
    }

    fn run_checkpoint(&self, checkpoint: Arc<dyn Checkpoint>) -> usize {
        let hooks = std::mem::take(&mut *self.checkpoint_hooks.lock());
        for hook in hooks {
            hook();
        }
        let stacks = self.stacks.lock().clone();
        for stack in &stacks {
            checkpoint.run(&FakeThread(stack));
        }
        stacks.len()
    }

    fn enqueue_task(&self, task: Box<dyn FnOnce() + Send>) {
        self.tasks.lock().push(task);
    }

    fn discard_tasks(&self) {
        self.tasks.lock().clear();
    }
}
