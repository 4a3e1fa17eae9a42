//! Runtime services the code cache consumes.
//!
//! The cache never reaches for process-wide singletons. Everything it needs
//! from the surrounding runtime (method metadata, the instrumentation
//! entry-point switch, GC object classification, the thread list and the
//! background worker pool) is reached through a single [`Host`] handed to
//! [`JitCodeCache::new`](crate::JitCodeCache::new).

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

// =============================================================================
// Handles
// =============================================================================

/// Opaque pointer to a runtime method.
///
/// The cache only uses it as a stable key. Its numeric value is the address
/// of the method's runtime record, which is what `remove_methods_in` tests
/// against when a class loader is unloaded.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodHandle(usize);

impl MethodHandle {
    /// Wrap a raw method address.
    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// Raw address of the method record.
    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Debug for MethodHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Method({:#x})", self.0)
    }
}

/// A reference to a managed heap object, or one of the two marker values.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ObjectRef(usize);

impl ObjectRef {
    /// The null reference.
    pub const NULL: ObjectRef = ObjectRef(0);

    /// Replaces class roots whose class was found unreachable.
    ///
    /// Compiled code compares against class roots; a sentinel that can never
    /// equal a real class keeps those comparisons failing safely.
    pub const WEAK_SENTINEL: ObjectRef = ObjectRef(1);

    /// Wrap a raw object address.
    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// Raw address.
    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// True for [`ObjectRef::NULL`].
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True for [`ObjectRef::WEAK_SENTINEL`].
    #[inline]
    pub const fn is_sentinel(self) -> bool {
        self.0 == Self::WEAK_SENTINEL.0
    }

    /// True when the value names a real object.
    #[inline]
    pub const fn is_object(self) -> bool {
        self.0 > Self::WEAK_SENTINEL.0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ObjectRef::NULL => f.write_str("null"),
            ObjectRef::WEAK_SENTINEL => f.write_str("<sentinel>"),
            ObjectRef(addr) => write!(f, "Obj({:#x})", addr),
        }
    }
}

/// Identifies the bytecode package (dex file) a method or class came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageId(pub u32);

// =============================================================================
// Metadata
// =============================================================================

bitflags! {
    /// Access flags of a method that matter to the cache.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MethodFlags: u32 {
        const STATIC = 1 << 0;
        const NATIVE = 1 << 1;
        const SYNCHRONIZED = 1 << 2;
        const FAST_NATIVE = 1 << 3;
        const CRITICAL_NATIVE = 1 << 4;
    }
}

/// What the cache needs to know about a method.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    /// Compact signature: return type character followed by one character
    /// per argument.
    pub shorty: Arc<str>,
    pub flags: MethodFlags,
    /// Class object that declares the method.
    pub declaring_class: ObjectRef,
    /// Package the method's bytecode lives in.
    pub package: PackageId,
}

impl MethodInfo {
    #[inline]
    pub fn is_native(&self) -> bool {
        self.flags.contains(MethodFlags::NATIVE)
    }
}

/// What the profile exporter needs to know about a class.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    /// Type descriptor, e.g. `Ljava/lang/String;` or `[I`.
    pub descriptor: Arc<str>,
    pub package: PackageId,
    /// Type index of the class inside `package`.
    pub type_index: u32,
    pub is_array: bool,
}

/// Classification of a root embedded in compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    /// Strongly interned string.
    String,
    /// Class object; weak.
    Class,
    /// Method-type object; strong for the owning method's lifetime.
    MethodType,
    /// Anything else; an ordinary reference.
    Other,
}

// =============================================================================
// Threads
// =============================================================================

/// A frame reported by a mutator thread's stack walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Return or current PC of the frame.
    pub pc: usize,
    /// Method executing in the frame, when known.
    pub method: Option<MethodHandle>,
    /// Inlined frames share the PC of their outer frame and are skipped.
    pub is_inlined: bool,
}

/// Walks one suspended mutator's stack.
pub trait StackWalker {
    /// Report every frame, innermost first.
    fn walk(&self, visitor: &mut dyn FnMut(&Frame));
}

/// Closure run once by every live mutator at its next safepoint.
pub trait Checkpoint: Send + Sync {
    /// Run on behalf of one thread. Implementations must tolerate being
    /// called concurrently from several threads.
    fn run(&self, thread: &dyn StackWalker);
}

// =============================================================================
// Host
// =============================================================================

/// The runtime environment of a code cache.
pub trait Host: Send + Sync {
    /// Metadata of a live method.
    fn method_info(&self, method: MethodHandle) -> MethodInfo;

    /// Currently installed entry point of `method`.
    fn entry_point(&self, method: MethodHandle) -> usize;

    /// Atomically switch `method` to `entry`, visible to all threads.
    fn set_entry_point(&self, method: MethodHandle, entry: usize);

    /// Revert `method` to its interpreter entry.
    fn reinitialize_to_default(&self, method: MethodHandle);

    /// Whether the single-implementation assumption about `method` still holds.
    fn has_single_implementation(&self, _method: MethodHandle) -> bool {
        true
    }

    /// Classify an object embedded as a compiled-code root.
    fn root_kind(&self, obj: ObjectRef) -> RootKind;

    /// Whether the collector may move `obj`.
    fn is_moving_object(&self, obj: ObjectRef) -> bool;

    /// Record a reference store into `holder`.
    fn write_barrier(&self, holder: ObjectRef);

    /// Metadata of a class seen in an inline cache.
    fn class_info(&self, class: ObjectRef) -> ClassInfo;

    /// Look up a type by descriptor inside `package`.
    fn find_type_index(&self, package: PackageId, descriptor: &str) -> Option<u32>;

    /// Ask every live mutator to run `checkpoint`.
    ///
    /// Returns the number of threads that will run it. Threads may run it
    /// before or after this call returns.
    fn run_checkpoint(&self, checkpoint: Arc<dyn Checkpoint>) -> usize;

    /// Queue work on the runtime's background pool.
    fn enqueue_task(&self, task: Box<dyn FnOnce() + Send>);

    /// Drop queued background work (used in a freshly forked child).
    fn discard_tasks(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ref_markers() {
        assert!(ObjectRef::NULL.is_null());
        assert!(!ObjectRef::NULL.is_object());
        assert!(ObjectRef::WEAK_SENTINEL.is_sentinel());
        assert!(!ObjectRef::WEAK_SENTINEL.is_object());
        assert!(ObjectRef::from_addr(0x1000).is_object());
    }

    #[test]
    fn test_method_info_native() {
        let info = MethodInfo {
            shorty: Arc::from("V"),
            flags: MethodFlags::NATIVE | MethodFlags::STATIC,
            declaring_class: ObjectRef::NULL,
            package: PackageId(0),
        };
        assert!(info.is_native());
    }
}
