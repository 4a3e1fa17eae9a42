//! Kiln JIT code cache
//!
//! Owns the memory that dynamically compiled machine code and its metadata
//! live in, and everything needed to use that code safely while threads run
//! it and the garbage collector moves objects underneath it.
//!
//! # Architecture
//!
//! - **Regions**: one reserved address window per cache, split into an
//!   executable half and a data half. Code is written through a second,
//!   writable mapping of the same pages when the platform allows it.
//!
//! - **Pools**: first-fit allocators over each half, capped by a footprint
//!   that doubles whenever the cache grows.
//!
//! - **Index**: entry point → blob, method → blobs, and the shared native
//!   stubs keyed by signature shape.
//!
//! - **Collection**: replaced or invalidated code becomes a zombie. A
//!   background collection marks blobs still on some thread's stack and
//!   frees the rest.
//!
//! - **Roots**: objects embedded in compiled code are reported to the GC,
//!   strongly or weakly depending on their kind.
//!
//! - **Zygote sharing**: a zygote publishes a method → code map that its
//!   forked children read without copying.
//!
//! # Usage
//!
//! ```ignore
//! use kiln_jit::{CodeCacheConfig, CommitRequest, CompilationKind, JitCodeCache};
//!
//! let cache = JitCodeCache::new(CodeCacheConfig::default(), host)?;
//! let reservation = cache.reserve(code.len(), 0, 0)?;
//! cache.commit(reservation, &CommitRequest::new(method, &code, CompilationKind::Baseline));
//! ```

#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aot;
pub mod blob;
pub mod cache;
pub mod collector;
pub mod config;
pub mod error;
pub mod host;
pub mod index;
pub mod jni;
pub mod mem_map;
pub mod pool;
pub mod profiling;
pub mod region;
pub mod roots;
pub mod shared_map;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod zombie;

mod stats;

// Re-exports for convenient access
pub use aot::{AotImage, AotImageId, AotMethod};
pub use blob::{BlobFlags, BlobInfo, CompilationKind};
pub use cache::{CommitRequest, JitCodeCache, JniPrepare, Reservation};
pub use collector::CollectorState;
pub use config::{CodeCacheConfig, ConfigError};
pub use error::{CacheError, RegionError};
pub use host::{
    Checkpoint, ClassInfo, Frame, Host, MethodFlags, MethodHandle, MethodInfo, ObjectRef,
    PackageId, RootKind, StackWalker,
};
pub use profiling::{ProfiledClass, ProfiledInlineCache, ProfiledMethod, ProfilingRecord};
pub use region::{MemoryRegion, RegionOptions};
pub use roots::RootVisitor;
pub use shared_map::ZygoteCompilationState;
pub use stats::{CodeCacheSnapshot, CodeCacheStats};
