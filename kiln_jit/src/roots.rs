//! GC roots embedded in compiled code.
//!
//! Every optimized blob carries an array of object references in its side
//! table. The GC reaches them through two callbacks:
//!
//! - [`JitCodeCache::visit_roots`] during marking: method-type and ordinary
//!   roots are strong, as are the `.bss` slots of registered AOT images.
//! - [`JitCodeCache::sweep_weak`] during reference processing, with the
//!   collector's `is_marked` oracle:
//!
//! | Root kind   | unmarked                   | marked (possibly moved) |
//! |-------------|----------------------------|-------------------------|
//! | String      | impossible (interned)      | updated                 |
//! | Class       | replaced by weak sentinel  | updated                 |
//! | MethodType  | cleared                    | updated                 |
//! | Other       | left alone                 | updated                 |
//!
//! Inline-cache classes in profiling records are swept in the same pass.

use crate::blob::{self, BlobHeader};
use crate::cache::JitCodeCache;
use crate::host::{ObjectRef, RootKind};
use crate::profiling::ProfilingRecord;

/// Receives strong roots during GC marking.
///
/// Implementations may rewrite the reference in place when the object moved.
pub trait RootVisitor {
    fn visit_root(&mut self, root: &mut ObjectRef);
}

impl<F> RootVisitor for F
where
    F: FnMut(&mut ObjectRef),
{
    fn visit_root(&mut self, root: &mut ObjectRef) {
        self(root)
    }
}

impl JitCodeCache {
    /// Offer the strong roots of compiled code to the GC.
    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        let _state = self.state.lock();
        let index = self.index.write();
        index.code.visit_all(|entry, indexed| {
            // SAFETY: indexed blobs are committed and not freed while the
            // index lock is held.
            let header = unsafe { BlobHeader::read(entry) };
            if header.side_table == 0 {
                return;
            }
            // SAFETY: as above; holding the index lock for writing excludes
            // every other access to the roots.
            let roots = unsafe { blob::roots_mut(header.side_table) };
            let mut has_method_type = false;
            for root in roots.iter_mut() {
                if !root.is_object() {
                    continue;
                }
                match self.host.root_kind(*root) {
                    RootKind::MethodType => {
                        has_method_type = true;
                        visitor.visit_root(root);
                    }
                    RootKind::Other => visitor.visit_root(root),
                    RootKind::String | RootKind::Class => {}
                }
            }
            if has_method_type {
                let holder = self.host.method_info(indexed.method).declaring_class;
                self.host.write_barrier(holder);
            }
        });

        for (_, image) in &index.aot_images {
            let slots = &image.bss_roots;
            if slots.is_empty() {
                continue;
            }
            let count = (slots.end - slots.start) / size_of::<ObjectRef>();
            // SAFETY: the loader registered a writable, pointer-aligned slot
            // range that stays mapped until the image is unregistered.
            let roots =
                unsafe { std::slice::from_raw_parts_mut(slots.start as *mut ObjectRef, count) };
            for root in roots.iter_mut().filter(|r| r.is_object()) {
                visitor.visit_root(root);
            }
        }
    }

    /// Clear or update weak roots after the GC marked the heap.
    ///
    /// `is_marked` returns the (possibly moved) object when it is live and
    /// `None` when it is dead.
    pub fn sweep_weak(&self, is_marked: &mut dyn FnMut(ObjectRef) -> Option<ObjectRef>) {
        let state = self.state.lock();
        let index = self.index.write();
        index.code.visit_all(|entry, _| {
            // SAFETY: see visit_roots.
            let header = unsafe { BlobHeader::read(entry) };
            if header.side_table == 0 {
                return;
            }
            // SAFETY: see visit_roots.
            let roots = unsafe { blob::roots_mut(header.side_table) };
            for root in roots.iter_mut() {
                if !root.is_object() {
                    continue;
                }
                let kind = self.host.root_kind(*root);
                match (kind, is_marked(*root)) {
                    (_, Some(moved)) => *root = moved,
                    (RootKind::String, None) => {
                        debug_assert!(false, "interned string root {root:?} is not marked");
                        tracing::error!(?root, "interned string root is not marked");
                    }
                    (RootKind::Class, None) => *root = ObjectRef::WEAK_SENTINEL,
                    (RootKind::MethodType, None) => *root = ObjectRef::NULL,
                    (RootKind::Other, None) => {}
                }
            }
        });

        for &addr in state.profiling.values() {
            // SAFETY: records stay allocated while listed in `profiling`.
            let record = unsafe { &*(addr as *const ProfilingRecord) };
            for ic in record.inline_caches() {
                ic.sweep(is_marked);
            }
        }
    }
}
