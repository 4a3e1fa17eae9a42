//! Ahead-of-time images registered with the cache.
//!
//! A loaded container registers its executable range, its compiled methods
//! and its `.bss` root slots. The cache then resolves PCs inside the image
//! and offers the root slots to the GC like any other strong roots. Images
//! mapped executable also have their methods' entry points installed.

use std::ops::Range;

use crate::blob::{BlobFlags, BlobInfo};
use crate::host::MethodHandle;

/// One precompiled method of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AotMethod {
    pub method: MethodHandle,
    pub entry: usize,
    pub code_size: u32,
}

/// A loaded AOT image.
#[derive(Debug, Clone)]
pub struct AotImage {
    /// Path the image was loaded from.
    pub location: String,
    /// Executable address range.
    pub exec: Range<usize>,
    /// Methods ordered by entry point.
    methods: Vec<AotMethod>,
    /// `ObjectRef` slots in the image's `.bss`.
    pub bss_roots: Range<usize>,
    /// Whether methods may be entered through the image's code.
    pub executable: bool,
}

impl AotImage {
    pub fn new(
        location: impl Into<String>,
        exec: Range<usize>,
        mut methods: Vec<AotMethod>,
        bss_roots: Range<usize>,
    ) -> Self {
        methods.sort_unstable_by_key(|m| m.entry);
        Self {
            location: location.into(),
            exec,
            methods,
            bss_roots,
            executable: false,
        }
    }

    /// Install the image's entry points when it is registered.
    pub fn executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }

    #[inline]
    pub fn contains(&self, pc: usize) -> bool {
        self.exec.contains(&pc)
    }

    pub fn methods(&self) -> &[AotMethod] {
        &self.methods
    }

    /// The method whose code covers `pc`.
    pub fn lookup(&self, pc: usize) -> Option<BlobInfo> {
        let idx = self.methods.partition_point(|m| m.entry <= pc).checked_sub(1)?;
        let found = self.methods[idx];
        let info = BlobInfo {
            entry: found.entry,
            code_size: found.code_size,
            flags: BlobFlags::OPTIMIZED,
            method: Some(found.method),
        };
        info.contains(pc).then_some(info)
    }
}

/// Handle returned by [`JitCodeCache::register_aot_image`](crate::JitCodeCache::register_aot_image).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AotImageId(pub(crate) u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_inside_image() {
        let image = AotImage::new(
            "/data/app.oat",
            0x1000..0x2000,
            vec![
                AotMethod {
                    method: MethodHandle::from_addr(2),
                    entry: 0x1100,
                    code_size: 0x20,
                },
                AotMethod {
                    method: MethodHandle::from_addr(1),
                    entry: 0x1000,
                    code_size: 0x40,
                },
            ],
            0..0,
        );
        assert!(image.contains(0x1800));
        assert_eq!(image.lookup(0x1010).unwrap().method, Some(MethodHandle::from_addr(1)));
        assert_eq!(image.lookup(0x111f).unwrap().entry, 0x1100);
        assert!(image.lookup(0x1040).is_none());
        assert!(image.lookup(0x0fff).is_none());
    }
}
