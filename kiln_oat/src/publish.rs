//! Publishing a loaded container into the JIT code cache.
//!
//! Once registered, PCs inside the container resolve through
//! `lookup_header`, its `.bss` root slots are visited with the cache's
//! other GC roots, and executable containers become the entry points of
//! their methods.

use kiln_jit::{AotImage, AotImageId, AotMethod, JitCodeCache, MethodHandle};

use crate::error::{LoadError, Result};
use crate::loader::{LoaderState, OatFile};

/// Resolves `(dex file index, class def index, method index)` to the
/// runtime's method.
pub trait MethodResolver {
    fn resolve(&mut self, dex_file: usize, class_def: u32, method: u32) -> Option<MethodHandle>;
}

impl<F> MethodResolver for F
where
    F: FnMut(usize, u32, u32) -> Option<MethodHandle>,
{
    fn resolve(&mut self, dex_file: usize, class_def: u32, method: u32) -> Option<MethodHandle> {
        self(dex_file, class_def, method)
    }
}

impl OatFile {
    /// Collect every compiled method the resolver knows about.
    pub fn to_aot_image(&self, resolver: &mut dyn MethodResolver) -> Result<AotImage> {
        if self.state() != LoaderState::Ready {
            return Err(LoadError::layout(format!("container is {:?}, not Ready", self.state())));
        }
        let oatdata = self.oatdata();
        let base = self.oatdata_range().start;
        let exec = self.exec_range();
        let mut methods = Vec::new();
        for (dex_index, dex_file) in self.dex_files().iter().enumerate() {
            for class_def in 0..dex_file.class_defs_size {
                let class = dex_file.oat_class(oatdata, class_def)?;
                for (method_index, code_offset) in class.compiled() {
                    let entry = base + code_offset as usize;
                    if !exec.contains(&entry) || (code_offset as usize) < 4 {
                        return Err(LoadError::layout(format!(
                            "code of method {method_index} in class {class_def} of '{}' at {entry:#x} is outside the executable range",
                            dex_file.location
                        )));
                    }
                    let size_at = code_offset as usize - 4;
                    let code_size = u32::from_le_bytes([
                        oatdata[size_at],
                        oatdata[size_at + 1],
                        oatdata[size_at + 2],
                        oatdata[size_at + 3],
                    ]);
                    if entry + code_size as usize > exec.end {
                        return Err(LoadError::Truncated {
                            what: "compiled method",
                            offset: code_offset as usize,
                            needed: code_size as usize,
                            size: exec.end - entry,
                        });
                    }
                    let Some(method) = resolver.resolve(dex_index, class_def, method_index) else {
                        continue;
                    };
                    methods.push(AotMethod {
                        method,
                        entry,
                        code_size,
                    });
                }
            }
        }
        Ok(AotImage::new(
            self.path().display().to_string(),
            exec,
            methods,
            self.bss_roots_range(),
        )
        .executable(self.is_executable()))
    }

    /// Register the container with `cache`.
    ///
    /// An executable container also becomes the entry point of each resolved
    /// method that is not running JIT code.
    pub fn publish(&self, cache: &JitCodeCache, resolver: &mut dyn MethodResolver) -> Result<AotImageId> {
        let image = self.to_aot_image(resolver)?;
        tracing::debug!(
            path = %self.path().display(),
            methods = image.methods().len(),
            roots = image.bss_roots.len() / size_of::<usize>(),
            "publishing container"
        );
        Ok(cache.register_aot_image(image))
    }
}
