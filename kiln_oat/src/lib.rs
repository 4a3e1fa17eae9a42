//! Kiln AOT container loader
//!
//! Maps ahead-of-time compiled containers into the process, validates
//! every table they carry against their side file, and publishes their
//! methods and `.bss` roots into the JIT code cache.
//!
//! # Architecture
//!
//! - **ELF**: containers are ELF64 shared objects whose dynamic symbols
//!   (`oatdata`, `oatbss`, ...) delimit the sections the loader needs.
//!
//! - **Loading**: the dynamic linker maps the file when asked to and able;
//!   otherwise the loader maps the `PT_LOAD` segments itself, optionally
//!   into an address range the caller reserved.
//!
//! - **Validation**: header, per-dex records, class tables and index
//!   mappings are bounds- and alignment-checked. Any anomaly rejects the
//!   container with a descriptive [`LoadError`].
//!
//! - **Relocation**: boot-image references in `.data.img.rel.ro` are
//!   patched to the current image bases.
//!
//! # Usage
//!
//! ```ignore
//! use kiln_oat::{LoadOptions, OatFile};
//!
//! let oat = OatFile::open("/data/app/base.oat", LoadOptions::default())?;
//! let image = oat.publish(&cache, &mut |dex, class, method| resolve(dex, class, method))?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub(crate) mod bytes;
pub mod dex_record;
pub mod elf;
pub mod error;
pub mod header;
pub mod loader;
pub mod publish;
pub mod relocation;
pub mod sidecar;
pub mod vdex;
pub mod writer;

// Re-exports for convenient access
pub use dex_record::{BssMappings, IndexBssMapping, OatClass, OatClassKind, OatDexFile};
pub use error::{LoadError, Result};
pub use header::{InstructionSet, OatHeader};
pub use loader::{LoadOptions, LoaderState, OatFile};
pub use publish::MethodResolver;
pub use relocation::RelRo;
pub use sidecar::Sidecar;
pub use vdex::VdexFile;
pub use writer::{DexInput, OatWriter, WrittenLayout};
