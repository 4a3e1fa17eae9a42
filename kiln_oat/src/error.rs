//! Container rejection reasons.
//!
//! The `Display` text of every variant is the diagnostic reported to the
//! caller, who decides whether to fall back to interpreting bytecode.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Why a container could not be loaded.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to open '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to map container: {0}")]
    Map(#[from] kiln_jit::RegionError),

    #[error("dlopen failed: {0}")]
    Dlopen(String),

    #[error("invalid ELF file: {0}")]
    InvalidElf(&'static str),

    #[error("required symbol '{0}' not found")]
    MissingSymbol(&'static str),

    #[error("invalid {what} magic: {found:02x?}")]
    BadMagic { what: &'static str, found: Vec<u8> },

    #[error("unsupported {what} version: {found:02x?}")]
    BadVersion { what: &'static str, found: Vec<u8> },

    #[error("truncated {what}: needs {needed} bytes at offset {offset:#x}, only {size} available")]
    Truncated {
        what: &'static str,
        offset: usize,
        needed: usize,
        size: usize,
    },

    #[error("misaligned {what}: {value:#x} is not {alignment}-byte aligned")]
    Misaligned {
        what: &'static str,
        value: usize,
        alignment: usize,
    },

    #[error("invalid layout: {0}")]
    Layout(String),

    #[error("dex file count mismatch: container has {container}, vdex has {vdex}")]
    DexCountMismatch { container: usize, vdex: usize },

    #[error("checksum does not match for '{location}' (slot {index}): container {container:#010x}, vdex {vdex:#010x}")]
    ChecksumMismatch {
        location: String,
        index: usize,
        container: u32,
        vdex: u32,
    },

    #[error("duplicate dex location '{0}'")]
    DuplicateLocation(String),

    #[error("type lookup table of '{location}' has {found} bytes, expected {expected}")]
    LookupTableSize {
        location: String,
        found: usize,
        expected: usize,
    },

    #[error("relocation section present without a boot image dependency")]
    MissingBootImageDependency,

    #[error("sidecar timestamp {sidecar_ns} does not match container mtime {container_ns}")]
    SidecarMismatch { sidecar_ns: u128, container_ns: u128 },

    #[error("malformed sidecar: {0}")]
    Sidecar(String),
}

impl LoadError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LoadError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn layout(msg: impl Into<String>) -> Self {
        LoadError::Layout(msg.into())
    }
}

pub type Result<T, E = LoadError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_message() {
        let err = LoadError::ChecksumMismatch {
            location: "base.apk!classes2.dex".into(),
            index: 1,
            container: 0x1234,
            vdex: 0x5678,
        };
        let msg = err.to_string();
        assert!(msg.contains("checksum does not match"), "{msg}");
        assert!(msg.contains("classes2.dex"));
    }

    #[test]
    fn test_truncated_message() {
        let err = LoadError::Truncated {
            what: "dex record",
            offset: 0x40,
            needed: 4,
            size: 2,
        };
        assert_eq!(
            err.to_string(),
            "truncated dex record: needs 4 bytes at offset 0x40, only 2 available"
        );
    }
}
