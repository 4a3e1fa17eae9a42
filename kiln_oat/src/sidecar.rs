//! Descriptor shipped next to preinstalled containers.
//!
//! A text file of `key=value` lines:
//!
//! ```text
//! sdm-timestamp-ns=1700000000123456789
//! apex-versions=/1/2/3
//! ```
//!
//! The timestamp must equal the container's mtime; the recorded APEX
//! versions replace the ones in the container header.

use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::error::{LoadError, Result};

const TIMESTAMP_KEY: &str = "sdm-timestamp-ns";
const APEX_VERSIONS_KEY: &str = "apex-versions";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sidecar {
    pub sdm_timestamp_ns: u128,
    pub apex_versions: String,
}

impl Sidecar {
    pub fn parse(text: &str) -> Result<Self> {
        let mut timestamp = None;
        let mut apex_versions = None;
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| LoadError::Sidecar(format!("line without '=': {line:?}")))?;
            match key.trim() {
                TIMESTAMP_KEY => {
                    let ns = value.trim().parse::<u128>().map_err(|e| {
                        LoadError::Sidecar(format!("bad {TIMESTAMP_KEY} {value:?}: {e}"))
                    })?;
                    timestamp = Some(ns);
                }
                APEX_VERSIONS_KEY => apex_versions = Some(value.trim().to_owned()),
                // Newer producers may add keys.
                _ => {}
            }
        }
        Ok(Self {
            sdm_timestamp_ns: timestamp
                .ok_or_else(|| LoadError::Sidecar(format!("missing {TIMESTAMP_KEY}")))?,
            apex_versions: apex_versions
                .ok_or_else(|| LoadError::Sidecar(format!("missing {APEX_VERSIONS_KEY}")))?,
        })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| LoadError::io(path, e))?;
        Self::parse(&text)
    }

    pub fn to_text(&self) -> String {
        format!(
            "{TIMESTAMP_KEY}={}\n{APEX_VERSIONS_KEY}={}\n",
            self.sdm_timestamp_ns, self.apex_versions
        )
    }

    /// Check the descriptor against the container at `container`.
    pub fn verify(&self, container: &Path) -> Result<()> {
        let container_ns = mtime_ns(container)?;
        if container_ns != self.sdm_timestamp_ns {
            return Err(LoadError::SidecarMismatch {
                sidecar_ns: self.sdm_timestamp_ns,
                container_ns,
            });
        }
        Ok(())
    }
}

/// Modification time of `path` in nanoseconds since the epoch.
pub fn mtime_ns(path: &Path) -> Result<u128> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| LoadError::io(path, e))?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default())
}
