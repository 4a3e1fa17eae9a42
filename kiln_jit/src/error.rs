//! Error types of the code cache.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Failures of the memory mapping layer.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("failed to map {size} bytes: {source}")]
    MapFailed { size: usize, source: io::Error },
    #[error("failed to change protection of {size} bytes at {addr:#x}: {source}")]
    ProtectFailed {
        addr: usize,
        size: usize,
        source: io::Error,
    },
    #[error("failed to create dual-view backing file: {0}")]
    DualView(io::Error),
    #[error("invalid mapping size {0}")]
    InvalidSize(usize),
}

/// Failures reported to compiler threads and the embedding runtime.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Region(#[from] RegionError),
    /// Reservation failed after the cache reached its maximum capacity.
    #[error("code cache full: {requested} bytes requested, capacity {capacity} bytes")]
    CapacityExhausted { requested: usize, capacity: usize },
    /// The process has no region to compile into (child zygote, safe mode).
    #[error("code cache has no writable region")]
    Disabled,
    #[error("code cache is shutting down")]
    Shutdown,
}
