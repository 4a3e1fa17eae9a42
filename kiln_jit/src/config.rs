//! Code cache configuration parameters.
//!
//! Capacities are in bytes and cover code and data together; each arena gets
//! half. Default values suit an application process.

use thiserror::Error;

use crate::mem_map::page_size;

/// Largest capacity the cache may grow to.
///
/// Code and data live in one address window so that the offsets between them
/// fit in 32 bits.
pub const MAX_CAPACITY_LIMIT: usize = 1024 * 1024 * 1024;

/// Configuration for a [`JitCodeCache`](crate::JitCodeCache).
///
/// # Example
///
/// ```ignore
/// use kiln_jit::CodeCacheConfig;
///
/// let config = CodeCacheConfig {
///     initial_capacity: 256 * 1024,
///     ..Default::default()
/// };
/// config.validate()?;
/// ```
#[derive(Debug, Clone)]
pub struct CodeCacheConfig {
    // =========================================================================
    // Capacity
    // =========================================================================
    /// Usable bytes (code + data) when the cache is created.
    ///
    /// Default: 64KB
    pub initial_capacity: usize,

    /// Usable bytes the cache may grow to by repeated doubling.
    ///
    /// Default: 64MB
    pub max_capacity: usize,

    // =========================================================================
    // Collection
    // =========================================================================
    /// Number of retired blobs that schedules a background collection.
    ///
    /// Default: 1000 (1 in debug builds)
    pub collection_threshold: usize,

    // =========================================================================
    // Process model
    // =========================================================================
    /// The process is a zygote: code goes into a region its children inherit.
    pub is_zygote: bool,

    /// Try to map code twice (RX for execution, RW for writing).
    ///
    /// Without a dual view, code writes temporarily re-protect the pages.
    pub use_dual_view: bool,

    /// The kernel lazily reclaims advised-away pages and reports them as
    /// still resident; freed pages are then kept instead of released.
    pub lazy_release_bug: bool,
}

impl Default for CodeCacheConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 64 * 1024,
            max_capacity: 64 * 1024 * 1024,
            collection_threshold: if cfg!(debug_assertions) { 1 } else { 1000 },
            is_zygote: false,
            use_dual_view: true,
            lazy_release_bug: false,
        }
    }
}

impl CodeCacheConfig {
    /// Small configuration for tests.
    pub fn for_testing() -> Self {
        Self {
            initial_capacity: 128 * 1024,
            max_capacity: 4 * 1024 * 1024,
            collection_threshold: 1000,
            ..Default::default()
        }
    }

    /// Configuration of a zygote that pre-warms code for its children.
    pub fn zygote() -> Self {
        Self {
            is_zygote: true,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let granule = 2 * page_size();
        if self.initial_capacity == 0 || self.max_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.initial_capacity % granule != 0 || self.max_capacity % granule != 0 {
            return Err(ConfigError::Unaligned { granule });
        }
        if self.initial_capacity > self.max_capacity {
            return Err(ConfigError::InitialAboveMax {
                initial: self.initial_capacity,
                max: self.max_capacity,
            });
        }
        if self.max_capacity > MAX_CAPACITY_LIMIT {
            return Err(ConfigError::CapacityTooLarge(self.max_capacity));
        }
        if self.collection_threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("code cache capacity must be non-zero")]
    ZeroCapacity,
    #[error("code cache capacities must be multiples of {granule} bytes")]
    Unaligned { granule: usize },
    #[error("initial capacity {initial} exceeds maximum capacity {max}")]
    InitialAboveMax { initial: usize, max: usize },
    #[error("maximum capacity {0} exceeds the 1GB limit")]
    CapacityTooLarge(usize),
    #[error("collection threshold must be at least 1")]
    ZeroThreshold,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CodeCacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_preset_configs_are_valid() {
        assert!(CodeCacheConfig::for_testing().validate().is_ok());
        assert!(CodeCacheConfig::zygote().validate().is_ok());
    }

    #[test]
    fn test_capacity_above_limit() {
        let config = CodeCacheConfig {
            max_capacity: 2 * MAX_CAPACITY_LIMIT,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::CapacityTooLarge(2 * MAX_CAPACITY_LIMIT))
        );
    }

    #[test]
    fn test_initial_above_max() {
        let config = CodeCacheConfig {
            initial_capacity: 8 * 1024 * 1024,
            max_capacity: 4 * 1024 * 1024,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InitialAboveMax { .. })
        ));
    }

    #[test]
    fn test_unaligned_capacity() {
        let config = CodeCacheConfig {
            initial_capacity: 1000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Unaligned { .. })));
    }
}
