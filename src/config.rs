//! Configuration shared by manifest generation and copying.

use crate::error::{BmapError, Result};
use crate::hash::ChecksumType;

/// Smallest accepted block size.
pub const MIN_BLOCK_SIZE: u64 = 512;
/// Largest accepted block size.
pub const MAX_BLOCK_SIZE: u64 = 1024 * 1024;
/// Block size used when the filesystem does not report a usable one.
pub const FALLBACK_BLOCK_SIZE: u64 = 4096;

/// Configuration for generate and copy operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Block size of the map. `None` uses the filesystem's reported block size.
    pub block_size: Option<u64>,
    /// Checksum algorithm recorded in generated manifests.
    pub checksum_type: ChecksumType,
    /// I/O buffer size.
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: None,
            checksum_type: ChecksumType::Sha256,
            buffer_size: 1024 * 1024,
        }
    }
}

/// Builder for [`Config`].
///
/// # Example
///
/// ```rust
/// use bmapcopy::{ChecksumType, ConfigBuilder};
///
/// let config = ConfigBuilder::new()
///     .block_size(4096)
///     .checksum_type(ChecksumType::Blake3)
///     .buffer_size(256 * 1024)
///     .build();
/// assert_eq!(config.block_size, Some(4096));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set a fixed block size instead of the filesystem's.
    ///
    /// # Panics
    ///
    /// Panics if the block size is not a power of 2 between 512 and 1 MiB.
    #[must_use]
    pub fn block_size(mut self, size: u64) -> Self {
        assert!(
            validate_block_size(size).is_ok(),
            "Block size must be power of 2, 512-1048576"
        );
        self.config.block_size = Some(size);
        self
    }

    /// Set the checksum algorithm.
    #[must_use]
    pub fn checksum_type(mut self, checksum_type: ChecksumType) -> Self {
        self.config.checksum_type = checksum_type;
        self
    }

    /// Set the I/O buffer size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        assert!(size > 0, "Buffer size must be non-zero");
        self.config.buffer_size = size;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        self.config
    }
}

/// Check that a block size is a power of two within the accepted bounds.
///
/// # Errors
///
/// Returns `InvalidBlockSize` if the block size is invalid.
pub fn validate_block_size(block_size: u64) -> Result<()> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) || !block_size.is_power_of_two() {
        return Err(BmapError::InvalidBlockSize(block_size));
    }
    Ok(())
}

/// Block size reported by the filesystem for `metadata`, or
/// [`FALLBACK_BLOCK_SIZE`] when it is missing or out of bounds.
#[must_use]
pub fn filesystem_block_size(metadata: &std::fs::Metadata) -> u64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let reported = metadata.blksize();
        if validate_block_size(reported).is_ok() {
            return reported;
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;
    FALLBACK_BLOCK_SIZE
}
