//! File-system configuration.
//!
//! All tunables live in one immutable [`FsConfig`] value that is threaded
//! through construction — there is no process-global state. Invalid
//! combinations are rejected at mount time via [`FsConfig::validate`].
//!
//! The two WAL knobs interact: appends accumulate until
//! [`FsConfig::wal_barrier_size`] bytes are in flight, at which point the
//! write path forces a device-level sync (a *barrier*). The barrier size
//! must be a multiple of [`FsConfig::sparse_buffer_size`] so that buffer
//! flushes never straddle a barrier boundary, and the sparse buffer size
//! must be a power-of-two multiple of the device block size so that flushed
//! extents stay block-aligned.

use thiserror::Error;

/// Errors produced by configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A parameter is zero, out of range, or violates an alignment rule.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Immutable file-system configuration.
///
/// Passed to [`ZonedFs::mount`](crate::fs::ZonedFs::mount) and copied into
/// every file object constructed afterwards.
#[derive(Debug, Clone, Copy)]
pub struct FsConfig {
    /// Size of the writable-view sparse staging buffer (bytes).
    ///
    /// Must be a power-of-two multiple of the device block size. Each
    /// buffer flush produces at most one on-media extent of this size.
    pub sparse_buffer_size: u64,

    /// WAL barrier size (bytes).
    ///
    /// Must be positive and a multiple of `sparse_buffer_size`. Bounds the
    /// amount of unordered in-flight WAL data and, on the read side, the
    /// size of one recovery chunk.
    pub wal_barrier_size: u64,

    /// Number of zones at the front of the device reserved for WAL files.
    ///
    /// The remaining zones form the regular IO pool.
    pub wal_zones: u32,

    /// Size of the dense (non-sparse) staging buffer (bytes).
    pub dense_buffer_size: u64,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            sparse_buffer_size: 1024 * 1024,
            wal_barrier_size: 1024 * 1024,
            wal_zones: 4,
            dense_buffer_size: 1024 * 1024,
        }
    }
}

impl FsConfig {
    /// Validate this configuration against the device block size.
    pub fn validate(&self, block_size: u32) -> Result<(), ConfigError> {
        let block_size = u64::from(block_size);

        if block_size != 512 && block_size != 4096 {
            return Err(ConfigError::Invalid(format!(
                "unsupported block size {block_size} (expected 512 or 4096)"
            )));
        }
        if self.sparse_buffer_size == 0 || self.sparse_buffer_size % block_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "sparse buffer size {} is not a multiple of the block size {block_size}",
                self.sparse_buffer_size
            )));
        }
        if !(self.sparse_buffer_size / block_size).is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "sparse buffer size {} is not a power-of-two multiple of the block size",
                self.sparse_buffer_size
            )));
        }
        if self.wal_barrier_size == 0 || self.wal_barrier_size % self.sparse_buffer_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "WAL barrier size {} is not a positive multiple of the sparse buffer size {}",
                self.wal_barrier_size, self.sparse_buffer_size
            )));
        }
        if self.dense_buffer_size == 0 || self.dense_buffer_size % block_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "dense buffer size {} is not a multiple of the block size {block_size}",
                self.dense_buffer_size
            )));
        }
        if self.wal_zones == 0 {
            return Err(ConfigError::Invalid(
                "at least one WAL zone is required".to_string(),
            ));
        }
        Ok(())
    }
}
