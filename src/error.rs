//! Error types for needlestore
//!
//! Provides a unified error type for all storage operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::volume::VolumeId;

/// Result type alias using StorageError
pub type Result<T> = std::result::Result<T, StorageError>;

/// Unified error type for needlestore operations
#[derive(Debug, Error)]
pub enum StorageError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An append failed and the data file could not be truncated back to
    /// the offset it had before the write. The volume tail may be torn.
    #[error("cannot truncate {path:?} back to offset {offset} after failed append ({cause}): {source}")]
    TruncateFailed {
        path: PathBuf,
        offset: u64,
        cause: String,
        #[source]
        source: std::io::Error,
    },

    // -------------------------------------------------------------------------
    // Needle Errors
    // -------------------------------------------------------------------------
    #[error("needle {0:x} not found")]
    NotFound(u64),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("invalid needle: {0}")]
    InvalidNeedle(String),

    #[error("invalid file id: {0}")]
    InvalidFileId(String),

    // -------------------------------------------------------------------------
    // Volume Errors
    // -------------------------------------------------------------------------
    #[error("volume {0} is read-only")]
    ReadOnlyVolume(VolumeId),

    #[error("volume {0} not found")]
    VolumeNotFound(VolumeId),

    #[error("volume {0} already exists")]
    VolumeAlreadyExists(VolumeId),

    #[error("volume {volume} size limit {limit} exceeded, current size is {size}")]
    CapacityExceeded {
        volume: VolumeId,
        size: u64,
        limit: u64,
    },

    #[error("no more free space left")]
    NoFreeSpace,

    #[error("invalid volume id: {0}")]
    InvalidVolumeId(String),

    #[error("unsupported volume version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid ttl: {0}")]
    InvalidTtl(String),

    #[error("invalid replica placement: {0}")]
    InvalidReplicaPlacement(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether the error means "no such live needle" (absent, deleted or expired)
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}
