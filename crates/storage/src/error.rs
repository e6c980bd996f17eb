//! Storage error types.

use pgreg_metadata::MetadataError;
use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("tarball not found: {0}")]
    NotFound(String),

    #[error("tarball already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Metadata(MetadataError),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the database cannot currently serve requests.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Metadata(err) if err.is_unavailable())
    }
}

impl From<MetadataError> for StorageError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(key) => Self::NotFound(key),
            MetadataError::AlreadyExists(key) => Self::AlreadyExists(key),
            MetadataError::InvalidKey(msg) => Self::InvalidKey(msg),
            other => Self::Metadata(other),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
