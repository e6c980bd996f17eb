//! Registry error types.

use pgreg_metadata::MetadataError;
use pgreg_storage::StorageError;

/// Error surfaced to the registry host.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("configuration error: {0}")]
    Config(String),

    /// A host callback refused the operation.
    #[error("aborted: {0}")]
    Aborted(String),

    #[error("core error: {0}")]
    Core(#[from] pgreg_core::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl RegistryError {
    /// Get the error code for this error.
    ///
    /// Codes mirror the signals a registry host maps to responses:
    /// missing resources, conflicts, refused writes and outages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Aborted(_) => "aborted",
            Self::Core(pgreg_core::Error::NoStorageConfigured(_)) => "no_storage",
            Self::Core(_) => "core_error",
            Self::Metadata(e) => metadata_code(e),
            Self::Storage(e) => match e {
                StorageError::NotFound(_) => "not_found",
                StorageError::AlreadyExists(_) => "conflict",
                StorageError::InvalidKey(_) => "invalid_key",
                StorageError::Stream(_) | StorageError::Io(_) => "stream_error",
                StorageError::Metadata(e) => metadata_code(e),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == "not_found"
    }

    pub fn is_conflict(&self) -> bool {
        self.code() == "conflict"
    }
}

fn metadata_code(err: &MetadataError) -> &'static str {
    match err {
        MetadataError::NotFound(_) => "not_found",
        MetadataError::AlreadyExists(_) => "conflict",
        MetadataError::Locked(_) => "locked",
        MetadataError::MigrationCorrupted { .. } => "migration_corrupted",
        MetadataError::InvalidKey(_) => "invalid_key",
        e if e.is_unavailable() => "unavailable",
        _ => "internal_error",
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
