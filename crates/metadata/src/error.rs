//! Metadata store error types.

use thiserror::Error;

/// PostgreSQL SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("{operation} failed for '{key}': {source}")]
    Query {
        operation: &'static str,
        key: String,
        #[source]
        source: sqlx::Error,
    },

    #[error(
        "migration state corrupted: applied {applied:?} is not a prefix of defined {defined:?}"
    )]
    MigrationCorrupted {
        applied: Vec<String>,
        defined: Vec<String>,
    },

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("storage locked: {0}")]
    Locked(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Whether the error means the requested resource is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the error means the database cannot currently serve requests.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Query { source, .. } => is_connectivity_error(source),
            _ => false,
        }
    }
}

impl From<pgreg_core::Error> for MetadataError {
    fn from(err: pgreg_core::Error) -> Self {
        match err {
            pgreg_core::Error::InvalidToken(msg) => Self::InvalidKey(msg),
            pgreg_core::Error::Serialization(msg) => Self::Internal(msg),
            other => Self::Config(other.to_string()),
        }
    }
}

/// Whether a sqlx error comes from the connection rather than the statement.
pub fn is_connectivity_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Whether a sqlx error is a unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

/// Attach operation context to database errors.
pub trait QueryContext<T> {
    /// Wrap a failed query with the operation name and the key it touched.
    fn context(self, operation: &'static str, key: &str) -> MetadataResult<T>;
}

impl<T> QueryContext<T> for Result<T, sqlx::Error> {
    fn context(self, operation: &'static str, key: &str) -> MetadataResult<T> {
        self.map_err(|source| {
            if is_unique_violation(&source) {
                MetadataError::AlreadyExists(key.to_string())
            } else if is_connectivity_error(&source) {
                MetadataError::Unavailable(format!("{operation} '{key}': {source}"))
            } else {
                MetadataError::Query {
                    operation,
                    key: key.to_string(),
                    source,
                }
            }
        })
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_unavailable() {
        let result: Result<(), sqlx::Error> = Err(sqlx::Error::PoolTimedOut);
        let err = result.context("packages.read", "default/pkg").unwrap_err();
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("packages.read"));
    }

    #[test]
    fn test_row_not_found_keeps_context() {
        let result: Result<(), sqlx::Error> = Err(sqlx::Error::RowNotFound);
        let err = result.context("kv.get", "alice:k1").unwrap_err();
        match &err {
            MetadataError::Query { operation, key, .. } => {
                assert_eq!(*operation, "kv.get");
                assert_eq!(key, "alice:k1");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_unavailable());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_migration_corrupted_message_lists_names() {
        let err = MetadataError::MigrationCorrupted {
            applied: vec!["000-a".to_string(), "001-x".to_string()],
            defined: vec!["000-a".to_string(), "001-b".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("migration state corrupted"));
        assert!(msg.contains("001-x"));
    }

    #[test]
    fn test_core_token_error_maps_to_invalid_key() {
        let err: MetadataError = pgreg_core::Error::InvalidToken("bad".to_string()).into();
        assert!(matches!(err, MetadataError::InvalidKey(_)));
    }
}
