//! Tarball storage for pgreg.
//!
//! This crate provides:
//! - The [`TarballStore`] abstraction with streaming reads and uploads
//! - A backend on PostgreSQL large objects with transactional replace and delete

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::large_object::LargeObjectStore;
pub use error::{StorageError, StorageResult};
pub use traits::{
    ByteStream, StreamingUpload, TarballKey, TarballReader, TarballStore, WriteMode, copy_reader,
    copy_stream,
};

