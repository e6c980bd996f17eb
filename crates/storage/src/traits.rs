//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Chunk size used when copying from readers.
pub const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Identity of one tarball: `(storage, package, name)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TarballKey {
    pub storage: String,
    pub package: String,
    pub name: String,
}

impl TarballKey {
    pub fn new(
        storage: impl Into<String>,
        package: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            storage: storage.into(),
            package: package.into(),
            name: name.into(),
        }
    }

    /// Reject keys that cannot name a tarball.
    pub fn validate(&self) -> StorageResult<()> {
        for (field, value) in [
            ("storage", &self.storage),
            ("package", &self.package),
            ("name", &self.name),
        ] {
            if value.is_empty() {
                return Err(StorageError::InvalidKey(format!("empty {field} in {self}")));
            }
            if value.contains('\0') {
                return Err(StorageError::InvalidKey(format!("NUL byte in {field}")));
            }
        }
        Ok(())
    }
}

impl fmt::Display for TarballKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.storage, self.package, self.name)
    }
}

/// What an upload does when the key already holds a tarball.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Swap in the new bytes and release the old object.
    #[default]
    Replace,
    /// Fail with `AlreadyExists`.
    CreateNew,
}

/// An open tarball: its size, then its bytes.
pub struct TarballReader {
    /// Total size in bytes, known before any byte is streamed.
    pub size: u64,
    pub stream: ByteStream,
}

impl fmt::Debug for TarballReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TarballReader")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Tarball storage.
#[async_trait]
pub trait TarballStore: Send + Sync + 'static {
    /// Check if a tarball exists.
    async fn exists(&self, key: &TarballKey) -> StorageResult<bool>;

    /// Get a tarball's size without fetching content.
    async fn head(&self, key: &TarballKey) -> StorageResult<u64>;

    /// Open a tarball for streaming.
    ///
    /// The returned stream holds database resources until it is consumed
    /// or dropped.
    async fn get_stream(&self, key: &TarballKey) -> StorageResult<TarballReader>;

    /// Get a tarball's content.
    async fn get(&self, key: &TarballKey) -> StorageResult<Bytes> {
        let reader = self.get_stream(key).await?;
        let mut buf = Vec::with_capacity(usize::try_from(reader.size).unwrap_or(0));
        let mut stream = reader.stream;
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }

    /// Start a streaming upload.
    async fn put_stream(
        &self,
        key: &TarballKey,
        mode: WriteMode,
    ) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Store a tarball from memory.
    async fn put(&self, key: &TarballKey, data: Bytes, mode: WriteMode) -> StorageResult<u64> {
        let mut upload = self.put_stream(key, mode).await?;
        if let Err(err) = upload.write(data).await {
            abort_upload(upload).await;
            return Err(err);
        }
        upload.finish().await
    }

    /// Delete a tarball. Deleting an absent tarball succeeds.
    async fn delete(&self, key: &TarballKey) -> StorageResult<()>;

    /// Delete every tarball of a package, returning how many were removed.
    async fn delete_package(&self, storage: &str, package: &str) -> StorageResult<u64>;

    /// Delete every tarball of a package and its manifest document in one
    /// transaction, returning how many tarballs were removed. On error
    /// nothing is removed.
    async fn remove_package(&self, storage: &str, package: &str) -> StorageResult<u64>;

    /// Get the name of this storage backend.
    fn backend_name(&self) -> &'static str;
}

/// Trait for streaming uploads.
///
/// Dropping an upload without calling `finish` discards everything written.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

/// Roll back an upload after a failed write. The write error is what the
/// caller reports, so a failing abort is only logged.
async fn abort_upload(upload: Box<dyn StreamingUpload>) {
    if let Err(abort_err) = upload.abort().await {
        tracing::warn!(error = %abort_err, "Failed to abort upload");
    }
}

/// Pipe a byte stream into an upload and finish it.
///
/// An error item in `input` aborts the upload and is returned; nothing is
/// committed.
pub async fn copy_stream<S>(mut input: S, mut upload: Box<dyn StreamingUpload>) -> StorageResult<u64>
where
    S: Stream<Item = StorageResult<Bytes>> + Send + Unpin,
{
    while let Some(chunk) = input.next().await {
        let written = match chunk {
            Ok(data) => upload.write(data).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            tracing::debug!(error = %err, "Aborting upload");
            abort_upload(upload).await;
            return Err(err);
        }
    }
    upload.finish().await
}

/// Pipe an async reader into an upload and finish it.
pub async fn copy_reader<R>(mut reader: R, mut upload: Box<dyn StreamingUpload>) -> StorageResult<u64>
where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(error = %err, "Aborting upload");
                abort_upload(upload).await;
                return Err(err.into());
            }
        };
        if n == 0 {
            break;
        }
        if let Err(err) = upload.write(Bytes::copy_from_slice(&buf[..n])).await {
            tracing::debug!(error = %err, "Aborting upload");
            abort_upload(upload).await;
            return Err(err);
        }
    }
    upload.finish().await
}
