//! Tarball storage on PostgreSQL large objects.
//!
//! The `tarball` table maps `(storage, package, name)` to a large object OID.
//! Every write happens in one transaction: a fresh object is created and
//! filled, the pointer row is upserted, and the object it used to point at is
//! unlinked before commit. A rollback at any step undoes all of it, so a key
//! never points at a missing object and no object outlives its row.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, StreamingUpload, TarballKey, TarballReader, TarballStore, WriteMode};
use async_trait::async_trait;
use bytes::Bytes;
use pgreg_metadata::{ReadinessGate, delete_package_document};
use pgreg_metadata::error::QueryContext;
use sqlx::postgres::types::Oid;
use sqlx::{PgConnection, Postgres, Transaction};
use tracing::instrument;

/// Default size of a single `lowrite`/`loread` round trip.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// `INV_WRITE` mode flag for `lo_open`.
const INV_WRITE: i32 = 0x0002_0000;
/// `INV_READ` mode flag for `lo_open`.
const INV_READ: i32 = 0x0004_0000;

const SEEK_SET: i32 = 0;
const SEEK_END: i32 = 2;

/// Tarball store backed by PostgreSQL large objects.
#[derive(Clone)]
pub struct LargeObjectStore {
    gate: ReadinessGate,
    chunk_size: usize,
}

impl LargeObjectStore {
    /// Create a store sharing `gate` with the metadata store.
    pub fn new(gate: ReadinessGate) -> Self {
        Self {
            gate,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Use `chunk_size` bytes per large object round trip.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, i32::MAX as usize);
        self
    }
}

async fn lookup_file(
    conn: &mut PgConnection,
    key: &TarballKey,
    for_update: bool,
) -> StorageResult<Option<Oid>> {
    let sql = if for_update {
        "SELECT file FROM tarball WHERE storage = $1 AND package = $2 AND name = $3 FOR UPDATE"
    } else {
        "SELECT file FROM tarball WHERE storage = $1 AND package = $2 AND name = $3"
    };
    let file = sqlx::query_scalar(sql)
        .bind(&key.storage)
        .bind(&key.package)
        .bind(&key.name)
        .fetch_optional(conn)
        .await
        .context("tarball.lookup", &key.to_string())?;
    Ok(file)
}

/// Open `oid` and return its descriptor and size, positioned at the start.
async fn open_for_read(conn: &mut PgConnection, oid: Oid, label: &str) -> StorageResult<(i32, u64)> {
    let fd: i32 = sqlx::query_scalar("SELECT lo_open($1, $2)")
        .bind(oid)
        .bind(INV_READ)
        .fetch_one(&mut *conn)
        .await
        .context("tarball.open", label)?;

    let size: i64 = sqlx::query_scalar("SELECT lo_lseek64($1, 0, $2)")
        .bind(fd)
        .bind(SEEK_END)
        .fetch_one(&mut *conn)
        .await
        .context("tarball.size", label)?;

    sqlx::query("SELECT lo_lseek64($1, 0, $2)")
        .bind(fd)
        .bind(SEEK_SET)
        .execute(&mut *conn)
        .await
        .context("tarball.seek", label)?;

    let size = u64::try_from(size)
        .map_err(|_| StorageError::Stream(format!("negative size {size} for {label}")))?;
    Ok((fd, size))
}

async fn unlink(conn: &mut PgConnection, oid: Oid, label: &str) -> StorageResult<()> {
    sqlx::query("SELECT lo_unlink($1)")
        .bind(oid)
        .execute(conn)
        .await
        .context("tarball.unlink", label)?;
    Ok(())
}

/// Drop every tarball row of a package and unlink the objects they held.
async fn unlink_package(
    conn: &mut PgConnection,
    storage: &str,
    package: &str,
    label: &str,
) -> StorageResult<u64> {
    let files: Vec<Oid> = sqlx::query_scalar(
        "DELETE FROM tarball WHERE storage = $1 AND package = $2 RETURNING file",
    )
    .bind(storage)
    .bind(package)
    .fetch_all(&mut *conn)
    .await
    .context("tarball.delete_package", label)?;

    for oid in &files {
        unlink(&mut *conn, *oid, label).await?;
    }
    Ok(files.len() as u64)
}

#[async_trait]
impl TarballStore for LargeObjectStore {
    #[instrument(skip(self), fields(backend = "large-object", key = %key))]
    async fn exists(&self, key: &TarballKey) -> StorageResult<bool> {
        let pool = self.gate.ready().await?;
        let mut conn = pool
            .acquire()
            .await
            .context("tarball.acquire", &key.to_string())?;
        Ok(lookup_file(&mut conn, key, false).await?.is_some())
    }

    #[instrument(skip(self), fields(backend = "large-object", key = %key))]
    async fn head(&self, key: &TarballKey) -> StorageResult<u64> {
        let label = key.to_string();
        let pool = self.gate.ready().await?;
        // Large object descriptors only live inside a transaction.
        let mut tx = pool.begin().await.context("tarball.begin", &label)?;
        let oid = lookup_file(&mut tx, key, false)
            .await?
            .ok_or_else(|| StorageError::NotFound(label.clone()))?;
        let (_, size) = open_for_read(&mut tx, oid, &label).await?;
        tx.rollback().await.context("tarball.rollback", &label)?;
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "large-object", key = %key))]
    async fn get_stream(&self, key: &TarballKey) -> StorageResult<TarballReader> {
        key.validate()?;
        let label = key.to_string();
        let pool = self.gate.ready().await?;
        let mut tx = pool.begin().await.context("tarball.begin", &label)?;

        let oid = lookup_file(&mut tx, key, false)
            .await?
            .ok_or_else(|| StorageError::NotFound(label.clone()))?;
        let (fd, size) = open_for_read(&mut tx, oid, &label).await?;
        tracing::debug!(size, "Streaming tarball");

        let chunk_size = self.chunk_size as i32;
        let stream: ByteStream = Box::pin(async_stream::try_stream! {
            // The transaction pins the snapshot the object is read from.
            let mut tx: Transaction<'static, Postgres> = tx;
            loop {
                let data: Vec<u8> = sqlx::query_scalar("SELECT loread($1, $2)")
                    .bind(fd)
                    .bind(chunk_size)
                    .fetch_one(&mut *tx)
                    .await
                    .context("tarball.read", &label)?;
                if data.is_empty() {
                    break;
                }
                yield Bytes::from(data);
            }
            sqlx::query("SELECT lo_close($1)")
                .bind(fd)
                .execute(&mut *tx)
                .await
                .context("tarball.close", &label)?;
            tx.commit().await.context("tarball.commit", &label)?;
        });

        Ok(TarballReader { size, stream })
    }

    #[instrument(skip(self), fields(backend = "large-object", key = %key))]
    async fn put_stream(
        &self,
        key: &TarballKey,
        mode: WriteMode,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        key.validate()?;
        let label = key.to_string();
        let pool = self.gate.writable().await?;
        let mut tx = pool.begin().await.context("tarball.begin", &label)?;

        // Fail early; the authoritative check happens again at commit.
        if mode == WriteMode::CreateNew && lookup_file(&mut tx, key, false).await?.is_some() {
            return Err(StorageError::AlreadyExists(label));
        }

        let oid: Oid = sqlx::query_scalar("SELECT lo_create(0)")
            .fetch_one(&mut *tx)
            .await
            .context("tarball.create", &label)?;
        let fd: i32 = sqlx::query_scalar("SELECT lo_open($1, $2)")
            .bind(oid)
            .bind(INV_WRITE)
            .fetch_one(&mut *tx)
            .await
            .context("tarball.open", &label)?;

        tracing::debug!(oid = oid.0, "Opened large object for upload");

        Ok(Box::new(LargeObjectUpload {
            tx,
            key: key.clone(),
            label,
            mode,
            oid,
            fd,
            bytes_written: 0,
            chunk_size: self.chunk_size,
        }))
    }

    #[instrument(skip(self), fields(backend = "large-object", key = %key))]
    async fn delete(&self, key: &TarballKey) -> StorageResult<()> {
        let label = key.to_string();
        let pool = self.gate.writable().await?;
        let mut tx = pool.begin().await.context("tarball.begin", &label)?;

        let files: Vec<Oid> = sqlx::query_scalar(
            "DELETE FROM tarball WHERE storage = $1 AND package = $2 AND name = $3 RETURNING file",
        )
        .bind(&key.storage)
        .bind(&key.package)
        .bind(&key.name)
        .fetch_all(&mut *tx)
        .await
        .context("tarball.delete", &label)?;

        for oid in &files {
            unlink(&mut tx, *oid, &label).await?;
        }
        tx.commit().await.context("tarball.commit", &label)?;

        tracing::debug!(removed = files.len(), "Deleted tarball");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "large-object"))]
    async fn delete_package(&self, storage: &str, package: &str) -> StorageResult<u64> {
        let label = format!("{storage}/{package}");
        let pool = self.gate.writable().await?;
        let mut tx = pool.begin().await.context("tarball.begin", &label)?;
        let removed = unlink_package(&mut tx, storage, package, &label).await?;
        tx.commit().await.context("tarball.commit", &label)?;

        tracing::info!(removed, "Removed package tarballs");
        Ok(removed)
    }

    #[instrument(skip(self), fields(backend = "large-object"))]
    async fn remove_package(&self, storage: &str, package: &str) -> StorageResult<u64> {
        let label = format!("{storage}/{package}");
        let pool = self.gate.writable().await?;
        let mut tx = pool.begin().await.context("tarball.begin", &label)?;
        let removed = unlink_package(&mut tx, storage, package, &label).await?;
        delete_package_document(&mut tx, storage, package).await?;
        tx.commit().await.context("tarball.commit", &label)?;

        tracing::info!(removed, "Removed package");
        Ok(removed)
    }

    fn backend_name(&self) -> &'static str {
        "large-object"
    }
}

/// An upload in progress. Owns the transaction until finish or abort.
struct LargeObjectUpload {
    tx: Transaction<'static, Postgres>,
    key: TarballKey,
    label: String,
    mode: WriteMode,
    oid: Oid,
    fd: i32,
    bytes_written: u64,
    chunk_size: usize,
}

#[async_trait]
impl StreamingUpload for LargeObjectUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        for piece in data.chunks(self.chunk_size) {
            let written: i32 = sqlx::query_scalar("SELECT lowrite($1, $2)")
                .bind(self.fd)
                .bind(piece)
                .fetch_one(&mut *self.tx)
                .await
                .context("tarball.write", &self.label)?;
            if written as usize != piece.len() {
                return Err(StorageError::Stream(format!(
                    "short write to {}: {written} of {} bytes",
                    self.label,
                    piece.len()
                )));
            }
            self.bytes_written += piece.len() as u64;
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        let Self {
            mut tx,
            key,
            label,
            mode,
            oid,
            fd,
            bytes_written,
            ..
        } = *self;

        sqlx::query("SELECT lo_close($1)")
            .bind(fd)
            .execute(&mut *tx)
            .await
            .context("tarball.close", &label)?;

        // Serialize writers of this key so each sees the pointer the previous
        // one committed, even when the row did not exist yet.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&label)
            .execute(&mut *tx)
            .await
            .context("tarball.lock", &label)?;

        let previous = lookup_file(&mut tx, &key, true).await?;
        if mode == WriteMode::CreateNew && previous.is_some() {
            tx.rollback().await.context("tarball.rollback", &label)?;
            return Err(StorageError::AlreadyExists(label));
        }

        sqlx::query(
            r#"
            INSERT INTO tarball (storage, package, name, file)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (storage, package, name) DO UPDATE
            SET file = EXCLUDED.file, updated = NOW()
            "#,
        )
        .bind(&key.storage)
        .bind(&key.package)
        .bind(&key.name)
        .bind(oid)
        .execute(&mut *tx)
        .await
        .context("tarball.link", &label)?;

        if let Some(old) = previous {
            unlink(&mut tx, old, &label).await?;
        }

        tx.commit().await.context("tarball.commit", &label)?;
        tracing::info!(key = %label, bytes = bytes_written, replaced = previous.is_some(), "Tarball stored");
        Ok(bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        let Self { tx, label, .. } = *self;
        tracing::debug!(key = %label, "Upload aborted");
        tx.rollback().await.context("tarball.rollback", &label)?;
        Ok(())
    }
}
