//! Per-package storage handle.

use crate::error::{RegistryError, RegistryResult};
use bytes::Bytes;
use futures::Stream;
use pgreg_core::PackageHandle;
use pgreg_metadata::MetadataStore;
use pgreg_storage::{
    StorageError, StreamingUpload, TarballKey, TarballReader, TarballStore, WriteMode, copy_stream,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Documents and tarballs of one package, bound to its storage namespace.
#[derive(Clone)]
pub struct PackageStorage {
    handle: PackageHandle,
    metadata: Arc<dyn MetadataStore>,
    tarballs: Arc<dyn TarballStore>,
}

impl std::fmt::Debug for PackageStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageStorage")
            .field("storage", &self.handle.storage)
            .field("package", &self.handle.package)
            .finish_non_exhaustive()
    }
}

impl PackageStorage {
    pub(crate) fn new(
        handle: PackageHandle,
        metadata: Arc<dyn MetadataStore>,
        tarballs: Arc<dyn TarballStore>,
    ) -> Self {
        Self {
            handle,
            metadata,
            tarballs,
        }
    }

    /// Storage namespace the package lives in.
    pub fn storage(&self) -> &str {
        &self.handle.storage
    }

    /// Package name.
    pub fn package(&self) -> &str {
        &self.handle.package
    }

    fn tarball_key(&self, file_name: &str) -> TarballKey {
        TarballKey::new(&self.handle.storage, &self.handle.package, file_name)
    }

    // =========================================================================
    // Package document
    // =========================================================================

    /// Read the package document. Fails with not-found if absent.
    pub async fn read_package(&self) -> RegistryResult<Value> {
        tracing::debug!(storage = %self.storage(), package = %self.package(), "Reading package");
        Ok(self
            .metadata
            .read_package(self.storage(), self.package())
            .await?)
    }

    /// Write the package document, replacing any previous one.
    pub async fn save_package(&self, json: &Value) -> RegistryResult<()> {
        tracing::debug!(storage = %self.storage(), package = %self.package(), "Saving package");
        Ok(self
            .metadata
            .save_package(self.storage(), self.package(), json)
            .await?)
    }

    /// Create the package document. An existing document is overwritten.
    pub async fn create_package(&self, json: &Value) -> RegistryResult<()> {
        tracing::debug!(storage = %self.storage(), package = %self.package(), "Creating package");
        Ok(self
            .metadata
            .create_package(self.storage(), self.package(), json)
            .await?)
    }

    /// Delete the package document. Deleting an absent document succeeds.
    pub async fn delete_package(&self) -> RegistryResult<()> {
        tracing::debug!(storage = %self.storage(), package = %self.package(), "Deleting package");
        Ok(self
            .metadata
            .delete_package(self.storage(), self.package())
            .await?)
    }

    /// Read, modify and write back the package document.
    ///
    /// `update` edits the current document in place; an error from it aborts
    /// before anything is written. The edited document then goes through
    /// `transform`, and the result is handed to `on_write` together with the
    /// package name. `on_write` usually calls [`PackageStorage::save_package`].
    pub async fn update_package<U, T, W, Fut>(
        &self,
        update: U,
        transform: T,
        on_write: W,
    ) -> RegistryResult<()>
    where
        U: FnOnce(&mut Value) -> RegistryResult<()>,
        T: FnOnce(Value) -> Value,
        W: FnOnce(String, Value) -> Fut,
        Fut: Future<Output = RegistryResult<()>>,
    {
        tracing::debug!(storage = %self.storage(), package = %self.package(), "Updating package");
        let mut json = self.read_package().await?;
        if let Err(err) = update(&mut json) {
            tracing::debug!(
                package = %self.package(),
                error = %err,
                "Package update refused, nothing written"
            );
            return Err(err);
        }
        let transformed = transform(json);
        on_write(self.handle.package.clone(), transformed).await
    }

    // =========================================================================
    // Tarballs
    // =========================================================================

    /// Open a tarball for streaming. The size is known before any byte.
    pub async fn read_tarball(&self, file_name: &str) -> RegistryResult<TarballReader> {
        tracing::debug!(package = %self.package(), name = %file_name, "Reading tarball");
        Ok(self.tarballs.get_stream(&self.tarball_key(file_name)).await?)
    }

    /// Size of a stored tarball.
    pub async fn tarball_size(&self, file_name: &str) -> RegistryResult<u64> {
        Ok(self.tarballs.head(&self.tarball_key(file_name)).await?)
    }

    /// Start a tarball upload.
    ///
    /// Nothing is visible until the upload finishes; dropping it discards
    /// the bytes written so far.
    pub async fn write_tarball(
        &self,
        file_name: &str,
        mode: WriteMode,
    ) -> RegistryResult<Box<dyn StreamingUpload>> {
        tracing::debug!(package = %self.package(), name = %file_name, ?mode, "Writing tarball");
        Ok(self
            .tarballs
            .put_stream(&self.tarball_key(file_name), mode)
            .await?)
    }

    /// Upload a tarball from a byte stream, returning its size.
    ///
    /// An error item in `body` aborts the upload and leaves any previous
    /// tarball in place.
    pub async fn write_tarball_from<S>(
        &self,
        file_name: &str,
        mode: WriteMode,
        body: S,
    ) -> RegistryResult<u64>
    where
        S: Stream<Item = Result<Bytes, StorageError>> + Unpin + Send,
    {
        let upload = self.write_tarball(file_name, mode).await?;
        Ok(copy_stream(body, upload).await?)
    }

    /// Delete one tarball. Deleting an absent tarball succeeds.
    pub async fn delete_tarball(&self, file_name: &str) -> RegistryResult<()> {
        tracing::debug!(package = %self.package(), name = %file_name, "Deleting tarball");
        Ok(self.tarballs.delete(&self.tarball_key(file_name)).await?)
    }

    /// Delete every tarball of the package, returning how many went.
    pub async fn remove_tarballs(&self) -> RegistryResult<u64> {
        tracing::debug!(storage = %self.storage(), package = %self.package(), "Removing tarballs");
        Ok(self
            .tarballs
            .delete_package(self.storage(), self.package())
            .await?)
    }

    /// Remove the whole package, tarballs and document together. If any part
    /// fails nothing is removed.
    pub async fn remove_package(&self) -> RegistryResult<u64> {
        let removed = self
            .tarballs
            .remove_package(self.storage(), self.package())
            .await?;
        tracing::info!(
            storage = %self.storage(),
            package = %self.package(),
            tarballs = removed,
            "Package removed"
        );
        Ok(removed)
    }
}

/// Reject an update from inside an `update` callback.
pub fn abort_update(reason: impl Into<String>) -> RegistryError {
    RegistryError::Aborted(reason.into())
}
