//! Package document repository.

use crate::error::MetadataResult;
use crate::models::PackageRow;
use async_trait::async_trait;
use futures::Stream;
use pgreg_core::SearchItem;
use serde_json::Value;
use std::pin::Pin;

/// Single-pass stream over every package document, across all storages.
pub type SearchStream = Pin<Box<dyn Stream<Item = MetadataResult<SearchItem>> + Send>>;

/// Repository for package manifests keyed by (storage, name).
#[async_trait]
pub trait PackageRepo: Send + Sync {
    /// Read a package document. Fails with `NotFound` if absent.
    async fn read_package(&self, storage: &str, name: &str) -> MetadataResult<Value>;

    /// Fetch the full row, including timestamps.
    async fn get_package_row(&self, storage: &str, name: &str)
    -> MetadataResult<Option<PackageRow>>;

    /// Insert or replace a package document, refreshing `updated`.
    async fn save_package(&self, storage: &str, name: &str, json: &Value) -> MetadataResult<()>;

    /// Create a package document.
    ///
    /// Does not reject an existing document; behaves like
    /// [`PackageRepo::save_package`].
    async fn create_package(&self, storage: &str, name: &str, json: &Value)
    -> MetadataResult<()>;

    /// Delete a package document. Deleting an absent package succeeds.
    async fn delete_package(&self, storage: &str, name: &str) -> MetadataResult<()>;

    /// Stream every package as a search item.
    fn search_packages(&self) -> SearchStream;
}
