//! Local package list repository.

use crate::error::MetadataResult;
use async_trait::async_trait;

/// Names of packages published to this registry.
#[async_trait]
pub trait LocalPackageRepo: Send + Sync {
    /// Add a name, refreshing `updated` if already listed.
    async fn add_local_package(&self, name: &str) -> MetadataResult<()>;

    /// Remove a name. Removing an unlisted name succeeds.
    async fn remove_local_package(&self, name: &str) -> MetadataResult<()>;

    /// Every listed name, sorted.
    async fn list_local_packages(&self) -> MetadataResult<Vec<String>>;

    /// Remove every name.
    async fn clean_local_packages(&self) -> MetadataResult<()>;
}
