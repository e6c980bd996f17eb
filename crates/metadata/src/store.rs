//! Combined metadata store trait.

use crate::error::MetadataResult;
use crate::readiness::ReadinessGate;
use crate::repos::{LocalPackageRepo, PackageRepo, SecretRepo, TokenRepo};
use async_trait::async_trait;

/// Every repository the registry needs, behind one readiness gate.
#[async_trait]
pub trait MetadataStore:
    PackageRepo + TokenRepo + LocalPackageRepo + SecretRepo + Send + Sync
{
    /// Run pending migrations, returning the names applied by this call.
    async fn migrate(&self) -> MetadataResult<Vec<String>>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Readiness gate shared with other components using this database.
    fn gate(&self) -> &ReadinessGate;
}
