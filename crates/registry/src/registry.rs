//! The storage engine as seen by a registry host.

use crate::error::{RegistryError, RegistryResult};
use crate::package::PackageStorage;
use crate::search::{self, RegistrySearchStream, SearchEvent};
use pgreg_core::{AppConfig, SECRET_NAME, SearchItem, Token, TokenFilter};
use pgreg_metadata::{EngineState, MetadataStore, MigrationStatus, PostgresStore};
use pgreg_storage::{LargeObjectStore, TarballStore};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Entry point for a registry host: packages, tarballs, tokens, the local
/// package list, the signing secret and search, on one database.
#[derive(Clone)]
pub struct Registry {
    config: Arc<AppConfig>,
    metadata: Arc<dyn MetadataStore>,
    tarballs: Arc<dyn TarballStore>,
}

impl Registry {
    /// Assemble a registry from already-built stores.
    ///
    /// Both stores must share one readiness gate.
    pub fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        tarballs: Arc<dyn TarballStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            metadata,
            tarballs,
        }
    }

    /// Build a registry from configuration without connecting.
    ///
    /// Environment indirection in the database settings is resolved here.
    /// Call [`Registry::startup`] before serving traffic.
    pub fn open(config: AppConfig) -> RegistryResult<Self> {
        config.validate().map_err(RegistryError::Config)?;
        let database = config.database.resolved();
        let store = PostgresStore::open(&database)?;
        let tarballs = LargeObjectStore::new(store.gate().clone());
        Ok(Self::new(config, Arc::new(store), Arc::new(tarballs)))
    }

    /// Run migrations and check that the core tables can be read.
    ///
    /// A corrupted migration ledger or an unreachable database is returned
    /// as an error, and so is losing the database during the read check. If
    /// the database answers but reading the local package list or the secret
    /// fails, the engine is degraded: reads keep working and every write is
    /// refused from then on.
    pub async fn startup(&self) -> RegistryResult<Vec<String>> {
        let applied = self.metadata.migrate().await?;
        if !applied.is_empty() {
            tracing::info!(migrations = ?applied, "Migrations applied");
        }

        let check = async {
            self.metadata.list_local_packages().await?;
            self.metadata.get_secret(SECRET_NAME).await?;
            Ok::<_, pgreg_metadata::MetadataError>(())
        };
        match check.await {
            Ok(()) => Ok(applied),
            Err(err) if err.is_unavailable() => Err(err.into()),
            Err(err) => {
                self.metadata
                    .gate()
                    .degrade(format!("startup read of core tables failed: {err}"));
                Ok(applied)
            }
        }
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        self.metadata.gate().state()
    }

    /// Check database connectivity through the readiness gate.
    pub async fn health_check(&self) -> RegistryResult<()> {
        Ok(self.metadata.health_check().await?)
    }

    /// Applied state of every defined migration.
    pub async fn migration_status(&self) -> RegistryResult<Vec<MigrationStatus>> {
        let gate = self.metadata.gate();
        Ok(gate.migrator().status(gate.pool_unchecked()).await?)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn tarballs(&self) -> &Arc<dyn TarballStore> {
        &self.tarballs
    }

    /// Storage handle for a package, in the namespace its access rule names.
    pub fn package_storage(&self, name: &str) -> RegistryResult<PackageStorage> {
        let handle = self.config.resolve_storage(name)?;
        tracing::trace!(package = %name, storage = %handle.storage, "Resolved package storage");
        Ok(PackageStorage::new(
            handle,
            self.metadata.clone(),
            self.tarballs.clone(),
        ))
    }

    // =========================================================================
    // Secret
    // =========================================================================

    /// The registry signing secret, or an empty string if none is set.
    pub async fn get_secret(&self) -> RegistryResult<String> {
        Ok(self.metadata.get_secret(SECRET_NAME).await?)
    }

    pub async fn set_secret(&self, secret: &str) -> RegistryResult<()> {
        Ok(self.metadata.set_secret(SECRET_NAME, secret).await?)
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    pub async fn save_token(&self, token: &Token) -> RegistryResult<()> {
        tracing::debug!(user = %token.user, key = %token.key, "Saving token");
        Ok(self.metadata.save_token(token).await?)
    }

    /// Delete a user's token. Deleting an absent token succeeds.
    pub async fn delete_token(&self, user: &str, key: &str) -> RegistryResult<()> {
        tracing::debug!(user = %user, key = %key, "Deleting token");
        Ok(self.metadata.delete_token(user, key).await?)
    }

    /// Every token of the filter's user, ordered by key.
    pub async fn read_tokens(&self, filter: &TokenFilter) -> RegistryResult<Vec<Token>> {
        Ok(self.metadata.read_tokens(filter).await?)
    }

    // =========================================================================
    // Local packages
    // =========================================================================

    pub async fn add_package(&self, name: &str) -> RegistryResult<()> {
        tracing::debug!(package = %name, "Adding local package");
        Ok(self.metadata.add_local_package(name).await?)
    }

    pub async fn remove_package(&self, name: &str) -> RegistryResult<()> {
        tracing::debug!(package = %name, "Removing local package");
        Ok(self.metadata.remove_local_package(name).await?)
    }

    /// Names of all local packages, sorted.
    pub async fn get_packages(&self) -> RegistryResult<Vec<String>> {
        Ok(self.metadata.list_local_packages().await?)
    }

    pub async fn clean_packages(&self) -> RegistryResult<()> {
        tracing::debug!("Cleaning local packages");
        Ok(self.metadata.clean_local_packages().await?)
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Stream every package in every storage namespace.
    pub fn search_stream(&self) -> RegistrySearchStream {
        search::search_stream(&self.metadata)
    }

    /// Hand every package to `on_item`, returning how many were delivered.
    ///
    /// Stops at the first error, from the database or from `on_item`.
    pub async fn search<F, Fut>(&self, on_item: F) -> RegistryResult<u64>
    where
        F: FnMut(SearchItem) -> Fut,
        Fut: Future<Output = RegistryResult<()>>,
    {
        search::drive(self.search_stream(), on_item).await
    }

    /// Run a search in the background and receive its events.
    pub fn search_events(&self, capacity: usize) -> mpsc::Receiver<SearchEvent> {
        search::spawn_events(self.search_stream(), capacity)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("storage", &self.config.storage)
            .field("tarballs", &self.tarballs.backend_name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
