//! Common test utilities for registry tests.

use pgreg_core::AppConfig;
use pgreg_metadata::{MetadataStore, PostgresStore};
use pgreg_registry::{Registry, RegistryError, RegistryResult};
use pgreg_storage::LargeObjectStore;
use sqlx::PgPool;
use std::sync::Arc;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures in Postgres test setup.
/// Tests use this marker to decide whether to skip due to unavailable Docker.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// A registry on a throwaway database.
#[allow(dead_code)]
pub struct TestRegistry {
    pub registry: Registry,
    _container: ContainerAsync<Postgres>,
}

#[allow(dead_code)]
impl TestRegistry {
    pub async fn new() -> RegistryResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                RegistryError::Config(format!(
                    "{} Failed to start PostgreSQL container: {e}",
                    POSTGRES_CONTAINER_START_ERR_PREFIX
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        // Default credentials from testcontainers-modules postgres
        let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);
        // Built from parts so a POSTGRES_URL in the environment cannot redirect tests.
        let config = AppConfig::for_testing(&url);
        let store = PostgresStore::open(&config.database)?;
        let tarballs = LargeObjectStore::new(store.gate().clone());
        let registry = Registry::new(config, Arc::new(store), Arc::new(tarballs));

        Ok(Self {
            registry,
            _container: container,
        })
    }

    pub fn pool(&self) -> &PgPool {
        self.registry.metadata().gate().pool_unchecked()
    }
}

/// Start a database, or return None if Docker is unavailable
/// or SKIP_POSTGRES_TESTS is set.
///
/// Only container-start failures (Docker unavailable) cause a skip.
#[allow(dead_code)]
pub async fn registry_or_skip() -> Option<TestRegistry> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match TestRegistry::new().await {
        Ok(registry) => Some(registry),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(POSTGRES_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}
