//! Common test utilities for PostgreSQL-backed tests.

use pgreg_core::DatabaseConfig;
use pgreg_metadata::{MetadataError, MetadataResult, MetadataStore, Migrator, PostgresStore};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures in Postgres test setup.
/// Tests use this marker to decide whether to skip due to unavailable Docker.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// A throwaway PostgreSQL database running in a testcontainer.
#[allow(dead_code)]
pub struct PostgresTestDb {
    pub url: String,
    pub store: PostgresStore,
    _container: ContainerAsync<Postgres>,
}

#[allow(dead_code)]
impl PostgresTestDb {
    /// Start a container; the store migrates with the registry history on first use.
    pub async fn new() -> MetadataResult<Self> {
        Self::with_migrator(Migrator::default()).await
    }

    /// Start a container whose store runs `migrator`.
    pub async fn with_migrator(migrator: Migrator) -> MetadataResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                MetadataError::Internal(format!(
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
        let store = PostgresStore::open_with(&Self::config(&url), migrator)?;

        Ok(Self {
            url,
            store,
            _container: container,
        })
    }

    fn config(url: &str) -> DatabaseConfig {
        DatabaseConfig {
            max_connections: 5,
            ..DatabaseConfig::from_url(url)
        }
    }

    /// A second, independent store (own pool and gate) on the same database.
    pub fn reopen(&self, migrator: Migrator) -> PostgresStore {
        PostgresStore::open_with(&Self::config(&self.url), migrator).expect("Failed to open store")
    }

    /// Raw pool, bypassing readiness. For assertions only.
    pub fn pool(&self) -> &PgPool {
        self.store.gate().pool_unchecked()
    }
}

/// Start a database, or return None if Docker is unavailable
/// or SKIP_POSTGRES_TESTS is set.
///
/// Only container-start failures (Docker unavailable) cause a skip.
/// Schema, migration, or connection errors still panic so real regressions
/// are not silently swallowed.
#[allow(dead_code)]
pub async fn postgres_or_skip() -> Option<PostgresTestDb> {
    postgres_with_migrator_or_skip(Migrator::default()).await
}

/// Like [`postgres_or_skip`] with a custom migration set.
#[allow(dead_code)]
pub async fn postgres_with_migrator_or_skip(migrator: Migrator) -> Option<PostgresTestDb> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match PostgresTestDb::with_migrator(migrator).await {
        Ok(db) => Some(db),
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

/// Names of tables in the public schema, sorted.
#[allow(dead_code)]
pub async fn table_names(pool: &PgPool) -> Vec<String> {
    sqlx::query_scalar(
        "SELECT tablename::text FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename",
    )
    .fetch_all(pool)
    .await
    .expect("Failed to list tables")
}
