//! Common test utilities for large object storage tests.

use pgreg_core::DatabaseConfig;
use pgreg_metadata::{MetadataError, MetadataResult, MetadataStore, PostgresStore};
use pgreg_storage::LargeObjectStore;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures in Postgres test setup.
/// Tests use this marker to decide whether to skip due to unavailable Docker.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// Small chunks so multi-chunk paths run without huge fixtures.
pub const TEST_CHUNK_SIZE: usize = 64 * 1024;

/// Metadata store plus tarball store on a throwaway database.
#[allow(dead_code)]
pub struct TestStorage {
    pub metadata: PostgresStore,
    pub tarballs: LargeObjectStore,
    _container: ContainerAsync<Postgres>,
}

#[allow(dead_code)]
impl TestStorage {
    pub async fn new() -> MetadataResult<Self> {
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
        let metadata = PostgresStore::open(&DatabaseConfig {
            max_connections: 8,
            ..DatabaseConfig::from_url(url)
        })?;
        metadata.migrate().await?;

        let tarballs =
            LargeObjectStore::new(metadata.gate().clone()).with_chunk_size(TEST_CHUNK_SIZE);

        Ok(Self {
            metadata,
            tarballs,
            _container: container,
        })
    }

    pub fn pool(&self) -> &PgPool {
        self.metadata.gate().pool_unchecked()
    }

    /// Number of large objects in the database.
    pub async fn large_object_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM pg_largeobject_metadata")
            .fetch_one(self.pool())
            .await
            .expect("Failed to count large objects")
    }

    /// Wait until the large object count settles at `expected`.
    ///
    /// Dropped transactions roll back when their connection returns to the
    /// pool, which happens in the background.
    pub async fn wait_for_large_object_count(&self, expected: i64) -> i64 {
        let mut count = self.large_object_count().await;
        for _ in 0..50 {
            if count == expected {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            count = self.large_object_count().await;
        }
        count
    }
}

/// Start a database, or return None if Docker is unavailable
/// or SKIP_POSTGRES_TESTS is set.
///
/// Only container-start failures (Docker unavailable) cause a skip.
#[allow(dead_code)]
pub async fn storage_or_skip() -> Option<TestStorage> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match TestStorage::new().await {
        Ok(storage) => Some(storage),
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

/// Deterministic test payload of `len` bytes, varied by `seed`.
#[allow(dead_code)]
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i % 251) as u8).wrapping_add(seed))
        .collect()
}
