//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult, QueryContext};
use crate::kv::{KvTable, ScanOptions};
use crate::migrations::Migrator;
use crate::models::PackageRow;
use crate::readiness::ReadinessGate;
use crate::repos::{LocalPackageRepo, PackageRepo, SearchStream, SecretRepo, TokenRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use futures::StreamExt;
use pgreg_core::config::{DatabaseConfig, PgSslMode};
use pgreg_core::token::{token_storage_key, user_key_prefix};
use pgreg_core::{SearchItem, Token, TokenFilter};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::types::Json;
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::instrument;

/// Key/value table holding tokens, keyed `"<user>:<key>"`.
pub const TOKEN_TABLE: &str = "token_store";

/// Build connection options from configuration.
///
/// `config` should already be resolved; see [`DatabaseConfig::resolved`].
pub fn connect_options(config: &DatabaseConfig) -> MetadataResult<PgConnectOptions> {
    config.validate().map_err(MetadataError::Config)?;

    let mut opts = match &config.url {
        Some(url) => PgConnectOptions::from_str(url)
            .map_err(|e| MetadataError::Config(format!("invalid database url: {e}")))?,
        None => {
            let mut opts = PgConnectOptions::new();
            if let Some(socket) = &config.socket {
                opts = opts.socket(socket);
            } else if let Some(host) = &config.host {
                opts = opts.host(host);
            }
            if let Some(port) = config.port {
                opts = opts.port(port);
            }
            if let Some(database) = &config.database {
                opts = opts.database(database);
            }
            if let Some(user) = &config.username {
                opts = opts.username(user);
            }
            if let Some(pass) = &config.password {
                opts = opts.password(pass);
            }
            opts
        }
    };

    if let Some(mode) = config.ssl_mode {
        let sqlx_mode = match mode {
            PgSslMode::Disable => SqlxPgSslMode::Disable,
            PgSslMode::Prefer => SqlxPgSslMode::Prefer,
            PgSslMode::Require => SqlxPgSslMode::Require,
        };
        opts = opts.ssl_mode(sqlx_mode);
    }

    if let Some(timeout_ms) = config.statement_timeout_ms {
        opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
    }

    Ok(opts)
}

/// PostgreSQL-based metadata store.
#[derive(Clone)]
pub struct PostgresStore {
    gate: ReadinessGate,
    tokens: KvTable<Token>,
}

impl PostgresStore {
    /// Create a store without connecting.
    ///
    /// The pool connects on first use, and the first operation runs
    /// migrations. Use [`PostgresStore::connect`] to fail fast instead.
    pub fn open(config: &DatabaseConfig) -> MetadataResult<Self> {
        Self::open_with(config, Migrator::default())
    }

    /// Like [`PostgresStore::open`] with a custom migration set.
    pub fn open_with(config: &DatabaseConfig, migrator: Migrator) -> MetadataResult<Self> {
        let opts = connect_options(config)?;

        // Log connection info without password
        tracing::info!(
            host = config.host.as_deref().unwrap_or("<url>"),
            database = config.database.as_deref().unwrap_or("<url>"),
            username = config.username.as_deref().unwrap_or("<none>"),
            ssl_mode = ?config.ssl_mode,
            max_connections = config.max_connections,
            statement_timeout_ms = ?config.statement_timeout_ms,
            "Configuring PostgreSQL pool"
        );

        let mut pool_opts = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout());
        if let Some(idle) = config.idle_timeout() {
            pool_opts = pool_opts.idle_timeout(idle);
        }
        let pool = pool_opts.connect_lazy_with(opts);

        Self::from_pool(pool, migrator)
    }

    /// Open the store and wait for migrations.
    ///
    /// Fails with `MigrationCorrupted` if the ledger does not match the
    /// defined migrations, or `Unavailable` if the database cannot be reached.
    pub async fn connect(config: &DatabaseConfig) -> MetadataResult<Self> {
        let store = Self::open(config)?;
        store.gate.startup().await?;
        Ok(store)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, migrator: Migrator) -> MetadataResult<Self> {
        let gate = ReadinessGate::new(pool, migrator);
        let tokens = KvTable::new(gate.clone(), TOKEN_TABLE)?;
        Ok(Self { gate, tokens })
    }

    /// Key/value table backing token storage.
    pub fn token_table(&self) -> &KvTable<Token> {
        &self.tokens
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<Vec<String>> {
        self.gate.startup().await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        let pool = self.gate.ready().await?;
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .context("health_check", "postgres")?;
        Ok(())
    }

    fn gate(&self) -> &ReadinessGate {
        &self.gate
    }
}

// =============================================================================
// PackageRepo
// =============================================================================

/// Delete a package document on `conn`, so callers can join it to a wider
/// transaction. Deleting an absent document succeeds.
pub async fn delete_package_document(
    conn: &mut PgConnection,
    storage: &str,
    name: &str,
) -> MetadataResult<()> {
    sqlx::query("DELETE FROM packages WHERE storage = $1 AND name = $2")
        .bind(storage)
        .bind(name)
        .execute(conn)
        .await
        .context("packages.delete", &format!("{storage}/{name}"))?;
    Ok(())
}

#[async_trait]
impl PackageRepo for PostgresStore {
    #[instrument(skip(self))]
    async fn read_package(&self, storage: &str, name: &str) -> MetadataResult<Value> {
        let pool = self.gate.ready().await?;
        let key = format!("{storage}/{name}");
        let json: Option<Json<Value>> =
            sqlx::query_scalar("SELECT json FROM packages WHERE storage = $1 AND name = $2")
                .bind(storage)
                .bind(name)
                .fetch_optional(pool)
                .await
                .context("packages.read", &key)?;
        json.map(|Json(value)| value)
            .ok_or(MetadataError::NotFound(key))
    }

    async fn get_package_row(
        &self,
        storage: &str,
        name: &str,
    ) -> MetadataResult<Option<PackageRow>> {
        let pool = self.gate.ready().await?;
        let row = sqlx::query_as::<_, PackageRow>(
            "SELECT storage, name, json, created, updated FROM packages WHERE storage = $1 AND name = $2",
        )
        .bind(storage)
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("packages.row", &format!("{storage}/{name}"))?;
        Ok(row)
    }

    #[instrument(skip(self, json))]
    async fn save_package(&self, storage: &str, name: &str, json: &Value) -> MetadataResult<()> {
        let pool = self.gate.writable().await?;
        // GREATEST keeps `updated` strictly increasing even within one clock tick.
        sqlx::query(
            r#"
            INSERT INTO packages (storage, name, json)
            VALUES ($1, $2, $3)
            ON CONFLICT (storage, name) DO UPDATE
            SET json = EXCLUDED.json,
                updated = GREATEST(NOW(), packages.updated + INTERVAL '1 microsecond')
            "#,
        )
        .bind(storage)
        .bind(name)
        .bind(Json(json))
        .execute(pool)
        .await
        .context("packages.save", &format!("{storage}/{name}"))?;
        Ok(())
    }

    async fn create_package(
        &self,
        storage: &str,
        name: &str,
        json: &Value,
    ) -> MetadataResult<()> {
        tracing::debug!(storage, name, "Creating package");
        self.save_package(storage, name, json).await
    }

    #[instrument(skip(self))]
    async fn delete_package(&self, storage: &str, name: &str) -> MetadataResult<()> {
        let pool = self.gate.writable().await?;
        let mut conn = pool
            .acquire()
            .await
            .context("packages.acquire", &format!("{storage}/{name}"))?;
        delete_package_document(&mut conn, storage, name).await
    }

    fn search_packages(&self) -> SearchStream {
        let gate = self.gate.clone();
        let stream = async_stream::try_stream! {
            let pool = gate.ready().await?;
            let mut rows = sqlx::query_as::<_, (String, OffsetDateTime)>(
                "SELECT COALESCE(json->>'name', name), updated FROM packages",
            )
            .fetch(pool);

            while let Some(row) = rows.next().await {
                let (name, time) = row.context("packages.search", "*")?;
                yield SearchItem {
                    path: name.clone(),
                    name,
                    time,
                };
            }
        };
        Box::pin(stream)
    }
}

// =============================================================================
// TokenRepo
// =============================================================================

#[async_trait]
impl TokenRepo for PostgresStore {
    #[instrument(skip(self, token), fields(user = %token.user, key = %token.key))]
    async fn save_token(&self, token: &Token) -> MetadataResult<()> {
        let key = token.storage_key()?;
        self.tokens.put(&key, token).await
    }

    #[instrument(skip(self))]
    async fn delete_token(&self, user: &str, key: &str) -> MetadataResult<()> {
        let key = token_storage_key(user, key)?;
        self.tokens.delete(&key).await
    }

    #[instrument(skip(self))]
    async fn read_tokens(&self, filter: &TokenFilter) -> MetadataResult<Vec<Token>> {
        let prefix = user_key_prefix(&filter.user)?;
        let mut stream = self.tokens.scan(ScanOptions::prefix(&prefix));

        let mut tokens = Vec::new();
        while let Some(item) = stream.next().await {
            let (_, token) = item?;
            tokens.push(token);
        }
        Ok(tokens)
    }
}

// =============================================================================
// LocalPackageRepo
// =============================================================================

#[async_trait]
impl LocalPackageRepo for PostgresStore {
    #[instrument(skip(self))]
    async fn add_local_package(&self, name: &str) -> MetadataResult<()> {
        let pool = self.gate.writable().await?;
        sqlx::query(
            r#"
            INSERT INTO local_packages (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET updated = NOW()
            "#,
        )
        .bind(name)
        .execute(pool)
        .await
        .context("local_packages.add", name)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_local_package(&self, name: &str) -> MetadataResult<()> {
        let pool = self.gate.writable().await?;
        sqlx::query("DELETE FROM local_packages WHERE name = $1")
            .bind(name)
            .execute(pool)
            .await
            .context("local_packages.remove", name)?;
        Ok(())
    }

    async fn list_local_packages(&self) -> MetadataResult<Vec<String>> {
        let pool = self.gate.ready().await?;
        let names = sqlx::query_scalar("SELECT name FROM local_packages ORDER BY name")
            .fetch_all(pool)
            .await
            .context("local_packages.list", "*")?;
        Ok(names)
    }

    async fn clean_local_packages(&self) -> MetadataResult<()> {
        let pool = self.gate.writable().await?;
        tracing::info!("Clearing local package list");
        sqlx::query("TRUNCATE local_packages")
            .execute(pool)
            .await
            .context("local_packages.clean", "*")?;
        Ok(())
    }
}

// =============================================================================
// SecretRepo
// =============================================================================

#[async_trait]
impl SecretRepo for PostgresStore {
    async fn get_secret(&self, name: &str) -> MetadataResult<String> {
        let pool = self.gate.ready().await?;
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM secrets WHERE name = $1")
                .bind(name)
                .fetch_optional(pool)
                .await
                .context("secrets.get", name)?;
        Ok(value.flatten().unwrap_or_default())
    }

    #[instrument(skip(self, value))]
    async fn set_secret(&self, name: &str, value: &str) -> MetadataResult<()> {
        let pool = self.gate.writable().await?;
        sqlx::query(
            r#"
            INSERT INTO secrets (name, value) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value, updated = NOW()
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(pool)
        .await
        .context("secrets.set", name)?;
        Ok(())
    }
}
