//! Ordered, transactional schema migrations.
//!
//! The ledger table `migrations` records applied names in apply order. A run
//! takes a transaction-scoped advisory lock, checks the ledger is a prefix of
//! the defined list, applies the rest and commits. Any failure rolls back
//! every statement and ledger row of that run.

mod steps;

pub use steps::MIGRATIONS;

use crate::error::{MetadataError, MetadataResult, QueryContext};
use crate::models::MigrationRow;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;

/// Advisory lock key serializing concurrent migration runs ("pgregmig").
const MIGRATION_LOCK_KEY: i64 = 0x7067_7265_676d_6967;

const CREATE_LEDGER: &str = r#"
    CREATE TABLE IF NOT EXISTS migrations (
        id         SERIAL PRIMARY KEY,
        name       TEXT NOT NULL UNIQUE,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

/// A named schema change.
#[derive(Debug)]
pub struct Migration {
    /// Unique name; names sort in apply order.
    pub name: &'static str,
    /// Statements executed in order inside the run's transaction.
    pub up: &'static [&'static str],
}

impl Migration {
    async fn up(&self, conn: &mut PgConnection) -> MetadataResult<()> {
        for statement in self.up {
            sqlx::query(*statement)
                .execute(&mut *conn)
                .await
                .context("migrations.up", self.name)?;
        }
        Ok(())
    }
}

/// Applied state of one defined migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub name: &'static str,
    pub applied_at: Option<OffsetDateTime>,
}

/// Applies a fixed list of migrations to a database.
#[derive(Debug, Clone, Copy)]
pub struct Migrator {
    migrations: &'static [Migration],
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new(MIGRATIONS)
    }
}

impl Migrator {
    pub fn new(migrations: &'static [Migration]) -> Self {
        Self { migrations }
    }

    /// Names of every defined migration.
    pub fn defined(&self) -> Vec<&'static str> {
        self.migrations.iter().map(|m| m.name).collect()
    }

    /// Apply pending migrations and return the names applied by this call.
    #[tracing::instrument(skip_all, fields(defined = self.migrations.len()))]
    pub async fn apply(&self, pool: &PgPool) -> MetadataResult<Vec<String>> {
        let mut tx = pool.begin().await.context("migrations.begin", "migrations")?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .context("migrations.lock", "migrations")?;

        sqlx::query(CREATE_LEDGER)
            .execute(&mut *tx)
            .await
            .context("migrations.init", "migrations")?;

        let applied: Vec<String> = sqlx::query_scalar("SELECT name FROM migrations ORDER BY id")
            .fetch_all(&mut *tx)
            .await
            .context("migrations.ledger", "migrations")?;

        let pending = verify_applied_prefix(&applied, self.migrations)?;
        if pending.is_empty() {
            tx.commit().await.context("migrations.commit", "migrations")?;
            tracing::debug!("Schema up to date");
            return Ok(Vec::new());
        }

        let mut names = Vec::with_capacity(pending.len());
        for migration in pending {
            tracing::info!(migration = migration.name, "Applying migration");
            migration.up(&mut *tx).await?;
            sqlx::query("INSERT INTO migrations (name) VALUES ($1)")
                .bind(migration.name)
                .execute(&mut *tx)
                .await
                .context("migrations.record", migration.name)?;
            names.push(migration.name.to_string());
        }

        tx.commit().await.context("migrations.commit", "migrations")?;
        tracing::info!(applied = ?names, "Migrations committed");
        Ok(names)
    }

    /// Report which defined migrations the database has applied.
    ///
    /// Does not create the ledger; a database never migrated reports every
    /// migration as pending.
    pub async fn status(&self, pool: &PgPool) -> MetadataResult<Vec<MigrationStatus>> {
        let exists: bool =
            sqlx::query_scalar("SELECT to_regclass('migrations') IS NOT NULL")
                .fetch_one(pool)
                .await
                .context("migrations.status", "migrations")?;

        let rows: Vec<MigrationRow> = if exists {
            sqlx::query_as("SELECT id, name, applied_at FROM migrations ORDER BY id")
                .fetch_all(pool)
                .await
                .context("migrations.status", "migrations")?
        } else {
            Vec::new()
        };

        let applied: Vec<String> = rows.iter().map(|row| row.name.clone()).collect();
        verify_applied_prefix(&applied, self.migrations)?;

        Ok(self
            .migrations
            .iter()
            .map(|migration| MigrationStatus {
                name: migration.name,
                applied_at: rows
                    .iter()
                    .find(|row| row.name == migration.name)
                    .map(|row| row.applied_at),
            })
            .collect())
    }
}

/// Check `applied` is an exact prefix of `defined` and return the remainder.
pub fn verify_applied_prefix<'a>(
    applied: &[String],
    defined: &'a [Migration],
) -> MetadataResult<&'a [Migration]> {
    let is_prefix = applied.len() <= defined.len()
        && applied
            .iter()
            .zip(defined)
            .all(|(name, migration)| name == migration.name);

    if !is_prefix {
        return Err(MetadataError::MigrationCorrupted {
            applied: applied.to_vec(),
            defined: defined.iter().map(|m| m.name.to_string()).collect(),
        });
    }
    Ok(&defined[applied.len()..])
}
