//! Readiness gate shared by every component that talks to the database.
//!
//! Migrations run at most once per gate. Every operation awaits the same
//! outcome before issuing queries, so nothing observes an unmigrated schema.
//! A failed migration is remembered: every later call reports the service as
//! unavailable instead of retrying.

use crate::error::{MetadataError, MetadataResult};
use crate::migrations::Migrator;
use sqlx::PgPool;
use std::sync::{Arc, RwLock};
use tokio::sync::OnceCell;

/// Health of the storage engine as a whole.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// Reads and writes are allowed.
    Ready,
    /// Startup could not read core tables; writes are refused so a
    /// reconstructed empty default never overwrites real data.
    Degraded(String),
}

type ReadyOutcome = Result<Vec<String>, Arc<MetadataError>>;

struct GateInner {
    pool: PgPool,
    migrator: Migrator,
    outcome: OnceCell<ReadyOutcome>,
    state: RwLock<EngineState>,
}

/// Cloneable handle to the pool, guarded by migration readiness.
#[derive(Clone)]
pub struct ReadinessGate {
    inner: Arc<GateInner>,
}

impl ReadinessGate {
    /// Create a gate over `pool`; `migrator` runs on the first wait.
    pub fn new(pool: PgPool, migrator: Migrator) -> Self {
        Self {
            inner: Arc::new(GateInner {
                pool,
                migrator,
                outcome: OnceCell::new(),
                state: RwLock::new(EngineState::Ready),
            }),
        }
    }

    async fn outcome(&self) -> &ReadyOutcome {
        self.inner
            .outcome
            .get_or_init(|| async {
                match self.inner.migrator.apply(&self.inner.pool).await {
                    Ok(applied) => {
                        tracing::info!(applied = applied.len(), "Database ready");
                        Ok(applied)
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Database migration failed, refusing traffic");
                        Err(Arc::new(err))
                    }
                }
            })
            .await
    }

    /// Wait for migrations and return the pool.
    ///
    /// Fails with [`MetadataError::Unavailable`] if migrations failed.
    pub async fn ready(&self) -> MetadataResult<&PgPool> {
        match self.outcome().await {
            Ok(_) => Ok(&self.inner.pool),
            Err(err) => Err(MetadataError::Unavailable(err.to_string())),
        }
    }

    /// Wait for migrations and return the pool if the engine accepts writes.
    pub async fn writable(&self) -> MetadataResult<&PgPool> {
        let pool = self.ready().await?;
        match self.state() {
            EngineState::Ready => Ok(pool),
            EngineState::Degraded(reason) => Err(MetadataError::Locked(reason)),
        }
    }

    /// Wait for migrations and report the names applied by this gate's run.
    ///
    /// Unlike [`ReadinessGate::ready`], a schema-integrity failure is
    /// returned as-is so startup can report it.
    pub async fn startup(&self) -> MetadataResult<Vec<String>> {
        match self.outcome().await {
            Ok(applied) => Ok(applied.clone()),
            Err(err) => Err(match err.as_ref() {
                MetadataError::MigrationCorrupted { applied, defined } => {
                    MetadataError::MigrationCorrupted {
                        applied: applied.clone(),
                        defined: defined.clone(),
                    }
                }
                other => MetadataError::Unavailable(other.to_string()),
            }),
        }
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        self.inner
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Move the engine into the degraded state. Irreversible for this gate.
    pub fn degrade(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(reason = %reason, "Storage engine degraded, refusing writes");
        let mut state = self
            .inner
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == EngineState::Ready {
            *state = EngineState::Degraded(reason);
        }
    }

    /// The pool without waiting for readiness. Only for migration tooling.
    pub fn pool_unchecked(&self) -> &PgPool {
        &self.inner.pool
    }

    /// The migrator this gate runs.
    pub fn migrator(&self) -> &Migrator {
        &self.inner.migrator
    }
}
