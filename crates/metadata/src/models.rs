//! Database models mapping to the registry schema.

use sqlx::FromRow;
use sqlx::types::Json;
use time::OffsetDateTime;

/// Applied migration ledger entry.
#[derive(Debug, Clone, FromRow)]
pub struct MigrationRow {
    pub id: i32,
    pub name: String,
    pub applied_at: OffsetDateTime,
}

/// Package manifest document, keyed by (storage, name).
#[derive(Debug, Clone, FromRow)]
pub struct PackageRow {
    pub storage: String,
    pub name: String,
    pub json: Json<serde_json::Value>,
    pub created: OffsetDateTime,
    pub updated: OffsetDateTime,
}
