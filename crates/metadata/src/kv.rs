//! Ordered key/value storage on a two-column table.
//!
//! [`KvTable`] gives an embedded-store style interface (point get, put,
//! delete, and bounded range scans in either direction) over
//! `(key TEXT COLLATE "C" PRIMARY KEY, value JSONB)`. Keys compare bytewise so
//! range scans follow plain lexicographic order.

use crate::error::{MetadataError, MetadataResult, QueryContext, is_unique_violation};
use crate::readiness::ReadinessGate;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use sqlx::types::Json;
use std::fmt::Write as _;
use std::marker::PhantomData;
use std::ops::Bound;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// PostgreSQL truncates identifiers longer than this.
const MAX_IDENTIFIER_LEN: usize = 63;

/// SQLSTATE for duplicate_table.
const DUPLICATE_TABLE: &str = "42P07";

/// Single-pass stream of `(key, value)` pairs.
pub type KvStream<T> = Pin<Box<dyn Stream<Item = MetadataResult<(String, T)>> + Send>>;

/// Scan direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScanOrder {
    #[default]
    Ascending,
    Descending,
}

/// Bounds, order and size limit of a range scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanOptions {
    pub lower: Bound<String>,
    pub upper: Bound<String>,
    pub order: ScanOrder,
    /// Maximum number of pairs to yield; `None` means unbounded.
    pub limit: Option<u64>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            order: ScanOrder::Ascending,
            limit: None,
        }
    }
}

impl ScanOptions {
    /// Every key starting with `prefix`.
    pub fn prefix(prefix: &str) -> Self {
        let upper = match successor(prefix) {
            Some(next) => Bound::Excluded(next),
            None => Bound::Unbounded,
        };
        Self {
            lower: Bound::Included(prefix.to_string()),
            upper,
            ..Self::default()
        }
    }

    pub fn reverse(mut self) -> Self {
        self.order = match self.order {
            ScanOrder::Ascending => ScanOrder::Descending,
            ScanOrder::Descending => ScanOrder::Ascending,
        };
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Smallest string greater than every string starting with `prefix`.
///
/// Returns `None` when no such string exists (empty prefix, or every
/// character is `char::MAX`).
pub fn successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        // Skip the surrogate gap; `char` cannot hold those code points.
        let next = match last {
            char::MAX => continue,
            '\u{D7FF}' => '\u{E000}',
            c => char::from_u32(c as u32 + 1)?,
        };
        chars.push(next);
        return Some(chars.into_iter().collect());
    }
    None
}

/// Build the scan statement for `table` and the values to bind, in order.
///
/// `table` must already be a quoted identifier.
pub fn scan_query(table: &str, options: &ScanOptions) -> (String, Vec<String>) {
    let mut sql = format!("SELECT key, value FROM {table}");
    let mut binds = Vec::new();
    let mut conditions = Vec::new();

    match &options.lower {
        Bound::Included(key) => {
            binds.push(key.clone());
            conditions.push(format!("key >= ${}", binds.len()));
        }
        Bound::Excluded(key) => {
            binds.push(key.clone());
            conditions.push(format!("key > ${}", binds.len()));
        }
        Bound::Unbounded => {}
    }
    match &options.upper {
        Bound::Included(key) => {
            binds.push(key.clone());
            conditions.push(format!("key <= ${}", binds.len()));
        }
        Bound::Excluded(key) => {
            binds.push(key.clone());
            conditions.push(format!("key < ${}", binds.len()));
        }
        Bound::Unbounded => {}
    }

    if !conditions.is_empty() {
        let _ = write!(sql, " WHERE {}", conditions.join(" AND "));
    }
    sql.push_str(match options.order {
        ScanOrder::Ascending => " ORDER BY key ASC",
        ScanOrder::Descending => " ORDER BY key DESC",
    });
    if let Some(limit) = options.limit {
        // LIMIT is a bigint; anything larger means no limit at all.
        let limit = limit.min(i64::MAX as u64);
        let _ = write!(sql, " LIMIT {limit}");
    }
    (sql, binds)
}

/// Validate a table name and return it double-quoted.
pub fn quote_table_name(name: &str) -> MetadataResult<String> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(MetadataError::InvalidKey(format!(
            "invalid key/value table name '{name}'"
        )));
    }
    Ok(format!("\"{name}\""))
}

fn is_concurrent_create(err: &sqlx::Error) -> bool {
    // Two sessions racing CREATE TABLE IF NOT EXISTS can collide on pg_type.
    match err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(DUPLICATE_TABLE) => true,
        other => is_unique_violation(other),
    }
}

/// Typed key/value table.
pub struct KvTable<T> {
    gate: ReadinessGate,
    name: Arc<str>,
    ident: Arc<str>,
    created: Arc<OnceCell<()>>,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for KvTable<T> {
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
            name: self.name.clone(),
            ident: self.ident.clone(),
            created: self.created.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for KvTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvTable").field("name", &self.name).finish()
    }
}

impl<T> KvTable<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static,
{
    /// Bind to `name`; the table is created on first use.
    pub fn new(gate: ReadinessGate, name: &str) -> MetadataResult<Self> {
        let ident = quote_table_name(name)?;
        Ok(Self {
            gate,
            name: Arc::from(name),
            ident: Arc::from(ident),
            created: Arc::new(OnceCell::new()),
            _value: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn pool(&self) -> MetadataResult<&PgPool> {
        let pool = self.gate.ready().await?;
        self.created
            .get_or_try_init(|| async {
                let sql = format!(
                    "CREATE TABLE IF NOT EXISTS {} (key TEXT COLLATE \"C\" PRIMARY KEY, value JSONB)",
                    self.ident
                );
                match sqlx::query(&sql).execute(pool).await {
                    Ok(_) => Ok(()),
                    Err(err) if is_concurrent_create(&err) => Ok(()),
                    Err(err) => Err(err).context("kv.create_table", &self.name),
                }
            })
            .await?;
        Ok(pool)
    }

    async fn writable_pool(&self) -> MetadataResult<&PgPool> {
        let pool = self.pool().await?;
        self.gate.writable().await?;
        Ok(pool)
    }

    /// Insert or overwrite the value stored under `key`.
    #[tracing::instrument(skip(self, value), fields(table = %self.name))]
    pub async fn put(&self, key: &str, value: &T) -> MetadataResult<()> {
        let pool = self.writable_pool().await?;
        let sql = format!(
            "INSERT INTO {} (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
            self.ident
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(Json(value))
            .execute(pool)
            .await
            .context("kv.put", key)?;
        Ok(())
    }

    /// Fetch the value stored under `key`.
    #[tracing::instrument(skip(self), fields(table = %self.name))]
    pub async fn get(&self, key: &str) -> MetadataResult<T> {
        let pool = self.pool().await?;
        let sql = format!("SELECT value FROM {} WHERE key = $1", self.ident);
        let row: Option<Json<T>> = sqlx::query_scalar(&sql)
            .bind(key)
            .fetch_optional(pool)
            .await
            .context("kv.get", key)?;
        row.map(|Json(value)| value)
            .ok_or_else(|| MetadataError::NotFound(format!("{}/{key}", self.name)))
    }

    /// Remove `key`. Removing an absent key succeeds.
    #[tracing::instrument(skip(self), fields(table = %self.name))]
    pub async fn delete(&self, key: &str) -> MetadataResult<()> {
        let pool = self.writable_pool().await?;
        let sql = format!("DELETE FROM {} WHERE key = $1", self.ident);
        sqlx::query(&sql)
            .bind(key)
            .execute(pool)
            .await
            .context("kv.delete", key)?;
        Ok(())
    }

    /// Stream the pairs inside the given bounds.
    ///
    /// Rows are fetched incrementally. A query failure ends the stream with
    /// an error item after any pairs already delivered.
    pub fn scan(&self, options: ScanOptions) -> KvStream<T> {
        let table = self.clone();
        let stream = async_stream::try_stream! {
            let pool = table.pool().await?;
            let (sql, binds) = scan_query(&table.ident, &options);
            tracing::debug!(table = %table.name, sql = %sql, "Scanning key range");

            let mut query = sqlx::query_as::<_, (String, Json<T>)>(&sql);
            for bind in &binds {
                query = query.bind(bind);
            }

            let mut rows = query.fetch(pool);
            while let Some(row) = rows.next().await {
                let (key, Json(value)) = row.context("kv.scan", &table.name)?;
                yield (key, value);
            }
        };
        Box::pin(stream)
    }
}
