//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that overrides the configured connection URL.
pub const POSTGRES_URL_ENV: &str = "POSTGRES_URL";

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// PostgreSQL connection configuration.
///
/// String fields may hold the name of an environment variable instead of a
/// literal value; see [`DatabaseConfig::resolved`].
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL (optional if using individual fields).
    /// Takes precedence over individual fields if both are provided.
    pub url: Option<String>,
    /// Database host (e.g., "localhost" or "db.example.com").
    pub host: Option<String>,
    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: Option<u16>,
    /// Unix socket directory, used instead of `host` when set.
    pub socket: Option<PathBuf>,
    /// Database name.
    pub database: Option<String>,
    /// Database username.
    pub username: Option<String>,
    /// Database password.
    /// WARNING: Prefer PGREG_DATABASE__PASSWORD env var over storing in config.
    pub password: Option<String>,
    /// SSL mode for connections.
    pub ssl_mode: Option<PgSslMode>,
    /// Maximum connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Close pooled connections idle for longer than this.
    pub idle_timeout_secs: Option<u64>,
    /// Give up acquiring a connection after this many seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Statement timeout in milliseconds.
    /// PostgreSQL will cancel queries that exceed this duration.
    pub statement_timeout_ms: Option<u64>,
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: default_pg_port(),
            socket: None,
            database: None,
            username: None,
            password: None,
            ssl_mode: None,
            max_connections: default_max_connections(),
            idle_timeout_secs: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            statement_timeout_ms: None,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("socket", &self.socket)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("statement_timeout_ms", &self.statement_timeout_ms)
            .finish()
    }
}

impl DatabaseConfig {
    /// Create a configuration from a connection URL, with defaults elsewhere.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Validate connection configuration invariants.
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("database max_connections must be greater than zero".to_string());
        }
        let has_target = self.host.is_some() || self.socket.is_some();
        match (self.url.as_ref(), has_target, self.database.as_ref()) {
            (Some(_), _, _) => Ok(()),
            (None, true, Some(_)) => Ok(()),
            (None, false, _) => Err(
                "database config requires either 'url' or 'host'/'socket' + 'database'"
                    .to_string(),
            ),
            (None, true, None) => Err(
                "database config requires 'database' when using individual fields".to_string(),
            ),
        }
    }

    /// Resolve environment indirection against the process environment.
    ///
    /// `POSTGRES_URL` overrides `url`, and any string field naming a set
    /// environment variable is replaced by that variable's value.
    pub fn resolved(&self) -> Self {
        self.resolved_with(|name| std::env::var(name).ok())
    }

    /// Resolve environment indirection with a caller-supplied lookup.
    pub fn resolved_with<F>(&self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolve = |value: &Option<String>| {
            value
                .as_deref()
                .map(|v| resolve_env_value(v, &lookup))
        };

        Self {
            url: lookup(POSTGRES_URL_ENV).or_else(|| resolve(&self.url)),
            host: resolve(&self.host),
            database: resolve(&self.database),
            username: resolve(&self.username),
            password: resolve(&self.password),
            ..self.clone()
        }
    }

    /// Idle timeout as a Duration.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Connection acquire timeout as a Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Return the value of the environment variable named by `value`, or `value`
/// itself when no such variable is set.
pub fn resolve_env_value<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(value).unwrap_or_else(|| value.to_string())
}

/// Package access rule used to pick a storage namespace.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageAccess {
    /// Glob pattern matched against the package name (e.g., "@scope/*", "**").
    pub pattern: String,
    /// Storage namespace for matching packages.
    pub storage: Option<String>,
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database connection configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Default storage namespace for packages whose rule names none.
    pub storage: Option<String>,
    /// Ordered package access rules; the first match wins.
    #[serde(default)]
    pub packages: Vec<PackageAccess>,
}

impl AppConfig {
    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.database.validate()?;
        for access in &self.packages {
            glob::Pattern::new(&access.pattern)
                .map_err(|e| format!("invalid package pattern '{}': {e}", access.pattern))?;
        }
        Ok(())
    }

    /// Create a test configuration pointing at the given URL.
    ///
    /// **For testing only.** Every package maps to the "default" storage.
    pub fn for_testing(url: &str) -> Self {
        Self {
            database: DatabaseConfig::from_url(url),
            storage: Some("default".to_string()),
            packages: vec![PackageAccess {
                pattern: "**".to_string(),
                storage: None,
            }],
        }
    }
}
