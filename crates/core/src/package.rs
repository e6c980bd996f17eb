//! Package naming: search results and storage namespace resolution.

use crate::config::AppConfig;
use crate::error::{Error, Result};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// `*` does not cross the scope separator, so "*" never matches "@scope/pkg".
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// One package surfaced by a registry-wide search.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchItem {
    /// Package name.
    pub name: String,
    /// Package path (the name, for database-backed storage).
    pub path: String,
    /// Last time the package document was written.
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

impl SearchItem {
    /// Modification time in milliseconds since the Unix epoch.
    pub fn time_millis(&self) -> i64 {
        (self.time.unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// A package name bound to the storage namespace it lives in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PackageHandle {
    /// Storage namespace.
    pub storage: String,
    /// Package name.
    pub package: String,
}

impl AppConfig {
    /// Resolve the storage namespace for a package.
    ///
    /// Access rules are tried in order; the first matching rule's storage is
    /// used, falling back to the configured default storage.
    pub fn resolve_storage(&self, package: &str) -> Result<PackageHandle> {
        let mut matched = None;
        for access in &self.packages {
            let pattern = Pattern::new(&access.pattern).map_err(|e| Error::InvalidPattern {
                pattern: access.pattern.clone(),
                reason: e.to_string(),
            })?;
            if pattern.matches_with(package, MATCH_OPTIONS) {
                matched = Some(access);
                break;
            }
        }

        matched
            .and_then(|access| access.storage.clone())
            .or_else(|| self.storage.clone())
            .map(|storage| PackageHandle {
                storage,
                package: package.to_string(),
            })
            .ok_or_else(|| Error::NoStorageConfigured(package.to_string()))
    }
}
