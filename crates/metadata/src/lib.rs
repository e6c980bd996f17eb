//! PostgreSQL metadata store for pgreg.
//!
//! This crate owns everything that lives in ordinary tables:
//! - Schema migrations and the readiness gate every query waits on
//! - Package manifest documents and registry-wide search
//! - An ordered key/value adapter, used for tokens
//! - The local package list and the registry secret

pub mod error;
pub mod kv;
pub mod migrations;
pub mod models;
pub mod postgres;
pub mod readiness;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use kv::{KvStream, KvTable, ScanOptions, ScanOrder};
pub use migrations::{MIGRATIONS, Migration, MigrationStatus, Migrator};
pub use postgres::{PostgresStore, delete_package_document};
pub use readiness::{EngineState, ReadinessGate};
pub use store::MetadataStore;

