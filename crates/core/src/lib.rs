//! Core domain types and shared logic for the pgreg registry storage engine.
//!
//! This crate defines the data model shared by the storage crates:
//! - Configuration for the database connection and package access rules
//! - Registry tokens and token filters
//! - Package search results and storage namespace resolution

pub mod config;
pub mod error;
pub mod package;
pub mod token;

pub use config::{AppConfig, DatabaseConfig, PackageAccess, PgSslMode};
pub use error::{Error, Result};
pub use package::{PackageHandle, SearchItem};
pub use token::{Token, TokenFilter};

/// Name under which the registry signing secret is stored.
pub const SECRET_NAME: &str = "verdaccio";
