//! Registry-facing storage for pgreg.
//!
//! This crate is what a package registry host talks to:
//! - [`Registry`] resolves packages to storage namespaces and owns tokens,
//!   the local package list, the signing secret and search
//! - [`PackageStorage`] reads and writes one package's document and tarballs
//! - Configuration loading for the `pgreg` operator binary

pub mod config;
pub mod error;
pub mod package;
pub mod registry;
pub mod search;

pub use config::load_config;
pub use error::{RegistryError, RegistryResult};
pub use package::{PackageStorage, abort_update};
pub use registry::Registry;
pub use search::{RegistrySearchStream, SearchEvent};

pub use pgreg_core::{AppConfig, SearchItem, Token, TokenFilter};
pub use pgreg_metadata::EngineState;
pub use pgreg_storage::{TarballReader, WriteMode};
