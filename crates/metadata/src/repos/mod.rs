//! Repository traits for the registry tables.

pub mod local_packages;
pub mod packages;
pub mod secrets;
pub mod tokens;

pub use local_packages::LocalPackageRepo;
pub use packages::{PackageRepo, SearchStream};
pub use secrets::SecretRepo;
pub use tokens::TokenRepo;
