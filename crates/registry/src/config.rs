//! Configuration loading.

use crate::error::{RegistryError, RegistryResult};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use pgreg_core::AppConfig;
use std::path::Path;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "PGREG_CONFIG";

/// Prefix of environment variables overriding configuration keys.
///
/// Nested keys are separated by `__`, e.g. `PGREG_DATABASE__HOST`.
pub const ENV_PREFIX: &str = "PGREG_";

/// Configuration sources: the TOML file at `path` when it exists, then
/// `PGREG_` environment variables on top.
pub fn figment(path: &Path) -> Figment {
    let mut figment = Figment::new();
    if path.exists() {
        tracing::info!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path.display());
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load and validate configuration.
pub fn load_config(path: &Path) -> RegistryResult<AppConfig> {
    let config: AppConfig = figment(path)
        .extract()
        .map_err(|e| RegistryError::Config(e.to_string()))?;
    config.validate().map_err(RegistryError::Config)?;
    Ok(config)
}
