//! Secret repository.

use crate::error::MetadataResult;
use async_trait::async_trait;

/// Named secret values.
#[async_trait]
pub trait SecretRepo: Send + Sync {
    /// Value stored under `name`, or an empty string when unset.
    async fn get_secret(&self, name: &str) -> MetadataResult<String>;

    /// Insert or replace the value stored under `name`.
    async fn set_secret(&self, name: &str, value: &str) -> MetadataResult<()>;
}
