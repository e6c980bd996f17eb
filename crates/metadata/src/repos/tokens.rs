//! Token repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use pgreg_core::{Token, TokenFilter};

/// Repository for user tokens.
#[async_trait]
pub trait TokenRepo: Send + Sync {
    /// Store a token, replacing any token with the same user and key.
    async fn save_token(&self, token: &Token) -> MetadataResult<()>;

    /// Delete a user's token. Deleting an absent token succeeds.
    async fn delete_token(&self, user: &str, key: &str) -> MetadataResult<()>;

    /// Every token matching the filter, ordered by key.
    async fn read_tokens(&self, filter: &TokenFilter) -> MetadataResult<Vec<Token>>;
}
