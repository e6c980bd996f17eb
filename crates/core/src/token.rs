//! Registry tokens.

use serde::{Deserialize, Serialize};

/// Separator between user and token key in storage keys.
pub const TOKEN_KEY_SEPARATOR: char = ':';

/// A registry access token as handed over by the host.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Owning user.
    pub user: String,
    /// Masked token value.
    pub token: String,
    /// Token key, unique per user.
    pub key: String,
    /// Allowed client networks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<Vec<String>>,
    /// Whether the token only grants read access.
    pub readonly: bool,
    /// Creation time (ms).
    pub created: i64,
    /// Last update time (ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i64>,
}

impl Token {
    /// Key under which this token is stored: `"<user>:<key>"`.
    pub fn storage_key(&self) -> crate::Result<String> {
        token_storage_key(&self.user, &self.key)
    }
}

/// Build the storage key for a user's token.
pub fn token_storage_key(user: &str, key: &str) -> crate::Result<String> {
    Ok(format!("{}{key}", user_key_prefix(user)?))
}

/// Build the key prefix shared by all tokens of `user`.
///
/// Users containing the separator are rejected, otherwise one user's range
/// would overlap another's.
pub fn user_key_prefix(user: &str) -> crate::Result<String> {
    if user.is_empty() {
        return Err(crate::Error::InvalidToken("empty user".to_string()));
    }
    if user.contains(TOKEN_KEY_SEPARATOR) {
        return Err(crate::Error::InvalidToken(format!(
            "user may not contain '{TOKEN_KEY_SEPARATOR}': {user}"
        )));
    }
    Ok(format!("{user}{TOKEN_KEY_SEPARATOR}"))
}

/// Filter for reading tokens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFilter {
    /// Only tokens owned by this user.
    pub user: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_format() {
        let token = Token {
            user: "alice".to_string(),
            token: "abc...xyz".to_string(),
            key: "k1".to_string(),
            cidr: None,
            readonly: false,
            created: 1,
            updated: None,
        };
        assert_eq!(token.storage_key().unwrap(), "alice:k1");
    }

    #[test]
    fn test_user_with_separator_rejected() {
        assert!(user_key_prefix("a:b").is_err());
        assert!(user_key_prefix("").is_err());
        assert_eq!(user_key_prefix("bob").unwrap(), "bob:");
    }

    #[test]
    fn test_optional_fields_omitted_in_json() {
        let token = Token {
            user: "u".to_string(),
            token: "t".to_string(),
            key: "k".to_string(),
            cidr: None,
            readonly: true,
            created: 10,
            updated: None,
        };
        let json = serde_json::to_value(&token).unwrap();
        assert!(json.get("cidr").is_none());
        assert!(json.get("updated").is_none());

        let back: Token = serde_json::from_value(json).unwrap();
        assert_eq!(back, token);
    }
}
