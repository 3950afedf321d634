use serde::{Deserialize, Serialize};

use crate::error::ApiError;

pub const MAX_KEY_LEN: usize = 512;
pub const MAX_TOKEN_LEN: usize = 128;
pub const MAX_TTL_MS: u64 = 86_400_000;

#[derive(Debug, Serialize, Deserialize)]
pub struct AcquireKeyRequest {
    pub token: String,
    pub ttl_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExtendKeyRequest {
    pub token: String,
    pub ttl_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseKeyRequest {
    pub token: String,
}

/// Outcome of one primitive on an authority node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantResponse {
    pub granted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Free,
    Held,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyStatusResponse {
    pub key: String,
    pub status: KeyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_remaining_ms: Option<u64>,
}

pub fn validate_key(key: &str) -> Result<(), ApiError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(ApiError::InvalidKey {
            reason: format!("key must be 1-{} bytes", MAX_KEY_LEN),
        });
    }
    if key.chars().any(char::is_control) {
        return Err(ApiError::InvalidKey {
            reason: "key must not contain control characters".to_string(),
        });
    }
    Ok(())
}

pub fn validate_token(token: &str) -> Result<(), ApiError> {
    if token.is_empty() || token.len() > MAX_TOKEN_LEN {
        return Err(ApiError::InvalidToken {
            reason: format!("token must be 1-{} bytes", MAX_TOKEN_LEN),
        });
    }
    Ok(())
}

pub fn validate_ttl_ms(ttl_ms: u64) -> Result<(), ApiError> {
    if !(1..=MAX_TTL_MS).contains(&ttl_ms) {
        return Err(ApiError::InvalidTtl {
            reason: format!("ttl_ms must be between 1 and {}", MAX_TTL_MS),
        });
    }
    Ok(())
}
