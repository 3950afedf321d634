use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the quorum coordinator and by authority construction.
///
/// The first four variants are configuration errors: they are returned
/// before any network activity and are never retried.
#[derive(Error, Debug)]
pub enum Error {
    #[error("No authorities configured")]
    NoAuthorities,

    #[error("Invalid TTL: {reason}")]
    InvalidTtl { reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Authority already configured: {endpoint}")]
    DuplicateAuthority { endpoint: String },

    #[error("Failed to acquire lock {resource} after {attempts} attempts")]
    AcquisitionFailed { resource: String, attempts: u32 },

    #[error("Failed to renew lock {resource} after {attempts} attempts; the lock has been released")]
    RenewalFailed { resource: String, attempts: u32 },

    #[error("Authority error: {0}")]
    Authority(#[from] AuthorityError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single authority call. The coordinator counts any of these
/// as a denied vote for that authority.
#[derive(Error, Debug)]
pub enum AuthorityError {
    #[error("Authority {endpoint} unavailable: {reason}")]
    Unavailable { endpoint: String, reason: String },

    #[error("Authority {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    #[error("Authority rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Unsupported authority endpoint: {endpoint}")]
    UnsupportedScheme { endpoint: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Errors returned by the authority node's HTTP surface.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    #[error("Invalid token: {reason}")]
    InvalidToken { reason: String },

    #[error("Invalid TTL: {reason}")]
    InvalidTtl { reason: String },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::InvalidKey { .. } => (StatusCode::BAD_REQUEST, "Invalid key"),
            ApiError::InvalidToken { .. } => (StatusCode::BAD_REQUEST, "Invalid token"),
            ApiError::InvalidTtl { .. } => (StatusCode::BAD_REQUEST, "Invalid TTL"),
        };

        let body = Json(json!({
            "error": error_message,
            "details": self.to_string()
        }));

        (status, body).into_response()
    }
}
