//! Lock authorities: independent stores that can atomically set a key if it
//! is absent, extend it if owned and delete it if owned.
//!
//! The coordinator only sees the [`Authority`] trait. Concrete variants:
//! - [`KeyStore`](crate::store::KeyStore): in-process store, also used as the
//!   test fake and as the backend of an authority node.
//! - [`HttpAuthority`]: client for an `octostore-quorum node`.
//! - `RedisAuthority`: client for a Redis server (feature `redis`).

pub mod http;
#[cfg(feature = "redis")]
pub mod redis;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use url::Url;

use crate::{error::AuthorityError, store::KeyStore};

pub use self::http::HttpAuthority;
#[cfg(feature = "redis")]
pub use self::redis::RedisAuthority;

/// The three atomic node-local primitives the quorum protocol relies on.
///
/// Each call must be atomic on the authority. `Ok(false)` means the
/// authority answered and refused; `Err` means it could not be reached or
/// misbehaved. Both count as a denied vote.
#[async_trait]
pub trait Authority: Send + Sync {
    /// Stable identity of this authority, unique within a coordinator.
    fn endpoint(&self) -> &str;

    /// Set `key` to `token` with expiry `ttl` only if `key` is absent.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, AuthorityError>;

    /// Reset the expiry of `key` to `ttl` only if its value equals `token`.
    async fn try_extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, AuthorityError>;

    /// Delete `key` only if its value equals `token`.
    async fn release(&self, key: &str, token: &str) -> Result<bool, AuthorityError>;
}

/// Build an authority client from an endpoint URL.
///
/// `http(s)://` endpoints talk to an authority node, `redis(s)://` to a Redis
/// server and `memory://name` creates a private in-process store.
pub fn connect(endpoint: &str, command_timeout: Duration) -> Result<Arc<dyn Authority>, AuthorityError> {
    let url = Url::parse(endpoint)?;
    match url.scheme() {
        "http" | "https" => Ok(Arc::new(HttpAuthority::new(endpoint, command_timeout)?)),
        #[cfg(feature = "redis")]
        "redis" | "rediss" => Ok(Arc::new(RedisAuthority::new(endpoint, command_timeout)?)),
        "memory" => Ok(Arc::new(KeyStore::in_memory(endpoint))),
        _ => Err(AuthorityError::UnsupportedScheme {
            endpoint: endpoint.to_string(),
        }),
    }
}
