//! Redis-backed authority.
//!
//! Acquire is a plain `SET NX PX`; extend and release run as Lua scripts so
//! that the ownership check and the write happen atomically on the server.

use std::{future::Future, time::Duration};

use ::redis::{aio::MultiplexedConnection, Client, RedisError, RedisResult, Script};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::AuthorityError;

use super::Authority;

const EXTEND_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

pub struct RedisAuthority {
    endpoint: String,
    client: Client,
    timeout: Duration,
    connection: Mutex<Option<MultiplexedConnection>>,
    extend_script: Script,
    release_script: Script,
}

impl RedisAuthority {
    /// The connection is opened lazily on first use, bounded by `timeout`,
    /// and reopened after the server drops it.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, AuthorityError> {
        Ok(Self {
            endpoint: url.to_string(),
            client: Client::open(url)?,
            timeout,
            connection: Mutex::new(None),
            extend_script: Script::new(EXTEND_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, AuthorityError> {
        let mut cached = self.connection.lock().await;
        if let Some(connection) = cached.as_ref() {
            return Ok(connection.clone());
        }

        debug!("Connecting to redis authority {}", self.endpoint);
        let connection = match tokio::time::timeout(self.timeout, self.client.get_multiplexed_tokio_connection()).await {
            Ok(connection) => connection.map_err(|e| AuthorityError::Unavailable {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                return Err(AuthorityError::Timeout {
                    endpoint: self.endpoint.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        };
        *cached = Some(connection.clone());
        Ok(connection)
    }

    async fn disconnect(&self) {
        self.connection.lock().await.take();
    }

    /// Run `command` on the shared connection. A command that fails because
    /// the socket is gone drops the connection and is sent once more on a
    /// fresh one; all three primitives are safe to repeat.
    async fn run<T, F, Fut>(&self, command: F) -> Result<T, AuthorityError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let mut reconnected = false;
        loop {
            let connection = self.connection().await?;
            match command(connection).await {
                Err(e) if connection_lost(&e) => {
                    self.disconnect().await;
                    if reconnected {
                        return Err(e.into());
                    }
                    warn!("Redis authority {} lost its connection ({}), reconnecting", self.endpoint, e);
                    reconnected = true;
                }
                result => return result.map_err(AuthorityError::from),
            }
        }
    }
}

fn connection_lost(error: &RedisError) -> bool {
    error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal()
}

#[async_trait]
impl Authority for RedisAuthority {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, AuthorityError> {
        let ttl_ms = ttl.as_millis() as u64;
        let reply: Option<String> = self
            .run(|mut conn| async move {
                ::redis::cmd("SET")
                    .arg(key)
                    .arg(token)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some_and(|status| status.eq_ignore_ascii_case("OK")))
    }

    async fn try_extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, AuthorityError> {
        let ttl_ms = ttl.as_millis() as u64;
        let extended: i64 = self
            .run(|mut conn| async move {
                self.extend_script
                    .key(key)
                    .arg(token)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, AuthorityError> {
        let deleted: i64 = self
            .run(|mut conn| async move {
                self.release_script
                    .key(key)
                    .arg(token)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(deleted == 1)
    }
}
