use crate::{authority::Authority, error::{AuthorityError, Result}};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use rusqlite::{params, Connection};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{task::JoinHandle, time::{self, Instant}};
use tracing::{debug, info, warn};

pub type DbConn = Arc<Mutex<Connection>>;

/// Owner and deadline of one locked key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub token: String,
    pub expires_at: Instant,
}

impl KeyEntry {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn ttl_remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Single-node key store with per-key expiry.
///
/// Every primitive runs under the key's map shard lock, which makes the
/// compare-and-act atomic. Expired keys are treated as absent immediately and
/// swept by the background expiry task. When opened with a database path the
/// store also writes keys through to SQLite so they survive a restart; the
/// in-memory map stays the source of truth.
#[derive(Clone)]
pub struct KeyStore {
    endpoint: Arc<str>,
    keys: Arc<DashMap<String, KeyEntry>>,
    db: Option<DbConn>,
}

impl KeyStore {
    pub fn in_memory(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Arc::from(endpoint.into()),
            keys: Arc::new(DashMap::new()),
            db: None,
        }
    }

    pub fn open(endpoint: impl Into<String>, database_url: &str) -> Result<Self> {
        let conn = Connection::open(database_url)?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS keys (
                name TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        info!("Keys table initialized at {}", database_url);

        let store = Self {
            endpoint: Arc::from(endpoint.into()),
            keys: Arc::new(DashMap::new()),
            db: Some(Arc::new(Mutex::new(conn))),
        };

        store.load_keys_from_database()?;

        Ok(store)
    }

    fn load_keys_from_database(&self) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let db = db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Utc::now();

        let mut stmt = db.prepare("SELECT name, token, expires_at FROM keys")?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let token: String = row.get(1)?;
            let expires_at_str: String = row.get(2)?;
            let expires_at = DateTime::parse_from_rfc3339(&expires_at_str)
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
                })?
                .with_timezone(&Utc);
            Ok((name, token, expires_at))
        })?;

        let mut loaded_count = 0;
        let mut expired_names = Vec::new();

        for row in rows {
            let (name, token, expires_at) = row?;
            match (expires_at - now).to_std() {
                Ok(remaining) if !remaining.is_zero() => {
                    self.keys.insert(
                        name,
                        KeyEntry {
                            token,
                            expires_at: Instant::now() + remaining,
                        },
                    );
                    loaded_count += 1;
                }
                _ => expired_names.push(name),
            }
        }
        drop(stmt);

        for name in &expired_names {
            if let Err(e) = db.execute("DELETE FROM keys WHERE name = ?", params![name]) {
                warn!("Failed to delete expired key {} from database: {}", name, e);
            }
        }

        info!(
            "Loaded {} live keys from database, cleaned up {} expired keys",
            loaded_count,
            expired_names.len()
        );

        Ok(())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> bool {
        let entry = KeyEntry {
            token: token.to_string(),
            expires_at: Instant::now() + ttl,
        };

        match self.keys.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                self.persist(key, token, ttl);
                vacant.insert(entry);
                true
            }
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired() {
                    return false;
                }
                self.persist(key, token, ttl);
                occupied.insert(entry);
                true
            }
        }
    }

    pub fn try_extend(&self, key: &str, token: &str, ttl: Duration) -> bool {
        match self.keys.get_mut(key) {
            Some(mut entry) if entry.token == token && !entry.is_expired() => {
                entry.expires_at = Instant::now() + ttl;
                self.persist(key, token, ttl);
                true
            }
            _ => false,
        }
    }

    pub fn release(&self, key: &str, token: &str) -> bool {
        match self.keys.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().token == token => {
                let (_, removed) = occupied.remove_entry();
                self.forget(key);
                // An expired key was already gone as far as callers are concerned.
                !removed.is_expired()
            }
            _ => false,
        }
    }

    /// The live entry for `key`, if any.
    pub fn status(&self, key: &str) -> Option<KeyEntry> {
        self.keys
            .get(key)
            .map(|entry| entry.value().clone())
            .filter(|entry| !entry.is_expired())
    }

    pub fn len(&self) -> usize {
        self.keys.iter().filter(|entry| !entry.value().is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let expired: Vec<String> = self
            .keys
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            // Re-check under the shard lock; the key may have been re-acquired.
            if self.keys.remove_if(&key, |_, entry| entry.is_expired()).is_some() {
                debug!("Expired key: {}", key);
                self.forget(&key);
                removed += 1;
            }
        }
        removed
    }

    pub fn start_expiry_task(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(every);
            info!("Started key expiry background task ({:?} interval)", every);

            loop {
                interval.tick().await;
                let removed = self.purge_expired();
                if removed > 0 {
                    debug!("Swept {} expired keys", removed);
                }
            }
        })
    }

    fn persist(&self, key: &str, token: &str, ttl: Duration) {
        let Some(db) = &self.db else {
            return;
        };
        let expires_at = Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64);
        let db = db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = db.execute(
            "INSERT OR REPLACE INTO keys (name, token, expires_at) VALUES (?, ?, ?)",
            params![key, token, expires_at.to_rfc3339()],
        ) {
            warn!("Failed to save key {} to database: {}", key, e);
        }
    }

    fn forget(&self, key: &str) {
        let Some(db) = &self.db else {
            return;
        };
        let db = db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = db.execute("DELETE FROM keys WHERE name = ?", params![key]) {
            warn!("Failed to delete key {} from database: {}", key, e);
        }
    }
}

#[async_trait]
impl Authority for KeyStore {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> std::result::Result<bool, AuthorityError> {
        Ok(KeyStore::try_acquire(self, key, token, ttl))
    }

    async fn try_extend(&self, key: &str, token: &str, ttl: Duration) -> std::result::Result<bool, AuthorityError> {
        Ok(KeyStore::try_extend(self, key, token, ttl))
    }

    async fn release(&self, key: &str, token: &str) -> std::result::Result<bool, AuthorityError> {
        Ok(KeyStore::release(self, key, token))
    }
}
