//! Redis cache backend.
//!
//! Every key is a hash with `rev` and, unless it is a tombstone, `doc` fields. Conditional writes run as a Lua script
//! so that the revision check and the update are atomic on the server.
//!
//! The instance may not exist when the backend is created, therefore the connection is established lazily and
//! dropped on failure; [`ConnectionManager`] takes care of reconnecting while the instance is up.
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use redis::Script;

use crate::error::Result;
use crate::traits::CacheBackend;
use crate::types::Revision;
use crate::types::StoredEntry;
use crate::types::WriteMode;

const STORE_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'rev')
if ARGV[3] == 'versioned' and current and tonumber(current) >= tonumber(ARGV[1]) then
    return 0
end
redis.call('DEL', KEYS[1])
if ARGV[4] == '1' then
    redis.call('HSET', KEYS[1], 'rev', ARGV[1], 'doc', ARGV[2])
else
    redis.call('HSET', KEYS[1], 'rev', ARGV[1])
end
return 1
"#;

pub struct RedisBackend {
    client:     Client,
    name:       String,
    store:      Script,
    connection: tokio::sync::Mutex<Option<ConnectionManager>>,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("name", &self.name)
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisBackend {
    /// `url` is a `redis://host:port` URL; `name` is used for logging, normally the instance name.
    pub fn new(url: &str, name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client:     Client::open(url)?,
            name:       name.into(),
            store:      Script::new(STORE_SCRIPT),
            connection: tokio::sync::Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone()).await?;
        log::debug!("[{}] connected", self.name);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn forget_connection(&self) {
        self.connection.lock().await.take();
    }

    // Drop the connection on any failure so that the next call starts over with a fresh one.
    async fn checked<T>(&self, result: redis::RedisResult<T>) -> Result<T> {
        if result.is_err() {
            self.forget_connection().await;
        }
        Ok(result?)
    }

    async fn put(&self, key: &str, entry: StoredEntry, mode: WriteMode) -> Result<bool> {
        let mut conn = self.connection().await?;
        let mode = match mode {
            WriteMode::Versioned => "versioned",
            WriteMode::LastArrival => "last-arrival",
        };
        let has_doc = if entry.payload.is_some() { "1" } else { "0" };
        let applied: redis::RedisResult<i64> = self
            .store
            .key(key)
            .arg(entry.revision)
            .arg(entry.payload.unwrap_or_default())
            .arg(mode)
            .arg(has_doc)
            .invoke_async(&mut conn)
            .await;
        Ok(self.checked(applied).await? == 1)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        self.checked(pong).await?;
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<StoredEntry>> {
        let mut conn = self.connection().await?;
        let fields: redis::RedisResult<(Option<Revision>, Option<String>)> = redis::cmd("HMGET")
            .arg(key)
            .arg("rev")
            .arg("doc")
            .query_async(&mut conn)
            .await;
        let (revision, payload) = self.checked(fields).await?;
        Ok(revision.map(|revision| StoredEntry { revision, payload }))
    }

    async fn store(&self, key: &str, entry: StoredEntry, mode: WriteMode) -> Result<bool> {
        self.put(key, entry, mode).await
    }

    async fn remove(&self, key: &str, revision: Revision, mode: WriteMode) -> Result<bool> {
        match mode {
            WriteMode::Versioned => self.put(key, StoredEntry::tombstone(revision), mode).await,
            WriteMode::LastArrival => {
                let mut conn = self.connection().await?;
                let removed: redis::RedisResult<i64> = redis::cmd("DEL").arg(key).query_async(&mut conn).await;
                self.checked(removed).await?;
                Ok(true)
            }
        }
    }
}
