use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, StorageError};

/// A durable FIFO of opaque byte records, keyed by a single well-known list
/// name. `pop` distinguishes "no more records" (`Ok(None)`) from a genuine
/// I/O failure (`Err`); `append` never silently drops a record — a
/// successful `append` implies durability on the store's own terms.
#[async_trait]
pub trait SpillStore: Send + Sync {
    async fn append(&self, record: Vec<u8>) -> Result<(), StorageError>;
    async fn pop(&self) -> Result<Option<Vec<u8>>, StorageError>;
    async fn close(&self) -> Result<(), StorageError>;
}

/// Redis-backed `SpillStore`, using `LPUSH`/`RPOP` against a configured key.
/// Ordering is best-effort FIFO only; the bridge does not depend on strict
/// ordering for correctness (see worker replay semantics).
pub struct RedisSpillStore {
    conn: Mutex<Option<ConnectionManager>>,
    key: String,
}

impl RedisSpillStore {
    /// Parses `redis://host/?key=<list-name>` and pings the server once to
    /// fail fast at startup if it is unreachable.
    pub async fn connect(dsn: &str) -> Result<Self, ConfigError> {
        let parsed =
            url::Url::parse(dsn).map_err(|e| ConfigError::InvalidStorageDsn(e.to_string()))?;
        if parsed.scheme() != "redis" {
            return Err(ConfigError::UnknownStorage(parsed.scheme().to_string()));
        }
        let key = parsed
            .query_pairs()
            .find(|(k, _)| k == "key")
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ConfigError::InvalidStorageDsn("redis storage requires 'key' parameter".into())
            })?;

        let client = redis::Client::open(dsn)
            .map_err(|e| ConfigError::InvalidStorageDsn(e.to_string()))?;
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(|e| ConfigError::InvalidStorageDsn(e.to_string()))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| ConfigError::InvalidStorageDsn(e.to_string()))?;

        info!(key = %key, "connected to spill store");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            key,
        })
    }
}

#[async_trait]
impl SpillStore for RedisSpillStore {
    async fn append(&self, record: Vec<u8>) -> Result<(), StorageError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;
        conn.lpush::<_, _, ()>(&self.key, record)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    async fn pop(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;
        let data: Option<Vec<u8>> = conn
            .rpop(&self.key, None)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        match data {
            Some(bytes) if !bytes.is_empty() => Ok(Some(bytes)),
            _ => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        let mut guard = self.conn.lock().await;
        if guard.take().is_some() {
            debug!("closing spill store connection");
        } else {
            warn!("spill store close() called more than once");
        }
        Ok(())
    }
}
