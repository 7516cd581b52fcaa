use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::time::Instant;

use super::Session;
use crate::error::{Error, Result};

/// A stored session plus the bookkeeping the store's TTL/LRU policy needs.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session: Session,
    pub touched_at: Instant,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordMeta {
    pub touched_at: Instant,
    pub expires_at: Instant,
}

/// Pluggable backing medium for the session store.
///
/// Implementations must be safe under concurrent access from independent
/// request tasks. Unreachability surfaces as `Error::StoreUnavailable`.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<SessionRecord>>;
    async fn put(&self, key: &str, record: SessionRecord) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Metadata for every live entry, for sweep and eviction scans.
    async fn scan(&self) -> Result<Vec<(String, RecordMeta)>>;
    async fn len(&self) -> Result<usize>;
}

/// In-process backend. Default for single-worker deployments and tests.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, SessionRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, SessionRecord>>> {
        self.entries
            .lock()
            .map_err(|_| Error::StoreUnavailable("session map poisoned".into()))
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<SessionRecord>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn put(&self, key: &str, record: SessionRecord) -> Result<()> {
        self.lock()?.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<(String, RecordMeta)>> {
        Ok(self
            .lock()?
            .iter()
            .map(|(key, record)| {
                (
                    key.clone(),
                    RecordMeta {
                        touched_at: record.touched_at,
                        expires_at: record.expires_at,
                    },
                )
            })
            .collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }
}
