pub mod backend;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;
use backend::{SessionBackend, SessionRecord};

/// Conversation mode requested by the extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Normal,
    Thinking,
    Research,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub mode: SessionMode,
    pub current_url: Option<String>,
    pub user_timezone: Option<String>,
    pub user_time: Option<String>,
    pub token_count: u64,
    pub message_count: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_touched_at: chrono::DateTime<chrono::Utc>,
}

/// Per-message metadata attached to assistant turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources_used: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_used: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

/// One turn in the conversation. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

/// Page or search material fetched on behalf of a session.
/// Append-only except for explicit clears.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedContextItem {
    pub source_type: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<serde_json::Value>,
}

/// Unit of conversational state, keyed by an opaque session id.
///
/// `fetched_context` keys on source-type tag (`web_search`, `js_scraping`,
/// open to extension); a BTreeMap keeps the projection order deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub metadata: SessionMetadata,
    pub conversation_history: Vec<ConversationMessage>,
    pub fetched_context: BTreeMap<String, Vec<FetchedContextItem>>,
    pub system_prompt_override: Option<String>,
}

impl Session {
    pub fn new(session_id: &str) -> Self {
        let now = chrono::Utc::now();
        Self {
            session_id: session_id.to_string(),
            metadata: SessionMetadata {
                mode: SessionMode::default(),
                current_url: None,
                user_timezone: None,
                user_time: None,
                token_count: 0,
                message_count: 0,
                created_at: now,
                last_touched_at: now,
            },
            conversation_history: Vec::new(),
            fetched_context: BTreeMap::new(),
            system_prompt_override: None,
        }
    }
}

/// Cache-backed session store with TTL expiry and LRU-by-touch eviction.
///
/// The backing medium is the source of truth: independent workers share
/// sessions only through it, and every mutation is a whole-session
/// load -> mutate -> save. Concurrent writers to the same session are
/// last-write-wins; a single browser tab drives one session at a time,
/// so that race is accepted rather than locked away.
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    ttl: Duration,
    max_entries: usize,
    sweep_every: u64,
    op_counter: AtomicU64,
}

impl SessionStore {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        ttl: Duration,
        max_entries: usize,
        sweep_every: u64,
    ) -> Self {
        Self {
            backend,
            ttl,
            max_entries,
            sweep_every: sweep_every.max(1),
            op_counter: AtomicU64::new(0),
        }
    }

    /// Load a session, creating an empty one if absent or expired.
    /// Resets the entry's TTL as a side effect (touch on read).
    pub async fn load(&self, session_id: &str) -> Result<Session> {
        self.maybe_sweep().await?;

        let now = Instant::now();
        if let Some(record) = self.backend.get(session_id).await? {
            if record.expires_at > now {
                let mut session = record.session;
                session.metadata.last_touched_at = chrono::Utc::now();
                self.put_record(session_id, session.clone()).await?;
                return Ok(session);
            }
            // Expired but not yet swept. Recreate below.
            self.backend.delete(session_id).await?;
        }

        debug!(session = %session_id, "creating session");
        let session = Session::new(session_id);
        self.put_record(session_id, session.clone()).await?;
        Ok(session)
    }

    /// Persist the full session, overwriting any prior value. Resets TTL.
    pub async fn save(&self, session_id: &str, mut session: Session) -> Result<()> {
        self.maybe_sweep().await?;
        session.metadata.last_touched_at = chrono::Utc::now();
        self.put_record(session_id, session).await
    }

    /// Remove a session immediately. Idempotent.
    pub async fn evict(&self, session_id: &str) -> Result<()> {
        self.backend.delete(session_id).await
    }

    /// Remove all expired entries; returns the count removed.
    pub async fn sweep(&self) -> Result<usize> {
        let now = Instant::now();
        let mut removed = 0;
        for (key, meta) in self.backend.scan().await? {
            if meta.expires_at <= now {
                self.backend.delete(&key).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "swept expired sessions");
        }
        Ok(removed)
    }

    async fn put_record(&self, session_id: &str, session: Session) -> Result<()> {
        let now = Instant::now();

        if self.backend.get(session_id).await?.is_none() {
            self.evict_to_capacity().await?;
        }

        self.backend
            .put(
                session_id,
                SessionRecord {
                    session,
                    touched_at: now,
                    expires_at: now + self.ttl,
                },
            )
            .await
    }

    /// Evict least-recently-touched entries until a new one fits.
    async fn evict_to_capacity(&self) -> Result<()> {
        while self.backend.len().await? >= self.max_entries {
            let oldest = self
                .backend
                .scan()
                .await?
                .into_iter()
                .min_by_key(|(_, meta)| meta.touched_at)
                .map(|(key, _)| key);
            match oldest {
                Some(key) => {
                    debug!(session = %key, "evicting least-recently-touched session");
                    self.backend.delete(&key).await?;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Sweep opportunistically every Nth operation instead of on a timer.
    async fn maybe_sweep(&self) -> Result<()> {
        let count = self.op_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.sweep_every == 0 {
            self.sweep().await?;
        }
        Ok(())
    }
}
