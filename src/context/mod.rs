use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::session::{
    ConversationMessage, FetchedContextItem, MessageMetadata, Role, SessionStore,
};

/// Crude token estimate: one token per four bytes, rounded down.
/// An explicit heuristic, not a tokenizer.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

/// Provider-facing message projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiMessage {
    pub role: String,
    pub content: String,
}

impl ApiMessage {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "role": self.role, "content": self.content })
    }
}

/// Builds the ordered message list sent to the LLM from session state.
///
/// Explicit tracking, no hidden compression: nothing is ever summarized or
/// dropped here. History and fetched context are cleared only through their
/// own operations, independently of each other.
#[derive(Clone)]
pub struct ContextAssembler {
    store: Arc<SessionStore>,
}

impl ContextAssembler {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    pub async fn append_user_message(
        &self,
        session_id: &str,
        content: &str,
        timestamp: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        let mut session = self.store.load(session_id).await?;
        session.conversation_history.push(ConversationMessage {
            role: Role::User,
            content: content.to_string(),
            timestamp: timestamp.unwrap_or_else(chrono::Utc::now),
            metadata: None,
        });
        session.metadata.message_count += 1;
        session.metadata.token_count += estimate_tokens(content);
        self.store.save(session_id, session).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn append_assistant_message(
        &self,
        session_id: &str,
        content: &str,
        model: &str,
        sources_used: Vec<String>,
        tools_used: Vec<String>,
        response_time_ms: Option<u64>,
    ) -> Result<()> {
        let mut session = self.store.load(session_id).await?;
        session.conversation_history.push(ConversationMessage {
            role: Role::Assistant,
            content: content.to_string(),
            timestamp: chrono::Utc::now(),
            metadata: Some(MessageMetadata {
                model: Some(model.to_string()),
                sources_used,
                tools_used,
                response_time_ms,
            }),
        });
        session.metadata.message_count += 1;
        session.metadata.token_count += estimate_tokens(content);
        self.store.save(session_id, session).await
    }

    /// Append page or search material. Does not affect `message_count`.
    pub async fn add_fetched_context(
        &self,
        session_id: &str,
        source_type: &str,
        content: &str,
        url: Option<String>,
        extracted_data: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut session = self.store.load(session_id).await?;
        session
            .fetched_context
            .entry(source_type.to_string())
            .or_default()
            .push(FetchedContextItem {
                source_type: source_type.to_string(),
                content: content.to_string(),
                url,
                timestamp: chrono::Utc::now(),
                extracted_data,
            });
        self.store.save(session_id, session).await
    }

    /// Deterministic projection for the provider call.
    ///
    /// Fetched-context items come first as synthetic system entries, ordered
    /// by source type then insertion order, followed by the conversation
    /// history in chronological order. Tests assert exact positions.
    pub async fn formatted_messages_for_api(&self, session_id: &str) -> Result<Vec<ApiMessage>> {
        let session = self.store.load(session_id).await?;
        let mut messages = Vec::new();

        for (source_type, items) in &session.fetched_context {
            for item in items {
                let content = match &item.url {
                    Some(url) => format!("[{source_type}] ({url})\n{}", item.content),
                    None => format!("[{source_type}]\n{}", item.content),
                };
                messages.push(ApiMessage {
                    role: Role::System.as_str().to_string(),
                    content,
                });
            }
        }

        for message in &session.conversation_history {
            messages.push(ApiMessage {
                role: message.role.as_str().to_string(),
                content: message.content.clone(),
            });
        }

        Ok(messages)
    }

    /// Empty the conversation history and reset its counters.
    /// Fetched context is left untouched.
    pub async fn clear_conversation_history(&self, session_id: &str) -> Result<()> {
        let mut session = self.store.load(session_id).await?;
        session.conversation_history.clear();
        session.metadata.message_count = 0;
        session.metadata.token_count = 0;
        self.store.save(session_id, session).await
    }

    /// Clear one source type's fetched items, or all of them if `None`.
    /// Conversation history is left untouched.
    pub async fn clear_fetched_context(
        &self,
        session_id: &str,
        source_type: Option<&str>,
    ) -> Result<()> {
        let mut session = self.store.load(session_id).await?;
        match source_type {
            Some(tag) => {
                session.fetched_context.remove(tag);
            }
            None => session.fetched_context.clear(),
        }
        self.store.save(session_id, session).await
    }
}
