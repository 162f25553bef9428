//! Session registry.
//!
//! Tracks connection sessions (one live database link each), chat sessions
//! layered on top of them, and the per-session schema and knowledge caches.
//! Every lookup is a map read; nothing here performs I/O.

mod memory;

pub use memory::InMemorySessionStore;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{ReadOnlyStatus, Schema};
use crate::knowledge::KnowledgeBase;
use crate::llm::Conversation;

/// Connection-session id used by chats created through a raw connection id.
pub const LEGACY_SESSION: &str = "legacy";

/// Server-side handle for one live database link.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSession {
    pub id: String,
    pub connection_id: i64,
    pub read_only: ReadOnlyStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Server-side handle for one conversation.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: String,
    pub connection_session_id: String,
    /// Connection the chat was started on. Legacy chats share one session
    /// key, so this is what keeps them apart.
    pub connection_id: i64,
    pub is_follow_up: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub conversation: Conversation,
}

/// Result of validating a chat session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChatValidation {
    pub is_valid: bool,
    pub is_follow_up: bool,
}

/// Registry of sessions and their caches.
///
/// Implementations must keep two invariants: a chat session is valid only
/// while its connection session resolves (or it is a legacy chat on the same
/// connection), and no cache entry outlives its connection session.
pub trait SessionStore: Send + Sync {
    fn create_connection_session(
        &self,
        connection_id: i64,
        read_only: ReadOnlyStatus,
    ) -> ConnectionSession;

    fn connection_session(&self, id: &str) -> Option<ConnectionSession>;

    /// Returns the connection id behind a live connection session.
    fn validate_connection_session(&self, id: &str) -> Option<i64> {
        self.connection_session(id).map(|s| s.connection_id)
    }

    /// Bumps `last_activity_at`. Returns false for unknown sessions.
    fn touch_connection_session(&self, id: &str) -> bool;

    /// Removes the session, its caches and the chats that depend on it.
    fn destroy_connection_session(&self, id: &str) -> Option<ConnectionSession>;

    /// Ids of the live sessions on a connection.
    fn sessions_for_connection(&self, connection_id: i64) -> Vec<String>;

    /// Destroys sessions idle for longer than `max_idle` as of `now`, and
    /// forgets legacy chats idle for as long. Returns the destroyed sessions.
    fn expire_idle(&self, max_idle: Duration, now: DateTime<Utc>) -> Vec<ConnectionSession>;

    /// Starts a chat on a connection session, or on [`LEGACY_SESSION`].
    fn create_chat_session(&self, connection_session_id: &str, connection_id: i64) -> String;

    /// A chat is valid only under the session key and connection it was
    /// created with. Invalid chats are not repaired; callers mint a new one.
    fn validate_chat_session(
        &self,
        id: &str,
        connection_session_id: &str,
        connection_id: i64,
    ) -> ChatValidation;

    /// Flags the chat so its next turn counts as a follow-up.
    fn mark_chat_session_as_follow_up(&self, id: &str);

    /// Records one question and the SQL it produced.
    fn append_exchange(&self, chat_id: &str, question: &str, answer: &str);

    /// The chat's bounded history; empty for unknown chats.
    fn history(&self, chat_id: &str) -> Conversation;

    /// Mutex held for the duration of one chat turn.
    fn chat_turn_lock(&self, chat_id: &str) -> Arc<tokio::sync::Mutex<()>>;

    fn get_cache_schema(&self, connection_session_id: &str) -> Option<Arc<Schema>>;

    /// Ignored unless the connection session is live.
    fn set_cache_schema(&self, connection_session_id: &str, schema: Arc<Schema>);

    fn get_cache_knowledge_base(&self, connection_session_id: &str) -> Option<Arc<KnowledgeBase>>;

    /// Ignored unless the connection session is live.
    fn set_cache_knowledge_base(&self, connection_session_id: &str, kb: Arc<KnowledgeBase>);

    /// Drops the cached knowledge base, keeping the schema.
    fn invalidate_knowledge_base(&self, connection_session_id: &str);
}
