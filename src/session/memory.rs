//! In-memory session store.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{ChatSession, ChatValidation, ConnectionSession, SessionStore, LEGACY_SESSION};
use crate::db::{ReadOnlyStatus, Schema};
use crate::knowledge::KnowledgeBase;
use crate::llm::Conversation;

/// Session store backed by process-local maps.
///
/// Each map has its own lock, so requests for different sessions never wait
/// on each other for longer than a map operation. Cache writes hold the
/// `connections` read lock around the insert; destroy removes the session
/// under the write lock before clearing caches, so a cache entry cannot land
/// after its session is gone.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    connections: RwLock<HashMap<String, ConnectionSession>>,
    chats: RwLock<HashMap<String, ChatSession>>,
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
    knowledge: RwLock<HashMap<String, Arc<KnowledgeBase>>>,
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn is_live(&self, connection_session_id: &str) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(connection_session_id)
    }

    /// Inserts into a cache map only while the session is live.
    fn insert_if_live<T>(
        &self,
        cache: &RwLock<HashMap<String, Arc<T>>>,
        connection_session_id: &str,
        value: Arc<T>,
    ) {
        let connections = self.connections.read().unwrap_or_else(PoisonError::into_inner);
        if !connections.contains_key(connection_session_id) {
            return;
        }
        cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_session_id.to_string(), value);
    }

    fn drop_chats(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let mut locks = self.turn_locks.lock().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            locks.remove(id);
        }
    }
}

impl SessionStore for InMemorySessionStore {
    fn create_connection_session(
        &self,
        connection_id: i64,
        read_only: ReadOnlyStatus,
    ) -> ConnectionSession {
        let now = Utc::now();
        let session = ConnectionSession {
            id: Self::new_id(),
            connection_id,
            read_only,
            created_at: now,
            last_activity_at: now,
        };
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id.clone(), session.clone());
        session
    }

    fn connection_session(&self, id: &str) -> Option<ConnectionSession> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn touch_connection_session(&self, id: &str) -> bool {
        let mut connections = self.connections.write().unwrap_or_else(PoisonError::into_inner);
        match connections.get_mut(id) {
            Some(session) => {
                session.last_activity_at = Utc::now();
                true
            }
            None => false,
        }
    }

    fn destroy_connection_session(&self, id: &str) -> Option<ConnectionSession> {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)?;

        self.schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.knowledge
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        let dependent: Vec<String> = {
            let mut chats = self.chats.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<String> = chats
                .values()
                .filter(|c| c.connection_session_id == id)
                .map(|c| c.id.clone())
                .collect();
            for chat_id in &ids {
                chats.remove(chat_id);
            }
            ids
        };
        self.drop_chats(&dependent);

        debug!(
            session_id = %id,
            connection_id = removed.connection_id,
            chats = dependent.len(),
            "Destroyed connection session"
        );
        Some(removed)
    }

    fn sessions_for_connection(&self, connection_id: i64) -> Vec<String> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.connection_id == connection_id)
            .map(|s| s.id.clone())
            .collect()
    }

    fn expire_idle(&self, max_idle: Duration, now: DateTime<Utc>) -> Vec<ConnectionSession> {
        let max_idle = chrono::Duration::from_std(max_idle).unwrap_or(chrono::Duration::MAX);

        let stale: Vec<String> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| now - s.last_activity_at > max_idle)
            .map(|s| s.id.clone())
            .collect();

        let stale_legacy: Vec<String> = {
            let mut chats = self.chats.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<String> = chats
                .values()
                .filter(|c| {
                    c.connection_session_id == LEGACY_SESSION
                        && now - c.last_activity_at > max_idle
                })
                .map(|c| c.id.clone())
                .collect();
            for id in &ids {
                chats.remove(id);
            }
            ids
        };
        self.drop_chats(&stale_legacy);

        stale
            .iter()
            .filter_map(|id| self.destroy_connection_session(id))
            .collect()
    }

    fn create_chat_session(&self, connection_session_id: &str, connection_id: i64) -> String {
        let now = Utc::now();
        let chat = ChatSession {
            id: Self::new_id(),
            connection_session_id: connection_session_id.to_string(),
            connection_id,
            is_follow_up: false,
            created_at: now,
            last_activity_at: now,
            conversation: Conversation::new(),
        };
        let id = chat.id.clone();
        self.chats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), chat);
        id
    }

    fn validate_chat_session(
        &self,
        id: &str,
        connection_session_id: &str,
        connection_id: i64,
    ) -> ChatValidation {
        let chat = {
            let chats = self.chats.read().unwrap_or_else(PoisonError::into_inner);
            match chats.get(id) {
                Some(chat)
                    if chat.connection_session_id == connection_session_id
                        && chat.connection_id == connection_id =>
                {
                    chat.is_follow_up
                }
                _ => return ChatValidation::default(),
            }
        };

        let backing_ok =
            connection_session_id == LEGACY_SESSION || self.is_live(connection_session_id);
        if !backing_ok {
            return ChatValidation::default();
        }

        ChatValidation {
            is_valid: true,
            is_follow_up: chat,
        }
    }

    fn mark_chat_session_as_follow_up(&self, id: &str) {
        if let Some(chat) = self
            .chats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(id)
        {
            chat.is_follow_up = true;
            chat.last_activity_at = Utc::now();
        }
    }

    fn append_exchange(&self, chat_id: &str, question: &str, answer: &str) {
        if let Some(chat) = self
            .chats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(chat_id)
        {
            chat.conversation.push(question, answer);
            chat.last_activity_at = Utc::now();
        }
    }

    fn history(&self, chat_id: &str) -> Conversation {
        self.chats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chat_id)
            .map(|c| c.conversation.clone())
            .unwrap_or_default()
    }

    fn chat_turn_lock(&self, chat_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.turn_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(chat_id.to_string())
            .or_default()
            .clone()
    }

    fn get_cache_schema(&self, connection_session_id: &str) -> Option<Arc<Schema>> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection_session_id)
            .cloned()
    }

    fn set_cache_schema(&self, connection_session_id: &str, schema: Arc<Schema>) {
        self.insert_if_live(&self.schemas, connection_session_id, schema);
    }

    fn get_cache_knowledge_base(&self, connection_session_id: &str) -> Option<Arc<KnowledgeBase>> {
        self.knowledge
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection_session_id)
            .cloned()
    }

    fn set_cache_knowledge_base(&self, connection_session_id: &str, kb: Arc<KnowledgeBase>) {
        self.insert_if_live(&self.knowledge, connection_session_id, kb);
    }

    fn invalidate_knowledge_base(&self, connection_session_id: &str) {
        self.knowledge
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_session_id);
    }
}
