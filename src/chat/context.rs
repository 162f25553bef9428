//! Where prompt context comes from.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::connection::ConnectionLifecycle;
use crate::db::Schema;
use crate::error::{CopilotError, Result};
use crate::knowledge::{KnowledgeBase, KnowledgeStore};

/// Fetches fresh schema and knowledge for a connection.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn fetch_schema(&self, connection_id: i64) -> Result<Schema>;

    async fn fetch_knowledge_base(&self, connection_id: i64) -> Result<KnowledgeBase>;
}

/// Introspects the live link and reads the knowledge store.
pub struct LiveContextSource {
    lifecycle: Arc<ConnectionLifecycle>,
    knowledge: Arc<dyn KnowledgeStore>,
}

impl LiveContextSource {
    pub fn new(lifecycle: Arc<ConnectionLifecycle>, knowledge: Arc<dyn KnowledgeStore>) -> Self {
        Self {
            lifecycle,
            knowledge,
        }
    }
}

#[async_trait]
impl ContextSource for LiveContextSource {
    async fn fetch_schema(&self, connection_id: i64) -> Result<Schema> {
        let client = self.lifecycle.link_for(connection_id).await?;
        client.introspect_schema().await
    }

    async fn fetch_knowledge_base(&self, connection_id: i64) -> Result<KnowledgeBase> {
        self.knowledge.load(connection_id).await
    }
}

/// Serves a fixed schema and knowledge base and counts fetches.
///
/// Clones share counters and the failure switch.
#[derive(Clone, Default)]
pub struct StaticContextSource {
    schema: Schema,
    knowledge: KnowledgeBase,
    state: Arc<StaticState>,
}

#[derive(Default)]
struct StaticState {
    schema_fetches: AtomicUsize,
    knowledge_fetches: AtomicUsize,
    failing: AtomicBool,
}

impl StaticContextSource {
    /// Serves the same schema and knowledge base to every connection.
    pub fn new(schema: Schema, knowledge: KnowledgeBase) -> Self {
        Self {
            schema,
            knowledge,
            state: Arc::default(),
        }
    }

    /// Makes every schema fetch fail.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub fn schema_fetches(&self) -> usize {
        self.state.schema_fetches.load(Ordering::SeqCst)
    }

    pub fn knowledge_fetches(&self) -> usize {
        self.state.knowledge_fetches.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.state.failing.load(Ordering::SeqCst) {
            Err(CopilotError::connection("Context source unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContextSource for StaticContextSource {
    async fn fetch_schema(&self, _connection_id: i64) -> Result<Schema> {
        self.state.schema_fetches.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.schema.clone())
    }

    async fn fetch_knowledge_base(&self, _connection_id: i64) -> Result<KnowledgeBase> {
        self.state.knowledge_fetches.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.knowledge.clone())
    }
}
