//! In-memory knowledge store.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{ColumnExplanation, KnowledgeBase, KnowledgeStore, SqlExample};
use crate::error::{CopilotError, Result};

/// Knowledge store that lives for the process only.
#[derive(Debug, Default)]
pub struct InMemoryKnowledgeStore {
    entries: RwLock<HashMap<i64, KnowledgeBase>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a connection's knowledge base.
    pub fn insert(&self, connection_id: i64, kb: KnowledgeBase) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(connection_id, kb);
        }
    }

    fn update(&self, connection_id: i64, f: impl FnOnce(&mut KnowledgeBase)) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CopilotError::internal("knowledge store lock poisoned"))?;
        f(entries.entry(connection_id).or_default());
        Ok(())
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn load(&self, connection_id: i64) -> Result<KnowledgeBase> {
        let entries = self
            .entries
            .read()
            .map_err(|_| CopilotError::internal("knowledge store lock poisoned"))?;
        Ok(entries.get(&connection_id).cloned().unwrap_or_default())
    }

    async fn save_table_explanations(
        &self,
        connection_id: i64,
        explanations: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.update(connection_id, |kb| {
            kb.table_explanations = explanations.clone();
        })
    }

    async fn save_column_explanations(
        &self,
        connection_id: i64,
        explanations: &[ColumnExplanation],
    ) -> Result<()> {
        self.update(connection_id, |kb| {
            kb.column_explanations = explanations.to_vec();
        })
    }

    async fn save_sql_examples(&self, connection_id: i64, examples: &[SqlExample]) -> Result<()> {
        self.update(connection_id, |kb| {
            kb.sql_examples = examples.to_vec();
        })
    }
}
