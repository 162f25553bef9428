//! Business knowledge about a database.
//!
//! Table explanations, column explanations and example queries produced by
//! schema analysis and fed into SQL-generation prompts. Stored per
//! connection id, so every session on the same database shares them.

mod memory;
mod migrations;
mod sqlite;

pub use memory::InMemoryKnowledgeStore;
pub use sqlite::SqliteKnowledgeStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// Explanation of a single column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnExplanation {
    pub table: String,
    pub column: String,
    pub explanation: String,
}

/// A natural-language question paired with SQL that answers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlExample {
    pub question: String,
    pub sql: String,
}

/// Knowledge artifacts for one database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBase {
    pub table_explanations: BTreeMap<String, String>,
    pub column_explanations: Vec<ColumnExplanation>,
    pub sql_examples: Vec<SqlExample>,
}

impl KnowledgeBase {
    /// True when no phase has committed anything.
    pub fn is_empty(&self) -> bool {
        self.table_explanations.is_empty()
            && self.column_explanations.is_empty()
            && self.sql_examples.is_empty()
    }

    /// Renders the knowledge base as prompt text.
    pub fn format_for_llm(&self) -> String {
        let mut out = String::new();

        if !self.table_explanations.is_empty() {
            out.push_str("Tables:\n");
            for (table, explanation) in &self.table_explanations {
                out.push_str(&format!("  - {table}: {explanation}\n"));
            }
        }

        if !self.column_explanations.is_empty() {
            out.push_str("Columns:\n");
            for col in &self.column_explanations {
                out.push_str(&format!(
                    "  - {}.{}: {}\n",
                    col.table, col.column, col.explanation
                ));
            }
        }

        if !self.sql_examples.is_empty() {
            out.push_str("Example queries:\n");
            for example in &self.sql_examples {
                out.push_str(&format!("  Q: {}\n  SQL: {}\n", example.question, example.sql));
            }
        }

        out
    }
}

/// Persistent storage of knowledge bases.
///
/// Each save replaces that artifact kind wholesale for the connection, so a
/// re-run of analysis never mixes old and new output.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn load(&self, connection_id: i64) -> Result<KnowledgeBase>;

    async fn save_table_explanations(
        &self,
        connection_id: i64,
        explanations: &BTreeMap<String, String>,
    ) -> Result<()>;

    async fn save_column_explanations(
        &self,
        connection_id: i64,
        explanations: &[ColumnExplanation],
    ) -> Result<()>;

    async fn save_sql_examples(&self, connection_id: i64, examples: &[SqlExample]) -> Result<()>;
}
