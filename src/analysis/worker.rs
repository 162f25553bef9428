//! Producing knowledge artifacts for one analysis phase.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{AnalysisPhase, PhaseLog};
use crate::chat::ContextSource;
use crate::db::Schema;
use crate::error::{CopilotError, Result};
use crate::knowledge::{ColumnExplanation, SqlExample};
use crate::llm::{strip_code_fence, LlmClient, Message};

/// Artifacts produced by one phase, committed only if the phase finishes
/// uncancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutput {
    Tables(BTreeMap<String, String>),
    Columns(Vec<ColumnExplanation>),
    Examples(Vec<SqlExample>),
}

impl PhaseOutput {
    pub fn len(&self) -> usize {
        match self {
            Self::Tables(t) => t.len(),
            Self::Columns(c) => c.len(),
            Self::Examples(e) => e.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Does the work of a phase.
#[async_trait]
pub trait AnalysisWorker: Send + Sync {
    async fn run_phase(
        &self,
        phase: AnalysisPhase,
        connection_id: i64,
        log: &PhaseLog,
    ) -> Result<PhaseOutput>;
}

const TABLES_PROMPT: &str = r#"You document databases for analysts. For every table in the schema below, write one sentence explaining what it stores in business terms.
Respond with a single JSON object mapping table name to explanation and nothing else."#;

const COLUMNS_PROMPT: &str = r#"You document databases for analysts. For the non-obvious columns in the schema below, explain what each one means in business terms.
Respond with a JSON array of {"table": "...", "column": "...", "explanation": "..."} objects and nothing else."#;

const EXAMPLES_PROMPT: &str = r#"You write example PostgreSQL queries for analysts. Using only the schema below, write up to five useful read-only questions with the SELECT that answers each.
Respond with a JSON array of {"question": "...", "sql": "..."} objects and nothing else."#;

/// Asks the LLM for each artifact, grounded in the connection's schema.
pub struct LlmAnalysisWorker {
    llm: Option<Arc<dyn LlmClient>>,
    context: Arc<dyn ContextSource>,
}

impl LlmAnalysisWorker {
    /// Without an LLM every phase fails with an AI error.
    pub fn new(llm: Option<Arc<dyn LlmClient>>, context: Arc<dyn ContextSource>) -> Self {
        Self { llm, context }
    }

    async fn ask<T: DeserializeOwned>(
        &self,
        llm: &dyn LlmClient,
        instructions: &str,
        schema: &Schema,
    ) -> Result<T> {
        let messages = vec![
            Message::system(instructions),
            Message::user(schema.format_for_llm()),
        ];
        let text = llm.complete(&messages, None).await?;
        parse_json(&text)
    }
}

#[async_trait]
impl AnalysisWorker for LlmAnalysisWorker {
    async fn run_phase(
        &self,
        phase: AnalysisPhase,
        connection_id: i64,
        log: &PhaseLog,
    ) -> Result<PhaseOutput> {
        let llm = self
            .llm
            .as_deref()
            .ok_or_else(|| CopilotError::llm("No AI backend configured"))?;
        if !llm.is_available().await {
            return Err(CopilotError::llm("AI backend is unavailable"));
        }

        let schema = self.context.fetch_schema(connection_id).await?;
        log.append(&format!(
            "Generating {} for {} tables",
            phase.label(),
            schema.tables.len()
        ));

        let output = match phase {
            AnalysisPhase::Tables => {
                let mut tables: BTreeMap<String, String> =
                    self.ask(llm, TABLES_PROMPT, &schema).await?;
                tables.retain(|name, _| schema.table(name).is_some());
                PhaseOutput::Tables(tables)
            }
            AnalysisPhase::Columns => {
                let mut columns: Vec<ColumnExplanation> =
                    self.ask(llm, COLUMNS_PROMPT, &schema).await?;
                columns.retain(|c| {
                    schema
                        .table(&c.table)
                        .is_some_and(|t| t.columns.iter().any(|col| col.name == c.column))
                });
                PhaseOutput::Columns(columns)
            }
            AnalysisPhase::Examples => {
                PhaseOutput::Examples(self.ask(llm, EXAMPLES_PROMPT, &schema).await?)
            }
        };
        Ok(output)
    }
}

fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    let body = strip_code_fence(text);
    serde_json::from_str(body)
        .map_err(|e| CopilotError::llm(format!("Could not parse analysis output: {e}")))
}
