//! Prompt construction for SQL generation.

use crate::db::Schema;
use crate::knowledge::KnowledgeBase;
use crate::llm::types::{Conversation, Message};

const SYSTEM_PROMPT: &str = r#"You are a SQL assistant for a PostgreSQL database. Translate the user's question into a single read-only SQL query.

INSTRUCTIONS:
- Generate only valid PostgreSQL SQL
- Only SELECT queries (CTEs allowed); never modify data or schema
- Use appropriate JOINs based on foreign keys
- Limit results to 100 rows unless the user specifies otherwise
- If the question cannot be answered, set "sql" to null and say why in "explanation"

OUTPUT FORMAT:
Respond with a single JSON object and nothing else:
{"sql": "<query or null>", "explanation": "<one or two sentences>", "visualization": {"type": "bar|line|pie|table", "xAxis": "<column>", "yAxis": ["<column>", ...], "title": "<short title>"}}
Omit "visualization" when a chart would not help."#;

/// Context available for one prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptContext<'a> {
    pub schema: Option<&'a Schema>,
    pub knowledge: Option<&'a KnowledgeBase>,
    pub history: Option<&'a Conversation>,
}

impl<'a> PromptContext<'a> {
    /// Schema and knowledge base both present.
    pub fn full(schema: &'a Schema, knowledge: &'a KnowledgeBase) -> Self {
        Self {
            schema: Some(schema),
            knowledge: Some(knowledge),
            history: None,
        }
    }

    /// Question only.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Includes earlier exchanges of the chat.
    pub fn with_history(mut self, history: &'a Conversation) -> Self {
        self.history = Some(history);
        self
    }

    /// True when neither schema nor knowledge is attached.
    pub fn is_minimal(&self) -> bool {
        self.schema.is_none() && self.knowledge.is_none()
    }
}

/// Builds the system prompt for the given context.
pub fn build_system_prompt(context: &PromptContext<'_>) -> String {
    let mut prompt = String::from(SYSTEM_PROMPT);

    if let Some(schema) = context.schema {
        prompt.push_str("\n\n");
        prompt.push_str(schema.format_for_llm().trim_end());
    }

    if let Some(kb) = context.knowledge.filter(|kb| !kb.is_empty()) {
        prompt.push_str("\n\nBUSINESS KNOWLEDGE:\n");
        prompt.push_str(kb.format_for_llm().trim_end());
    }

    prompt
}

/// Builds the full message list: system prompt, prior exchanges, question.
pub fn build_messages(question: &str, context: &PromptContext<'_>) -> Vec<Message> {
    let history = context
        .history
        .map(Conversation::to_messages)
        .unwrap_or_default();

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message::system(build_system_prompt(context)));
    messages.extend(history);
    messages.push(Message::user(question));
    messages
}
