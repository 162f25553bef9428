//! One chat turn, from question to enriched result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fallback::generate_fallback_sql;
use super::{resolution_message, resolve_connection, ContextSource, ResolvedConnection};
use crate::db::{ColumnInfo, Schema};
use crate::error::ErrorCode;
use crate::knowledge::KnowledgeBase;
use crate::llm::{build_messages, parse_ai_response, LlmClient, PromptContext};
use crate::query::{enrich_visualization, ExecutedQuery, QueryExecutor, Visualization};
use crate::session::SessionStore;

/// Default bound on one AI call.
pub const DEFAULT_AI_TIMEOUT: Duration = Duration::from_secs(60);

/// A natural-language question.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_session_id: Option<String>,
    pub natural_language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Rows and presentation hints of a successful turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryData {
    pub sql: String,
    pub data: Vec<serde_json::Map<String, serde_json::Value>>,
    pub columns: Vec<ColumnInfo>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub visualization: Option<Visualization>,
}

/// Answer to a [`ChatRequest`], in its wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<QueryData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Whether this turn ran as a follow-up.
    #[serde(skip)]
    pub follow_up: bool,
}

impl ChatResponse {
    /// Failed turn. The chat id is attached later if one was resolved.
    pub fn failure(code: Option<ErrorCode>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            chat_session_id: None,
            data: None,
            explanation: None,
            error: Some(error.into()),
            error_code: code,
            sql: None,
            timestamp: Utc::now(),
            follow_up: false,
        }
    }

    fn in_chat(mut self, chat_id: &str, follow_up: bool) -> Self {
        self.chat_session_id = Some(chat_id.to_string());
        self.follow_up = follow_up;
        self
    }

    /// Records the statement that was run or rejected.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Wraps a direct execution, which has no chat session or explanation.
    pub fn from_executed(executed: ExecutedQuery) -> Self {
        if !executed.success {
            return Self::failure(
                executed.error_code,
                executed.error.unwrap_or_else(|| "Query failed".to_string()),
            )
            .with_sql(executed.sql);
        }
        Self {
            success: true,
            chat_session_id: None,
            data: Some(query_data(executed, None)),
            explanation: None,
            error: None,
            error_code: None,
            sql: None,
            timestamp: Utc::now(),
            follow_up: false,
        }
    }
}

/// Schema and knowledge gathered for one turn.
#[derive(Debug, Default)]
struct TurnContext {
    schema: Option<Arc<Schema>>,
    knowledge: Option<Arc<KnowledgeBase>>,
    /// Prompt must fall back to the question alone.
    minimal: bool,
}

impl TurnContext {
    fn prompt(&self) -> PromptContext<'_> {
        match (&self.schema, &self.knowledge) {
            (Some(schema), Some(kb)) if !self.minimal => PromptContext::full(schema, kb),
            _ => PromptContext::minimal(),
        }
    }
}

/// SQL chosen for execution and where it came from.
struct Candidate {
    sql: String,
    explanation: Option<String>,
    visualization: Option<Visualization>,
    trusted: bool,
}

/// Runs chat turns.
pub struct ChatOrchestrator {
    sessions: Arc<dyn SessionStore>,
    context: Arc<dyn ContextSource>,
    llm: Option<Arc<dyn LlmClient>>,
    executor: Arc<dyn QueryExecutor>,
    ai_timeout: Duration,
}

impl ChatOrchestrator {
    /// Creates an orchestrator. `llm: None` routes every question to the pattern matcher.
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        context: Arc<dyn ContextSource>,
        llm: Option<Arc<dyn LlmClient>>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        Self {
            sessions,
            context,
            llm,
            executor,
            ai_timeout: DEFAULT_AI_TIMEOUT,
        }
    }

    /// Bounds the model call. A timed-out call fails the turn with `AI_ERROR`.
    pub fn with_ai_timeout(mut self, timeout: Duration) -> Self {
        self.ai_timeout = timeout;
        self
    }

    /// Answers one question.
    ///
    /// Turns on the same chat session run one at a time; a second turn
    /// waits for the first to finish.
    pub async fn ask(&self, request: ChatRequest, cancel: &CancellationToken) -> ChatResponse {
        let resolved = match resolve_connection(
            self.sessions.as_ref(),
            request.connection_session_id.as_deref(),
            request.connection_id,
        ) {
            Ok(resolved) => resolved,
            Err(code) => {
                debug!(code = %code, "Connection resolution failed");
                return ChatResponse::failure(Some(code), resolution_message(code));
            }
        };
        debug!(
            connection_id = resolved.connection_id,
            session = %resolved.session_key,
            "Resolved connection"
        );

        let chat_id = self.resolve_chat(request.chat_session_id.as_deref(), &resolved);

        let turn_lock = self.sessions.chat_turn_lock(&chat_id);
        let _turn = turn_lock.lock().await;

        // Read after the lock so a queued turn sees the previous turn's flag.
        let validation = self
            .sessions
            .validate_chat_session(&chat_id, &resolved.session_key, resolved.connection_id);
        if !validation.is_valid {
            return ChatResponse::failure(
                Some(ErrorCode::InvalidSession),
                resolution_message(ErrorCode::InvalidSession),
            );
        }
        let follow_up = validation.is_follow_up;

        self.run_turn(&request, &resolved, &chat_id, follow_up, cancel)
            .await
            .in_chat(&chat_id, follow_up)
    }

    fn resolve_chat(&self, requested: Option<&str>, resolved: &ResolvedConnection) -> String {
        if let Some(id) = requested {
            if self
                .sessions
                .validate_chat_session(id, &resolved.session_key, resolved.connection_id)
                .is_valid
            {
                return id.to_string();
            }
            info!(chat_session_id = id, "Chat session not found, starting a new one");
        }
        let id = self
            .sessions
            .create_chat_session(&resolved.session_key, resolved.connection_id);
        debug!(chat_session_id = %id, "Created chat session");
        id
    }

    async fn run_turn(
        &self,
        request: &ChatRequest,
        resolved: &ResolvedConnection,
        chat_id: &str,
        follow_up: bool,
        cancel: &CancellationToken,
    ) -> ChatResponse {
        let question = request.natural_language.as_str();

        if cancel.is_cancelled() {
            return cancelled();
        }
        let context = self.gather_context(resolved, follow_up).await;

        let ai_available = match &self.llm {
            Some(llm) => llm.is_available().await,
            None => false,
        };

        let candidate = if ai_available {
            let history = if follow_up {
                Some(self.sessions.history(chat_id))
            } else {
                None
            };
            let mut prompt = context.prompt();
            if let Some(history) = history.as_ref() {
                prompt = prompt.with_history(history);
            }

            if cancel.is_cancelled() {
                return cancelled();
            }
            match self.ask_ai(question, &prompt, request.model.as_deref(), cancel).await {
                Ok(Some(candidate)) => candidate,
                Ok(None) => {
                    return ChatResponse::failure(
                        Some(ErrorCode::NoSqlGenerated),
                        "The AI did not produce a SQL query",
                    )
                }
                Err(response) => return response,
            }
        } else {
            info!(connection_id = resolved.connection_id, "AI unavailable, using pattern fallback");
            match generate_fallback_sql(question, context.schema.as_deref()) {
                Some(fallback) => Candidate {
                    sql: fallback.sql,
                    explanation: Some(fallback.explanation),
                    visualization: fallback.visualization,
                    trusted: true,
                },
                None => {
                    return ChatResponse::failure(
                        Some(ErrorCode::CopilotUnavailable),
                        "AI assistant is unavailable and the question matched no built-in pattern",
                    )
                }
            }
        };

        if cancel.is_cancelled() {
            return cancelled().with_sql(candidate.sql);
        }
        debug!(trusted = candidate.trusted, sql = %candidate.sql, "Executing");
        let executed = self
            .executor
            .execute(resolved.connection_id, &candidate.sql, candidate.trusted)
            .await;

        if !executed.success {
            return ChatResponse::from_executed(executed);
        }

        self.sessions.mark_chat_session_as_follow_up(chat_id);
        self.sessions.append_exchange(chat_id, question, &candidate.sql);

        ChatResponse {
            success: true,
            chat_session_id: None,
            data: Some(query_data(executed, candidate.visualization)),
            explanation: candidate.explanation,
            error: None,
            error_code: None,
            sql: None,
            timestamp: Utc::now(),
            follow_up,
        }
    }

    /// Cached context for follow-ups, fresh context otherwise.
    ///
    /// Fetch failures degrade the prompt to the question alone; whatever
    /// schema was obtained is still handed to the pattern fallback.
    async fn gather_context(&self, resolved: &ResolvedConnection, follow_up: bool) -> TurnContext {
        let key = resolved.session_key.as_str();
        let connection_id = resolved.connection_id;

        let (cached_schema, cached_kb) = if follow_up {
            (
                self.sessions.get_cache_schema(key),
                self.sessions.get_cache_knowledge_base(key),
            )
        } else {
            (None, None)
        };

        if cached_schema.is_some() && cached_kb.is_some() {
            debug!(session = %key, "Using cached schema and knowledge base");
            return TurnContext {
                schema: cached_schema,
                knowledge: cached_kb,
                minimal: false,
            };
        }

        if follow_up {
            info!(
                session = %key,
                schema_missing = cached_schema.is_none(),
                knowledge_missing = cached_kb.is_none(),
                "Follow-up cache incomplete, fetching"
            );
        }

        let schema_fetch = async {
            match &cached_schema {
                Some(schema) => Ok(schema.clone()),
                None => self.context.fetch_schema(connection_id).await.map(Arc::new),
            }
        };
        let kb_fetch = async {
            match &cached_kb {
                Some(kb) => Ok(kb.clone()),
                None => self
                    .context
                    .fetch_knowledge_base(connection_id)
                    .await
                    .map(Arc::new),
            }
        };
        let (schema, kb) = futures::future::join(schema_fetch, kb_fetch).await;

        let schema = match schema {
            Ok(schema) => {
                self.sessions.set_cache_schema(key, schema.clone());
                Some(schema)
            }
            Err(e) => {
                warn!(connection_id, error = %e, "Schema fetch failed, using minimal prompt");
                None
            }
        };
        let knowledge = match kb {
            Ok(kb) => {
                self.sessions.set_cache_knowledge_base(key, kb.clone());
                Some(kb)
            }
            Err(e) => {
                warn!(connection_id, error = %e, "Knowledge base fetch failed, using minimal prompt");
                None
            }
        };

        let minimal = schema.is_none() || knowledge.is_none();
        TurnContext {
            schema,
            knowledge,
            minimal,
        }
    }

    async fn ask_ai(
        &self,
        question: &str,
        prompt: &PromptContext<'_>,
        model: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<Candidate>, ChatResponse> {
        let Some(llm) = &self.llm else {
            return Ok(None);
        };
        let messages = build_messages(question, prompt);
        debug!(messages = messages.len(), minimal = prompt.is_minimal(), "Calling AI");

        let call = tokio::time::timeout(self.ai_timeout, llm.complete(&messages, model));
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            result = call => match result {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => {
                    warn!(error = %e, "AI call failed");
                    return Err(ChatResponse::failure(Some(ErrorCode::AiError), e.to_string()));
                }
                Err(_) => {
                    warn!(timeout_secs = self.ai_timeout.as_secs(), "AI call timed out");
                    return Err(ChatResponse::failure(
                        Some(ErrorCode::AiError),
                        format!("AI request timed out after {}s", self.ai_timeout.as_secs()),
                    ));
                }
            }
        };

        let parsed = parse_ai_response(&text);
        Ok(parsed.sql.map(|sql| Candidate {
            sql,
            explanation: parsed.explanation,
            visualization: parsed.visualization,
            trusted: false,
        }))
    }
}

fn query_data(executed: ExecutedQuery, visualization: Option<Visualization>) -> QueryData {
    let visualization = visualization.or(executed.visualization).map(|mut viz| {
        enrich_visualization(&mut viz, &executed.columns);
        viz
    });
    QueryData {
        sql: executed.sql,
        data: executed.data,
        columns: executed.columns,
        row_count: executed.row_count,
        execution_time_ms: executed.execution_time_ms,
        visualization,
    }
}

fn cancelled() -> ChatResponse {
    ChatResponse::failure(None, "Request cancelled")
}
