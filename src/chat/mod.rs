//! Natural-language query pipeline.
//!
//! Resolves which connection and conversation a question belongs to,
//! assembles prompt context from cache or fresh fetches, asks the AI (or
//! the template matcher) for SQL, runs it and enriches the result.

mod context;
mod fallback;
mod orchestrator;

pub use context::{ContextSource, LiveContextSource, StaticContextSource};
pub use fallback::{generate_fallback_sql, FallbackSql};
pub use orchestrator::{ChatOrchestrator, ChatRequest, ChatResponse, QueryData};

use crate::error::ErrorCode;
use crate::session::{SessionStore, LEGACY_SESSION};

/// How a request names its database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    ViaSession(String),
    ViaLegacyId(i64),
}

/// A target resolved to a connection id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConnection {
    pub connection_id: i64,
    /// Key for chat sessions and caches; [`LEGACY_SESSION`] on the legacy path.
    pub session_key: String,
}

impl ConnectionTarget {
    /// A session id wins over a raw connection id. Empty ids count as absent.
    pub fn from_parts(
        connection_session_id: Option<&str>,
        connection_id: Option<i64>,
    ) -> Option<Self> {
        match connection_session_id.filter(|id| !id.is_empty()) {
            Some(id) => Some(Self::ViaSession(id.to_string())),
            None => connection_id.map(Self::ViaLegacyId),
        }
    }

    /// Resolves the target once, at the entry point.
    pub fn resolve(
        &self,
        sessions: &dyn SessionStore,
    ) -> std::result::Result<ResolvedConnection, ErrorCode> {
        match self {
            Self::ViaSession(id) => {
                let connection_id = sessions
                    .validate_connection_session(id)
                    .ok_or(ErrorCode::InvalidSession)?;
                sessions.touch_connection_session(id);
                Ok(ResolvedConnection {
                    connection_id,
                    session_key: id.clone(),
                })
            }
            Self::ViaLegacyId(connection_id) => Ok(ResolvedConnection {
                connection_id: *connection_id,
                session_key: LEGACY_SESSION.to_string(),
            }),
        }
    }
}

/// Resolves optional request fields straight to a connection.
pub fn resolve_connection(
    sessions: &dyn SessionStore,
    connection_session_id: Option<&str>,
    connection_id: Option<i64>,
) -> std::result::Result<ResolvedConnection, ErrorCode> {
    ConnectionTarget::from_parts(connection_session_id, connection_id)
        .ok_or(ErrorCode::MissingConnection)?
        .resolve(sessions)
}

/// Client-facing text for a resolution failure.
pub fn resolution_message(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::MissingConnection => "No connection session or connection id supplied",
        _ => "Connection session is invalid or expired",
    }
}
