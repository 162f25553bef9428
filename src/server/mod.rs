//! HTTP surface.

mod extract;
mod handlers;

pub use extract::{ApiError, ApiJson, ErrorBody};
pub use handlers::{
    ConnectRequest, ConnectResponse, DisconnectRequest, ExecuteRequest, StartAnalysisRequest,
    StartAnalysisResponse, SuccessResponse, ValidateRequest, ValidateResponse,
};

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::analysis::{AnalysisJobManager, LlmAnalysisWorker};
use crate::chat::{ChatOrchestrator, ContextSource, LiveContextSource};
use crate::config::Config;
use crate::connection::{ConnectionLifecycle, Connector};
use crate::error::{CopilotError, Result};
use crate::knowledge::KnowledgeStore;
use crate::llm::LlmClient;
use crate::query::{QueryExecutor, SqlExecutor};
use crate::session::{InMemorySessionStore, SessionStore};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<ConnectionLifecycle>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub executor: Arc<dyn QueryExecutor>,
    pub analysis: AnalysisJobManager,
    /// Cancelled on shutdown; in-flight turns observe it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wires the services around one in-memory session store.
    pub fn new(
        connector: Arc<dyn Connector>,
        knowledge: Arc<dyn KnowledgeStore>,
        llm: Option<Arc<dyn LlmClient>>,
        config: &Config,
    ) -> Self {
        let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let lifecycle = Arc::new(ConnectionLifecycle::new(
            connector,
            Arc::clone(&sessions),
            config.session.idle_timeout(),
        ));
        let context: Arc<dyn ContextSource> = Arc::new(LiveContextSource::new(
            Arc::clone(&lifecycle),
            Arc::clone(&knowledge),
        ));
        let executor: Arc<dyn QueryExecutor> = Arc::new(SqlExecutor::new(Arc::clone(&lifecycle)));

        let orchestrator = ChatOrchestrator::new(
            Arc::clone(&sessions),
            Arc::clone(&context),
            llm.clone(),
            Arc::clone(&executor),
        )
        .with_ai_timeout(config.llm.timeout());

        let worker = Arc::new(LlmAnalysisWorker::new(llm, context));
        let analysis = AnalysisJobManager::new(worker, knowledge, sessions)
            .with_retention(config.analysis.retention());
        lifecycle.add_listener(Arc::new(analysis.clone()));

        Self {
            lifecycle,
            orchestrator: Arc::new(orchestrator),
            executor,
            analysis,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Builds the router with every endpoint.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/query", post(handlers::query))
        .route("/query/execute", post(handlers::execute))
        .route("/query/validate", post(handlers::validate))
        .route("/connections/connect", post(handlers::connect))
        .route("/connections/disconnect", post(handlers::disconnect))
        .route("/connections/health/:session_id", get(handlers::check_health))
        .route("/analysis/start", post(handlers::start_analysis))
        .route("/analysis/status/:session_id", get(handlers::analysis_status))
        .route("/analysis/cancel/:session_id", post(handlers::cancel_analysis))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until the state's shutdown token is cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let addr = listener
        .local_addr()
        .map_err(|e| CopilotError::internal(format!("Listener has no address: {e}")))?;
    info!(%addr, "Listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| CopilotError::internal(format!("Server error: {e}")))
}
