//! Analysis jobs end to end: phases, cancellation, knowledge refresh.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use db_copilot::analysis::{
    AnalysisJobManager, AnalysisPhase, AnalysisStatus, AnalysisWorker, PhaseLog, PhaseOutput,
    COMPLETE_MARKER, FAILURE_MARKER, TERMINAL_PHASE,
};
use db_copilot::chat::{ChatOrchestrator, ChatRequest, StaticContextSource};
use db_copilot::connection::{ConnectionLifecycle, MockConnector};
use db_copilot::db::{MockDatabaseClient, ReadOnlyStatus, Schema, Table};
use db_copilot::error::Result;
use db_copilot::knowledge::{
    ColumnExplanation, InMemoryKnowledgeStore, KnowledgeBase, KnowledgeStore, SqlExample,
};
use db_copilot::llm::MockLlmClient;
use db_copilot::query::SqlExecutor;
use db_copilot::session::{InMemorySessionStore, SessionStore};

/// Returns fixed artifacts; optionally parks forever in one phase.
#[derive(Default)]
struct FixedWorker {
    park_in: Option<AnalysisPhase>,
    started: Mutex<Vec<AnalysisPhase>>,
    parked: Notify,
}

impl FixedWorker {
    fn parking_in(phase: AnalysisPhase) -> Self {
        Self {
            park_in: Some(phase),
            ..Default::default()
        }
    }

    fn started(&self) -> Vec<AnalysisPhase> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnalysisWorker for FixedWorker {
    async fn run_phase(
        &self,
        phase: AnalysisPhase,
        _connection_id: i64,
        log: &PhaseLog,
    ) -> Result<PhaseOutput> {
        self.started.lock().unwrap().push(phase);
        log.append("working");

        if self.park_in == Some(phase) {
            self.parked.notify_one();
            std::future::pending::<()>().await;
        }

        Ok(match phase {
            AnalysisPhase::Tables => PhaseOutput::Tables(BTreeMap::from([(
                "users".to_string(),
                "People who signed up".to_string(),
            )])),
            AnalysisPhase::Columns => PhaseOutput::Columns(vec![ColumnExplanation {
                table: "users".to_string(),
                column: "email".to_string(),
                explanation: "Login address".to_string(),
            }]),
            AnalysisPhase::Examples => PhaseOutput::Examples(vec![SqlExample {
                question: "How many users?".to_string(),
                sql: "SELECT COUNT(*) FROM users".to_string(),
            }]),
        })
    }
}

struct Fixture {
    manager: AnalysisJobManager,
    worker: Arc<FixedWorker>,
    knowledge: Arc<InMemoryKnowledgeStore>,
    sessions: Arc<dyn SessionStore>,
    session_id: String,
}

fn fixture(worker: FixedWorker) -> Fixture {
    let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let knowledge = Arc::new(InMemoryKnowledgeStore::new());
    let worker = Arc::new(worker);
    let manager = AnalysisJobManager::new(worker.clone(), knowledge.clone(), sessions.clone());
    let session = sessions.create_connection_session(1, ReadOnlyStatus::ReadWrite);
    Fixture {
        manager,
        worker,
        knowledge,
        sessions,
        session_id: session.id,
    }
}

async fn wait_terminal(manager: &AnalysisJobManager, session_id: &str) -> AnalysisStatus {
    for _ in 0..100 {
        let status = manager.status(session_id);
        if status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("analysis never reached a terminal phase");
}

#[tokio::test]
async fn test_three_phases_commit_knowledge() {
    let f = fixture(FixedWorker::default());
    let started = f.manager.start(&f.session_id).unwrap();
    assert!(started.found);

    let status = wait_terminal(&f.manager, &f.session_id).await;
    assert_eq!(status.current_phase, TERMINAL_PHASE);
    assert!(!status.phases.has_failure());
    for phase in AnalysisPhase::ALL {
        assert!(status.phases.get(phase).contains(COMPLETE_MARKER));
    }

    let kb = f.knowledge.load(1).await.unwrap();
    assert_eq!(kb.table_explanations["users"], "People who signed up");
    assert_eq!(kb.column_explanations.len(), 1);
    assert_eq!(kb.sql_examples[0].sql, "SELECT COUNT(*) FROM users");
}

#[tokio::test]
async fn test_cancel_mid_phase_two() {
    let f = fixture(FixedWorker::parking_in(AnalysisPhase::Columns));
    f.manager.start(&f.session_id).unwrap();
    f.worker.parked.notified().await;

    assert!(f.manager.cancel(&f.session_id));

    let status = f.manager.status(&f.session_id);
    assert_eq!(status.current_phase, TERMINAL_PHASE);
    assert_eq!(status.cancelled, Some(true));
    assert!(status.phases.phase2.contains(FAILURE_MARKER));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        f.worker.started(),
        vec![AnalysisPhase::Tables, AnalysisPhase::Columns]
    );
    assert!(f.manager.status(&f.session_id).phases.phase3.is_empty());

    let kb = f.knowledge.load(1).await.unwrap();
    assert_eq!(kb.table_explanations.len(), 1);
    assert!(kb.column_explanations.is_empty());
}

#[tokio::test]
async fn test_second_start_joins_running_job() {
    let f = fixture(FixedWorker::parking_in(AnalysisPhase::Tables));
    f.manager.start(&f.session_id).unwrap();
    f.worker.parked.notified().await;

    let again = f.manager.start(&f.session_id).unwrap();
    assert_eq!(again.current_phase, 1);
    assert_eq!(f.worker.started(), vec![AnalysisPhase::Tables]);
    f.manager.shutdown();
}

#[tokio::test]
async fn test_completion_refreshes_cached_knowledge() {
    let f = fixture(FixedWorker::default());

    let connector = MockConnector::new().with_client(1, MockDatabaseClient::demo());
    let lifecycle = Arc::new(ConnectionLifecycle::new(
        Arc::new(connector),
        f.sessions.clone(),
        Duration::from_secs(600),
    ));
    let context = StaticContextSource::new(
        Schema::with_tables(vec![Table::new("users")]),
        KnowledgeBase::default(),
    );
    let orchestrator = ChatOrchestrator::new(
        f.sessions.clone(),
        Arc::new(context.clone()),
        Some(Arc::new(MockLlmClient::new())),
        Arc::new(SqlExecutor::new(lifecycle)),
    );
    let cancel = CancellationToken::new();
    let request = |chat: Option<String>| ChatRequest {
        connection_session_id: Some(f.session_id.clone()),
        chat_session_id: chat,
        natural_language: "show all users".to_string(),
        ..Default::default()
    };

    let first = orchestrator.ask(request(None), &cancel).await;
    let chat_id = first.chat_session_id.clone();
    assert!(f.sessions.get_cache_knowledge_base(&f.session_id).is_some());

    f.manager.start(&f.session_id).unwrap();
    wait_terminal(&f.manager, &f.session_id).await;
    assert!(f.sessions.get_cache_knowledge_base(&f.session_id).is_none());
    assert!(f.sessions.get_cache_schema(&f.session_id).is_some());

    let next = orchestrator.ask(request(chat_id), &cancel).await;
    assert!(next.follow_up);
    assert_eq!(context.schema_fetches(), 1);
    assert_eq!(context.knowledge_fetches(), 2);
}

#[tokio::test]
async fn test_disconnect_cancels_running_job() {
    let f = fixture(FixedWorker::parking_in(AnalysisPhase::Tables));
    let lifecycle = ConnectionLifecycle::new(
        Arc::new(MockConnector::new().with_client(1, MockDatabaseClient::demo())),
        f.sessions.clone(),
        Duration::from_secs(600),
    );
    lifecycle.add_listener(Arc::new(f.manager.clone()));

    f.manager.start(&f.session_id).unwrap();
    f.worker.parked.notified().await;
    assert!(lifecycle.disconnect(&f.session_id).await);

    let status = f.manager.status(&f.session_id);
    assert!(status.found);
    assert_eq!(status.current_phase, TERMINAL_PHASE);
    assert_eq!(status.cancelled, Some(true));
    assert!(status.phases.phase1.contains(FAILURE_MARKER));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.worker.started(), vec![AnalysisPhase::Tables]);
    assert!(f.knowledge.load(1).await.unwrap().table_explanations.is_empty());
}
