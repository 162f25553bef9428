//! Chat pipeline behaviour across turns.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use db_copilot::chat::{ChatOrchestrator, ChatRequest, StaticContextSource};
use db_copilot::connection::{ConnectionLifecycle, MockConnector};
use db_copilot::db::{MockDatabaseClient, ReadOnlyStatus, Schema, Table};
use db_copilot::error::ErrorCode;
use db_copilot::knowledge::KnowledgeBase;
use db_copilot::llm::MockLlmClient;
use db_copilot::query::SqlExecutor;
use db_copilot::session::{InMemorySessionStore, SessionStore};

struct Fixture {
    orchestrator: Arc<ChatOrchestrator>,
    context: StaticContextSource,
    llm: MockLlmClient,
    sessions: Arc<dyn SessionStore>,
    session_id: String,
}

fn fixture(llm: MockLlmClient) -> Fixture {
    let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let connector = MockConnector::new().with_client(1, MockDatabaseClient::demo());
    let lifecycle = Arc::new(ConnectionLifecycle::new(
        Arc::new(connector),
        sessions.clone(),
        Duration::from_secs(600),
    ));
    let context = StaticContextSource::new(
        Schema::with_tables(vec![Table::new("users"), Table::new("orders")]),
        KnowledgeBase::default(),
    );
    let orchestrator = ChatOrchestrator::new(
        sessions.clone(),
        Arc::new(context.clone()),
        Some(Arc::new(llm.clone())),
        Arc::new(SqlExecutor::new(lifecycle)),
    );
    let session = sessions.create_connection_session(1, ReadOnlyStatus::ReadWrite);

    Fixture {
        orchestrator: Arc::new(orchestrator),
        context,
        llm,
        sessions,
        session_id: session.id,
    }
}

fn ask(session_id: &str, chat_id: Option<&str>, question: &str) -> ChatRequest {
    ChatRequest {
        connection_session_id: Some(session_id.to_string()),
        chat_session_id: chat_id.map(str::to_string),
        natural_language: question.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_follow_ups_use_cached_context() {
    let f = fixture(MockLlmClient::new());
    let cancel = CancellationToken::new();

    let first = f
        .orchestrator
        .ask(ask(&f.session_id, None, "show all users"), &cancel)
        .await;
    assert!(first.success, "{:?}", first.error);
    assert!(!first.follow_up);
    let chat_id = first.chat_session_id.clone().unwrap();

    for question in ["count users", "show all users", "count users"] {
        let next = f
            .orchestrator
            .ask(ask(&f.session_id, Some(&chat_id), question), &cancel)
            .await;
        assert!(next.success);
        assert!(next.follow_up);
        assert_eq!(next.chat_session_id.as_deref(), Some(chat_id.as_str()));
    }

    assert_eq!(f.context.schema_fetches(), 1);
    assert_eq!(f.context.knowledge_fetches(), 1);
}

#[tokio::test]
async fn test_failed_first_turn_keeps_chat_fresh() {
    let f = fixture(MockLlmClient::new());
    let cancel = CancellationToken::new();

    let failed = f
        .orchestrator
        .ask(ask(&f.session_id, None, "tell me a joke"), &cancel)
        .await;
    assert_eq!(failed.error_code, Some(ErrorCode::NoSqlGenerated));
    let chat_id = failed.chat_session_id.clone().unwrap();

    let next = f
        .orchestrator
        .ask(ask(&f.session_id, Some(&chat_id), "show all users"), &cancel)
        .await;
    assert!(next.success);
    assert!(!next.follow_up);
}

#[tokio::test]
async fn test_new_chat_does_not_inherit_follow_up() {
    let f = fixture(MockLlmClient::new());
    let cancel = CancellationToken::new();

    let first = f
        .orchestrator
        .ask(ask(&f.session_id, None, "show all users"), &cancel)
        .await;
    assert!(first.success);

    let other = f
        .orchestrator
        .ask(ask(&f.session_id, None, "show all users"), &cancel)
        .await;
    assert!(!other.follow_up);
    assert_ne!(other.chat_session_id, first.chat_session_id);
}

#[tokio::test]
async fn test_turns_on_one_chat_run_one_at_a_time() {
    let f = fixture(MockLlmClient::new().with_delay(Duration::from_millis(150)));
    let cancel = CancellationToken::new();

    let first = f
        .orchestrator
        .ask(ask(&f.session_id, None, "show all users"), &cancel)
        .await;
    let chat_id = first.chat_session_id.unwrap();

    let started = Instant::now();
    let a = {
        let orchestrator = f.orchestrator.clone();
        let request = ask(&f.session_id, Some(&chat_id), "count users");
        tokio::spawn(async move {
            orchestrator
                .ask(request, &CancellationToken::new())
                .await
        })
    };
    let b = {
        let orchestrator = f.orchestrator.clone();
        let request = ask(&f.session_id, Some(&chat_id), "show all users");
        tokio::spawn(async move {
            orchestrator
                .ask(request, &CancellationToken::new())
                .await
        })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert!(a.success && b.success);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(f.llm.call_count(), 3);
    assert_eq!(f.sessions.history(&chat_id).len(), 3);
}

#[tokio::test]
async fn test_cancelled_turn_never_reaches_the_ai() {
    let f = fixture(MockLlmClient::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let response = f
        .orchestrator
        .ask(ask(&f.session_id, None, "show all users"), &cancel)
        .await;
    assert!(!response.success);
    assert_eq!(response.error_code, None);
    assert_eq!(f.llm.call_count(), 0);
}

#[tokio::test]
async fn test_cancel_during_ai_call() {
    let f = fixture(MockLlmClient::new().with_delay(Duration::from_secs(5)));
    let cancel = CancellationToken::new();

    let pending = {
        let orchestrator = f.orchestrator.clone();
        let request = ask(&f.session_id, None, "show all users");
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.ask(request, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let response = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(!response.success);
    assert_eq!(f.llm.call_count(), 1);
}

#[tokio::test]
async fn test_schema_failure_degrades_to_minimal_prompt() {
    let f = fixture(MockLlmClient::new());
    f.context.set_failing(true);

    let response = f
        .orchestrator
        .ask(ask(&f.session_id, None, "show all users"), &CancellationToken::new())
        .await;
    assert!(response.success);

    let system = &f.llm.last_messages()[0].content;
    assert!(!system.contains("Table: users"));
}
