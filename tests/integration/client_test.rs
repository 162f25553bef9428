//! Client SDK against a live server on a loopback port.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use db_copilot::chat::ChatRequest;
use db_copilot::client::{
    AnalysisWatcher, CopilotBackend, HealthMonitor, HttpBackend, LossSignal, MonitorEvent,
    QuerySlot, SlotOutcome, WatchEvent,
};
use db_copilot::db::ReadOnlyStatus;
use db_copilot::error::ErrorCode;
use db_copilot::server::serve;

use super::common::{Harness, CONNECTION_ID};

/// Serves the harness and returns a backend pointed at it.
async fn spawn_server(h: &Harness) -> Arc<HttpBackend> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = h.state.clone();
    tokio::spawn(async move {
        let _ = serve(listener, state).await;
    });
    Arc::new(HttpBackend::new(&format!("http://{addr}")).unwrap())
}

fn question(session_id: &str, text: &str) -> ChatRequest {
    ChatRequest {
        connection_session_id: Some(session_id.to_string()),
        natural_language: text.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_connect_query_disconnect() {
    let h = Harness::new();
    let backend = spawn_server(&h).await;

    let connected = backend.connect(CONNECTION_ID).await.unwrap();
    assert!(connected.success);
    assert_eq!(connected.read_only_status, ReadOnlyStatus::ReadWrite);
    let session_id = connected.session_id.unwrap();

    let response = backend
        .query(&question(&session_id, "show all users"))
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(
        response.data.unwrap().sql,
        "SELECT * FROM users LIMIT 100"
    );

    assert!(backend.check_health(&session_id).await.unwrap().success);
    backend.disconnect(&session_id).await.unwrap();
    let check = backend.check_health(&session_id).await.unwrap();
    assert_eq!(check.error_code, Some(ErrorCode::InvalidSession));
    h.state.shutdown.cancel();
}

#[tokio::test]
async fn test_bad_request_surfaces_as_error() {
    let h = Harness::new();
    let backend = spawn_server(&h).await;

    let err = backend.query(&question("s", "  ")).await.unwrap_err();
    assert!(err.to_string().contains("naturalLanguage"));
    h.state.shutdown.cancel();
}

#[tokio::test]
async fn test_expired_session_is_reported_once() {
    let h = Harness::new();
    let backend = spawn_server(&h).await;
    let session_id = backend.connect(CONNECTION_ID).await.unwrap().session_id.unwrap();

    let (monitor, mut events) = HealthMonitor::with_timings(
        backend.clone(),
        Duration::from_secs(60),
        Duration::from_secs(5),
        Duration::from_millis(200),
    );
    monitor.set_session(session_id.clone());

    // The service forgets the session behind the UI's back.
    h.state.lifecycle.disconnect(&session_id).await;

    let slot = QuerySlot::new(backend.clone());
    let SlotOutcome::Completed(response) = slot.send(question(&session_id, "show all users")).await
    else {
        panic!("query did not complete");
    };
    assert_eq!(response.error_code, Some(ErrorCode::InvalidSession));
    monitor.report_query_error(response.error_code);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        MonitorEvent::ConnectionLost {
            session_id: session_id.clone(),
            signal: LossSignal::QueryError,
        }
    );

    // A poll that raced the query must not produce a second notice.
    assert!(!monitor.handle_connection_lost(LossSignal::HealthPoll, &session_id));
    assert!(events.try_recv().is_err());
    assert!(!monitor.is_polling());
    h.state.shutdown.cancel();
}

#[tokio::test]
async fn test_poll_detects_dead_link() {
    let h = Harness::new();
    let backend = spawn_server(&h).await;
    let session_id = backend.connect(CONNECTION_ID).await.unwrap().session_id.unwrap();

    let (monitor, mut events) = HealthMonitor::with_timings(
        backend.clone(),
        Duration::from_millis(30),
        Duration::from_secs(5),
        Duration::from_millis(200),
    );
    monitor.set_session(session_id.clone());
    h.db.set_alive(false);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        MonitorEvent::ConnectionLost {
            signal: LossSignal::HealthPoll,
            ..
        }
    ));
    assert_eq!(monitor.session_id(), None);
    h.state.shutdown.cancel();
}

#[tokio::test]
async fn test_user_disconnect_is_silent() {
    let h = Harness::new();
    let backend = spawn_server(&h).await;
    let session_id = backend.connect(CONNECTION_ID).await.unwrap().session_id.unwrap();

    let (monitor, mut events) = HealthMonitor::with_timings(
        backend.clone(),
        Duration::from_millis(30),
        Duration::from_secs(5),
        Duration::from_millis(200),
    );
    monitor.set_session(session_id.clone());
    monitor.disconnect().await;

    let response = backend
        .query(&question(&session_id, "show all users"))
        .await
        .unwrap();
    monitor.report_query_error(response.error_code);
    monitor.clear_session();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(events.try_recv().is_err());
    assert!(h.state.lifecycle.sessions().connection_session(&session_id).is_none());
    h.state.shutdown.cancel();
}

#[tokio::test]
async fn test_watch_failed_analysis() {
    let h = Harness::without_ai();
    let backend = spawn_server(&h).await;
    let session_id = backend.connect(CONNECTION_ID).await.unwrap().session_id.unwrap();

    let (_watcher, mut events) =
        AnalysisWatcher::start(backend.clone(), &session_id, Duration::from_millis(20))
            .await
            .unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(WatchEvent::Progress(_)) => continue,
                other => return other,
            }
        }
    })
    .await
    .unwrap();
    let status = match finished {
        Some(WatchEvent::Finished(status)) => status,
        other => panic!("expected a finished event, got {other:?}"),
    };
    assert!(status.phases.has_failure());
    h.state.shutdown.cancel();
}

#[tokio::test]
async fn test_start_analysis_for_unknown_session() {
    let h = Harness::new();
    let backend = spawn_server(&h).await;
    let result = AnalysisWatcher::start(backend, "nope", Duration::from_millis(20)).await;
    assert!(result.is_err());
    h.state.shutdown.cancel();
}
