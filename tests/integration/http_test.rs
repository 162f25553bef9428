//! HTTP surface tests, driven through the router in-process.

use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

use super::common::{get_json, post_json, post_raw, Harness, CONNECTION_ID};

#[tokio::test]
async fn test_health() {
    let h = Harness::new();
    let (status, body) = get_json(&h.router(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_malformed_body_is_400() {
    let h = Harness::new();
    let (status, body) = post_raw(&h.router(), "/query", "{not json".to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["errorCode"], "INVALID_REQUEST");

    let (status, body) = post_json(&h.router(), "/query", json!({ "connectionId": 1 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorCode"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_empty_question_is_400() {
    let h = Harness::new();
    let (status, body) = post_json(
        &h.router(),
        "/query",
        json!({ "connectionId": 1, "naturalLanguage": "   " }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errorCode"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_connect_reports_session_and_read_only_status() {
    let h = Harness::new();
    let (status, body) = post_json(
        &h.router(),
        "/connections/connect",
        json!({ "connectionId": CONNECTION_ID }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["sessionId"].as_str().is_some_and(|s| !s.is_empty()));
    assert_eq!(body["readOnlyStatus"], "readwrite");
}

#[tokio::test]
async fn test_connect_unknown_connection() {
    let h = Harness::new();
    let (_, body) = post_json(&h.router(), "/connections/connect", json!({ "connectionId": 99 })).await;
    assert_eq!(body["success"], false);
    assert!(body.get("sessionId").is_none());
    assert!(body["error"].as_str().unwrap().contains("99"));
}

#[tokio::test]
async fn test_query_then_follow_up_reuses_context() {
    let h = Harness::new();
    let session = h.connect().await;
    let router = h.router();

    let (_, first) = post_json(
        &router,
        "/query",
        json!({ "connectionSessionId": session, "naturalLanguage": "show all users" }),
    )
    .await;
    assert_eq!(first["success"], true, "{first}");
    assert_eq!(first["data"]["sql"], "SELECT * FROM users LIMIT 100");
    assert_eq!(first["data"]["rowCount"], 1);
    assert_eq!(first["explanation"], "Lists users.");
    let chat_id = first["chatSessionId"].as_str().unwrap().to_string();
    assert_eq!(h.db.introspection_count(), 1);

    let (_, second) = post_json(
        &router,
        "/query",
        json!({
            "connectionSessionId": session,
            "chatSessionId": chat_id,
            "naturalLanguage": "count the users",
        }),
    )
    .await;
    assert_eq!(second["success"], true, "{second}");
    assert_eq!(second["chatSessionId"], chat_id.as_str());
    assert_eq!(second["data"]["sql"], "SELECT COUNT(*) AS total FROM users");
    assert_eq!(h.db.introspection_count(), 1);
}

#[tokio::test]
async fn test_unknown_chat_session_gets_new_id() {
    let h = Harness::new();
    let session = h.connect().await;

    let (_, body) = post_json(
        &h.router(),
        "/query",
        json!({
            "connectionSessionId": session,
            "chatSessionId": "does-not-exist",
            "naturalLanguage": "show all users",
        }),
    )
    .await;
    assert_eq!(body["success"], true);
    let chat_id = body["chatSessionId"].as_str().unwrap();
    assert_ne!(chat_id, "does-not-exist");
    assert!(!chat_id.is_empty());
}

#[tokio::test]
async fn test_query_with_unknown_session() {
    let h = Harness::new();
    let (status, body) = post_json(
        &h.router(),
        "/query",
        json!({ "connectionSessionId": "gone", "naturalLanguage": "show all users" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["errorCode"], "INVALID_SESSION");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_query_without_connection() {
    let h = Harness::new();
    let (_, body) = post_json(&h.router(), "/query", json!({ "naturalLanguage": "show all users" })).await;
    assert_eq!(body["errorCode"], "MISSING_CONNECTION");
}

#[tokio::test]
async fn test_legacy_connection_id_path() {
    let h = Harness::new();
    let (_, body) = post_json(
        &h.router(),
        "/query",
        json!({ "connectionId": CONNECTION_ID, "naturalLanguage": "show all users" }),
    )
    .await;
    assert_eq!(body["success"], true, "{body}");
    assert_eq!(body["data"]["sql"], "SELECT * FROM users LIMIT 100");
}

#[tokio::test]
async fn test_unanswerable_question_without_sql() {
    let h = Harness::new();
    let session = h.connect().await;
    let (_, body) = post_json(
        &h.router(),
        "/query",
        json!({ "connectionSessionId": session, "naturalLanguage": "what is the meaning of life" }),
    )
    .await;
    assert_eq!(body["success"], false);
    assert_eq!(body["errorCode"], "NO_SQL_GENERATED");
    assert!(body["chatSessionId"].is_string());
}

#[tokio::test]
async fn test_fallback_when_ai_unavailable() {
    let h = Harness::new();
    h.llm.set_available(false);
    let session = h.connect().await;

    let (_, body) = post_json(
        &h.router(),
        "/query",
        json!({ "connectionSessionId": session, "naturalLanguage": "show me count records by table" }),
    )
    .await;
    assert_eq!(body["success"], true, "{body}");
    assert_eq!(
        body["data"]["sql"],
        "SELECT 'users' as table_name, COUNT(*) as record_count FROM users\nUNION ALL\nSELECT 'orders' as table_name, COUNT(*) as record_count FROM orders\nORDER BY record_count DESC;"
    );
    assert_eq!(body["data"]["visualization"]["type"], "bar");
    assert_eq!(h.llm.call_count(), 0);
}

#[tokio::test]
async fn test_no_ai_and_no_pattern() {
    let h = Harness::without_ai();
    let session = h.connect().await;
    let (_, body) = post_json(
        &h.router(),
        "/query",
        json!({ "connectionSessionId": session, "naturalLanguage": "why is the sky blue" }),
    )
    .await;
    assert_eq!(body["errorCode"], "COPILOT_UNAVAILABLE");
}

#[tokio::test]
async fn test_execute_rejects_writes() {
    let h = Harness::new();
    let session = h.connect().await;
    let (_, body) = post_json(
        &h.router(),
        "/query/execute",
        json!({ "connectionSessionId": session, "sql": "DELETE FROM users" }),
    )
    .await;
    assert_eq!(body["success"], false);
    assert_eq!(body["errorCode"], "UNSAFE_SQL");
    assert_eq!(body["sql"], "DELETE FROM users");
    assert!(h.db.executed().is_empty());
}

#[tokio::test]
async fn test_execute_select() {
    let h = Harness::new();
    let session = h.connect().await;
    let (_, body) = post_json(
        &h.router(),
        "/query/execute",
        json!({ "connectionSessionId": session, "sql": "SELECT 1" }),
    )
    .await;
    assert_eq!(body["success"], true, "{body}");
    assert_eq!(body["data"]["sql"], "SELECT 1");
    assert!(body.get("chatSessionId").is_none());
    assert!(body.get("explanation").is_none());
    assert_eq!(h.db.executed(), vec!["SELECT 1".to_string()]);
}

#[tokio::test]
async fn test_execute_with_invalid_session_keeps_sql() {
    let h = Harness::new();
    let (_, body) = post_json(
        &h.router(),
        "/query/execute",
        json!({ "connectionSessionId": "gone", "sql": "SELECT 1" }),
    )
    .await;
    assert_eq!(body["errorCode"], "INVALID_SESSION");
    assert_eq!(body["sql"], "SELECT 1");
}

#[tokio::test]
async fn test_validate() {
    let h = Harness::new();
    let router = h.router();

    let (_, ok) = post_json(&router, "/query/validate", json!({ "sql": "SELECT * FROM users" })).await;
    assert_eq!(ok, json!({ "success": true, "data": { "valid": true } }));

    let (_, bad) = post_json(&router, "/query/validate", json!({ "sql": "DROP TABLE users" })).await;
    assert_eq!(bad["data"]["valid"], false);
    assert_eq!(bad["data"]["errorCode"], "UNSAFE_SQL");
}

#[tokio::test]
async fn test_disconnect_invalidates_session() {
    let h = Harness::new();
    let session = h.connect().await;
    let router = h.router();

    let (_, health) = get_json(&router, &format!("/connections/health/{session}")).await;
    assert_eq!(health, json!({ "success": true }));

    let (_, body) = post_json(&router, "/connections/disconnect", json!({ "sessionId": session })).await;
    assert_eq!(body["success"], true);

    let (_, health) = get_json(&router, &format!("/connections/health/{session}")).await;
    assert_eq!(health, json!({ "success": false, "errorCode": "INVALID_SESSION" }));
}

#[tokio::test]
async fn test_dead_link_fails_health_check() {
    let h = Harness::new();
    let session = h.connect().await;
    h.db.set_alive(false);

    let (_, health) = get_json(&h.router(), &format!("/connections/health/{session}")).await;
    assert_eq!(health["errorCode"], "INVALID_SESSION");
    assert!(h.state.lifecycle.sessions().connection_session(&session).is_none());
}

#[tokio::test]
async fn test_analysis_without_ai_ends_in_failure() {
    let h = Harness::without_ai();
    let session = h.connect().await;
    let router = h.router();

    let (_, started) = post_json(
        &router,
        "/analysis/start",
        json!({ "connectionSessionId": session }),
    )
    .await;
    assert_eq!(started["success"], true, "{started}");
    assert_eq!(started["data"]["found"], true);

    let status_uri = format!("/analysis/status/{session}");
    let mut status = serde_json::Value::Null;
    for _ in 0..50 {
        let (_, body) = get_json(&router, &status_uri).await;
        if body["currentPhase"] == 4 {
            status = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status["currentPhase"], 4, "job never finished");
    assert!(status["phases"]["phase1"].as_str().unwrap().contains("[failed]"));
    assert_eq!(status["phases"]["phase2"], "");

    let (_, cancelled) = post_json(&router, &format!("/analysis/cancel/{session}"), json!(null)).await;
    assert_eq!(cancelled["success"], false);
}

#[tokio::test]
async fn test_analysis_with_unknown_session() {
    let h = Harness::new();
    let router = h.router();

    let (_, body) = post_json(&router, "/analysis/start", json!({ "connectionSessionId": "nope" })).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["errorCode"], "INVALID_SESSION");

    let (_, status) = get_json(&router, "/analysis/status/nope").await;
    assert_eq!(status["found"], false);
}
