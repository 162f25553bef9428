//! Full stack against a real PostgreSQL database.
//!
//! Skips unless DATABASE_URL is set.

use serde_json::json;
use std::sync::Arc;

use db_copilot::config::{Config, ConnectionConfig};
use db_copilot::connection::ConfigConnector;
use db_copilot::knowledge::InMemoryKnowledgeStore;
use db_copilot::server::{build_router, AppState};

use super::common::{get_json, post_json};

fn test_state() -> Option<AppState> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let connection = ConnectionConfig::from_connection_string(1, &url).ok()?;
    Some(AppState::new(
        Arc::new(ConfigConnector::new([connection])),
        Arc::new(InMemoryKnowledgeStore::new()),
        None,
        &Config::default(),
    ))
}

#[tokio::test]
async fn test_connect_execute_disconnect() {
    let Some(state) = test_state() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let router = build_router(state.clone());

    let (_, connected) = post_json(&router, "/connections/connect", json!({ "connectionId": 1 })).await;
    assert_eq!(connected["success"], true, "{connected}");
    let session = connected["sessionId"].as_str().unwrap().to_string();

    let (_, executed) = post_json(
        &router,
        "/query/execute",
        json!({ "connectionSessionId": session, "sql": "SELECT 1::int4 AS num" }),
    )
    .await;
    assert_eq!(executed["success"], true, "{executed}");
    assert_eq!(executed["data"]["data"][0]["num"], 1);
    assert_eq!(executed["data"]["columns"][0]["name"], "num");

    let (_, health) = get_json(&router, &format!("/connections/health/{session}")).await;
    assert_eq!(health["success"], true);

    post_json(&router, "/connections/disconnect", json!({ "sessionId": session })).await;
    state.lifecycle.shutdown().await;
}

#[tokio::test]
async fn test_database_error_is_surfaced_with_sql() {
    let Some(state) = test_state() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let router = build_router(state.clone());

    let (_, body) = post_json(
        &router,
        "/query/execute",
        json!({ "connectionId": 1, "sql": "SELECT * FROM nonexistent_table_xyz" }),
    )
    .await;
    assert_eq!(body["success"], false);
    assert_eq!(body["errorCode"], "EXECUTION_ERROR");
    assert_eq!(body["sql"], "SELECT * FROM nonexistent_table_xyz");
    assert!(body["error"].as_str().unwrap().contains("does not exist"));
    state.lifecycle.shutdown().await;
}
