//! Shared fixtures: a mock-backed service and HTTP helpers.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

use db_copilot::config::Config;
use db_copilot::connection::MockConnector;
use db_copilot::db::MockDatabaseClient;
use db_copilot::knowledge::InMemoryKnowledgeStore;
use db_copilot::llm::{LlmClient, MockLlmClient};
use db_copilot::server::{build_router, AppState};

pub const CONNECTION_ID: i64 = 1;

/// A service wired to mocks, with handles kept for inspection.
pub struct Harness {
    pub state: AppState,
    pub db: MockDatabaseClient,
    pub llm: MockLlmClient,
    pub knowledge: Arc<InMemoryKnowledgeStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(true)
    }

    /// No AI backend at all; questions go through the template matcher.
    pub fn without_ai() -> Self {
        Self::build(false)
    }

    fn build(with_ai: bool) -> Self {
        let db = MockDatabaseClient::demo();
        let llm = MockLlmClient::new();
        let knowledge = Arc::new(InMemoryKnowledgeStore::new());
        let connector = MockConnector::new().with_client(CONNECTION_ID, db.clone());
        let ai: Option<Arc<dyn LlmClient>> = if with_ai {
            Some(Arc::new(llm.clone()))
        } else {
            None
        };

        let state = AppState::new(
            Arc::new(connector),
            knowledge.clone(),
            ai,
            &Config::default(),
        );
        Self {
            state,
            db,
            llm,
            knowledge,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Opens a connection session and returns its id.
    pub async fn connect(&self) -> String {
        let (status, body) = post_json(
            &self.router(),
            "/connections/connect",
            serde_json::json!({ "connectionId": CONNECTION_ID }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true, "connect failed: {body}");
        body["sessionId"].as_str().unwrap().to_string()
    }
}

pub async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn post_json(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    post_raw(router, uri, body.to_string()).await
}

pub async fn post_raw(router: &Router, uri: &str, body: String) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    (status, body_json(response).await)
}

pub async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    (status, body_json(response).await)
}
