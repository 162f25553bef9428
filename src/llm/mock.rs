//! Mock LLM client for tests and offline runs.
//!
//! Answers from a pattern table matched against the last user message.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{CopilotError, Result};
use crate::llm::types::{Message, Role};
use crate::llm::LlmClient;

/// Deterministic completion client.
///
/// Clones share counters and switches, so a test can keep a handle after
/// moving the client into the system under test.
#[derive(Debug, Clone)]
pub struct MockLlmClient {
    responses: Vec<(String, String)>,
    delay: Option<Duration>,
    state: Arc<MockState>,
}

#[derive(Debug)]
struct MockState {
    available: AtomicBool,
    failing: AtomicBool,
    calls: AtomicUsize,
    last_messages: Mutex<Vec<Message>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            responses: Vec::new(),
            delay: None,
            state: Arc::new(MockState {
                available: AtomicBool::new(true),
                failing: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                last_messages: Mutex::new(Vec::new()),
            }),
        }
    }

    /// When the last user message contains `pattern`, answer `response`.
    ///
    /// Patterns are checked in insertion order, case-insensitively.
    pub fn with_response(mut self, pattern: impl Into<String>, response: impl Into<String>) -> Self {
        self.responses.push((pattern.into(), response.into()));
        self
    }

    /// Sleeps before answering, to exercise timeouts and cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Controls what `is_available` reports.
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Makes every completion fail with a transport-style error.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Messages of the most recent completion call.
    pub fn last_messages(&self) -> Vec<Message> {
        self.state
            .last_messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    fn answer(&self, input: &str) -> String {
        let lower = input.to_lowercase();

        if let Some((_, response)) = self
            .responses
            .iter()
            .find(|(pattern, _)| lower.contains(&pattern.to_lowercase()))
        {
            return response.clone();
        }

        if lower.contains("all users") || lower.contains("show users") {
            return r#"{"sql": "SELECT * FROM users LIMIT 100", "explanation": "Lists users."}"#
                .to_string();
        }
        if lower.contains("count") && lower.contains("users") {
            return r#"{"sql": "SELECT COUNT(*) AS total FROM users", "explanation": "Counts users."}"#
                .to_string();
        }

        "I don't understand that question. Could you please rephrase it?".to_string()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message], _model: Option<&str>) -> Result<String> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.state.last_messages.lock() {
            *last = messages.to_vec();
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.state.failing.load(Ordering::SeqCst) {
            return Err(CopilotError::llm("Mock backend failure"));
        }

        let input = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(self.answer(input))
    }

    async fn is_available(&self) -> bool {
        self.state.available.load(Ordering::SeqCst)
    }
}
