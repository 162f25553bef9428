//! Scriptable backend for UI-side tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::CopilotBackend;
use crate::analysis::AnalysisStatus;
use crate::chat::{ChatRequest, ChatResponse};
use crate::connection::HealthCheck;
use crate::db::ReadOnlyStatus;
use crate::error::{CopilotError, Result};
use crate::server::{ConnectResponse, StartAnalysisResponse};

/// In-process backend with canned answers.
///
/// Clones share state, so a test keeps a handle after handing one to the
/// monitor or watcher under test.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    health: Mutex<Option<HealthCheck>>,
    health_unreachable: AtomicBool,
    health_calls: AtomicUsize,
    query_delay: Mutex<Option<Duration>>,
    query_calls: AtomicUsize,
    completed_queries: AtomicUsize,
    statuses: Mutex<VecDeque<AnalysisStatus>>,
    last_status: Mutex<Option<AnalysisStatus>>,
    status_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    connects: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer for every later health check; healthy until set.
    pub fn set_health(&self, check: HealthCheck) {
        *lock(&self.state.health) = Some(check);
    }

    /// Makes health checks fail at the transport level.
    pub fn set_health_unreachable(&self, unreachable: bool) {
        self.state
            .health_unreachable
            .store(unreachable, Ordering::SeqCst);
    }

    pub fn health_calls(&self) -> usize {
        self.state.health_calls.load(Ordering::SeqCst)
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *lock(&self.state.query_delay) = Some(delay);
    }

    /// Queries started, including abandoned ones.
    pub fn query_calls(&self) -> usize {
        self.state.query_calls.load(Ordering::SeqCst)
    }

    /// Queries that ran to completion.
    pub fn completed_queries(&self) -> usize {
        self.state.completed_queries.load(Ordering::SeqCst)
    }

    /// Queues a status; polls pop the queue and then repeat the last one.
    pub fn push_status(&self, status: AnalysisStatus) {
        lock(&self.state.statuses).push_back(status);
    }

    pub fn status_calls(&self) -> usize {
        self.state.status_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.state.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.disconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CopilotBackend for MockBackend {
    async fn connect(&self, connection_id: i64) -> Result<ConnectResponse> {
        let n = self.state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ConnectResponse {
            success: true,
            session_id: Some(format!("session-{connection_id}-{n}")),
            read_only_status: ReadOnlyStatus::Unknown,
            error: None,
        })
    }

    async fn disconnect(&self, _session_id: &str) -> Result<()> {
        self.state.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn check_health(&self, _session_id: &str) -> Result<HealthCheck> {
        self.state.health_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.health_unreachable.load(Ordering::SeqCst) {
            return Err(CopilotError::connection("Service unreachable"));
        }
        Ok(lock(&self.state.health)
            .clone()
            .unwrap_or_else(HealthCheck::healthy))
    }

    async fn query(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.state.query_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.state.query_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.completed_queries.fetch_add(1, Ordering::SeqCst);

        let mut response = ChatResponse::failure(None, "mock backend runs no queries");
        response.chat_session_id = request.chat_session_id.clone();
        Ok(response)
    }

    async fn start_analysis(&self, _session_id: &str) -> Result<StartAnalysisResponse> {
        Ok(StartAnalysisResponse {
            success: true,
            data: None,
            error: None,
            error_code: None,
        })
    }

    async fn analysis_status(&self, _session_id: &str) -> Result<AnalysisStatus> {
        self.state.status_calls.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.state.statuses).pop_front();
        let mut last = lock(&self.state.last_status);
        if let Some(status) = next {
            *last = Some(status);
        }
        Ok(last.clone().unwrap_or_else(AnalysisStatus::not_found))
    }

    async fn cancel_analysis(&self, _session_id: &str) -> Result<bool> {
        self.state.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}
