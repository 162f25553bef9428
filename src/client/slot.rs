//! Single in-flight query per chat view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::CopilotBackend;
use crate::chat::{ChatRequest, ChatResponse};
use crate::error::CopilotError;

/// How a send ended.
#[derive(Debug)]
pub enum SlotOutcome {
    Completed(ChatResponse),
    /// A newer send or an explicit abort took the slot.
    Superseded,
    Failed(CopilotError),
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
}

/// Releases the slot when a send's future is dropped mid-flight.
struct InFlightGuard<'a> {
    slot: &'a QuerySlot,
    generation: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut current = self.slot.current();
        if current
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == self.generation)
        {
            *current = None;
        }
    }
}

/// Holds at most one query in flight; a new send aborts the previous one.
pub struct QuerySlot {
    backend: Arc<dyn CopilotBackend>,
    current: Mutex<Option<InFlight>>,
    generation: AtomicU64,
}

impl QuerySlot {
    pub fn new(backend: Arc<dyn CopilotBackend>) -> Self {
        Self {
            backend,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while a send is waiting on the backend.
    pub fn in_flight(&self) -> bool {
        self.current().is_some()
    }

    /// Aborts the query in flight, if any.
    pub fn abort(&self) -> bool {
        match self.current().take() {
            Some(in_flight) => {
                in_flight.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Sends a question, aborting whatever was in flight.
    ///
    /// The abandoned request future is dropped, which closes its HTTP
    /// request and cancels the turn on the service.
    pub async fn send(&self, request: ChatRequest) -> SlotOutcome {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let previous = self.current().replace(InFlight {
            generation,
            token: token.clone(),
        });
        if let Some(previous) = previous {
            debug!(generation = previous.generation, "Aborting superseded query");
            previous.token.cancel();
        }
        let _guard = InFlightGuard {
            slot: self,
            generation,
        };

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return SlotOutcome::Superseded,
            result = self.backend.query(&request) => result,
        };

        {
            let mut current = self.current();
            let still_ours = current
                .as_ref()
                .is_some_and(|in_flight| in_flight.generation == generation);
            // Replaced between completion and this check.
            if !still_ours {
                return SlotOutcome::Superseded;
            }
            *current = None;
        }

        match result {
            Ok(response) => SlotOutcome::Completed(response),
            Err(e) => SlotOutcome::Failed(e),
        }
    }
}
