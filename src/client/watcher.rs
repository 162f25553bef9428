//! Polls an analysis job until it ends.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::CopilotBackend;
use crate::analysis::AnalysisStatus;
use crate::error::{CopilotError, Result};

/// Period between status polls.
pub const ANALYSIS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What a watcher reports, in order, ending with one terminal event.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Progress(AnalysisStatus),
    /// Completed or failed; the phase messages tell which.
    Finished(AnalysisStatus),
    /// Cancelled locally. Nothing follows.
    Cancelled,
    /// The service no longer knows the job.
    Gone,
}

/// Event sink that goes quiet after the first terminal event.
#[derive(Clone)]
struct Emitter {
    tx: mpsc::UnboundedSender<WatchEvent>,
    done: Arc<Mutex<bool>>,
}

impl Emitter {
    fn done(&self) -> MutexGuard<'_, bool> {
        self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn progress(&self, status: AnalysisStatus) {
        let done = self.done();
        if !*done {
            let _ = self.tx.send(WatchEvent::Progress(status));
        }
    }

    /// Returns false when another terminal event got there first.
    fn terminal(&self, event: WatchEvent) -> bool {
        let mut done = self.done();
        if *done {
            return false;
        }
        *done = true;
        let _ = self.tx.send(event);
        true
    }
}

/// Watches one session's analysis job.
pub struct AnalysisWatcher {
    backend: Arc<dyn CopilotBackend>,
    session_id: String,
    token: CancellationToken,
    emitter: Emitter,
}

impl AnalysisWatcher {
    /// Starts a job (or joins the running one) and watches it.
    pub async fn start(
        backend: Arc<dyn CopilotBackend>,
        session_id: &str,
        interval: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WatchEvent>)> {
        let response = backend.start_analysis(session_id).await?;
        if !response.success {
            return Err(CopilotError::session(
                response
                    .error
                    .unwrap_or_else(|| "Analysis could not start".to_string()),
            ));
        }
        Ok(Self::watch(backend, session_id, interval))
    }

    /// Watches a job that is already running.
    pub fn watch(
        backend: Arc<dyn CopilotBackend>,
        session_id: &str,
        interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Self {
            backend,
            session_id: session_id.to_string(),
            token: CancellationToken::new(),
            emitter: Emitter {
                tx,
                done: Arc::new(Mutex::new(false)),
            },
        };
        tokio::spawn(poll_status(
            Arc::clone(&watcher.backend),
            watcher.session_id.clone(),
            interval,
            watcher.token.clone(),
            watcher.emitter.clone(),
        ));
        (watcher, rx)
    }

    /// True once a terminal event was sent.
    pub fn is_finished(&self) -> bool {
        *self.emitter.done()
    }

    /// Cancels the job. The local abort applies immediately; the service
    /// request is sent without waiting for it.
    pub fn cancel(&self) -> bool {
        if !self.emitter.terminal(WatchEvent::Cancelled) {
            return false;
        }
        self.token.cancel();

        let backend = Arc::clone(&self.backend);
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            match backend.cancel_analysis(&session_id).await {
                Ok(found) => debug!(session_id = %session_id, found, "Analysis cancel sent"),
                Err(e) => warn!(session_id = %session_id, error = %e, "Analysis cancel failed"),
            }
        });
        true
    }
}

impl Drop for AnalysisWatcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn poll_status(
    backend: Arc<dyn CopilotBackend>,
    session_id: String,
    interval: Duration,
    token: CancellationToken,
    emitter: Emitter,
) {
    loop {
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = backend.analysis_status(&session_id) => result,
        };

        match result {
            Ok(status) if !status.found => {
                emitter.terminal(WatchEvent::Gone);
                break;
            }
            Ok(status) if status.is_terminal() => {
                emitter.terminal(WatchEvent::Finished(status));
                break;
            }
            Ok(status) => emitter.progress(status),
            Err(e) => warn!(session_id = %session_id, error = %e, "Analysis status poll failed"),
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(session_id = %session_id, "Analysis polling stopped");
}
