//! Connection liveness as seen by a UI.
//!
//! Three signals can report that a connection session died: a query
//! response carrying `INVALID_SESSION`, the periodic health poll, and the
//! session id being cleared elsewhere. All of them go through
//! [`HealthMonitor::handle_connection_lost`], which emits at most one
//! [`MonitorEvent::ConnectionLost`] per loss.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::CopilotBackend;
use crate::error::ErrorCode;

/// Period of the background health check.
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Repeated losses of the same session inside this window are one loss.
pub const LOSS_COOLDOWN: Duration = Duration::from_secs(5);

/// How long after a manual disconnect loss signals stay suppressed.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Which path observed the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossSignal {
    QueryError,
    HealthPoll,
    SessionCleared,
}

/// Notifications for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Show the banner once and offer to reconnect.
    ConnectionLost {
        session_id: String,
        signal: LossSignal,
    },
}

#[derive(Debug, Default)]
struct MonitorState {
    session_id: Option<String>,
    user_disconnecting: bool,
    suppress_until: Option<Instant>,
    last_loss: Option<(String, Instant)>,
    poller: Option<CancellationToken>,
}

impl MonitorState {
    fn suppressed(&self, now: Instant) -> bool {
        self.user_disconnecting || self.suppress_until.is_some_and(|until| now < until)
    }

    fn stop_polling(&mut self) {
        if let Some(token) = self.poller.take() {
            token.cancel();
        }
    }
}

struct Inner {
    backend: Arc<dyn CopilotBackend>,
    state: Mutex<MonitorState>,
    events: mpsc::UnboundedSender<MonitorEvent>,
    poll_interval: Duration,
    cooldown: Duration,
    grace: Duration,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_connection_lost(&self, signal: LossSignal, session_id: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state();

        if state.suppressed(now) {
            debug!(session_id, ?signal, "Loss during manual disconnect ignored");
            return false;
        }

        // (a) and (b) must name the live session; (c) already cleared it.
        if signal != LossSignal::SessionCleared
            && state.session_id.as_deref() != Some(session_id)
        {
            debug!(session_id, ?signal, "Loss for a stale session ignored");
            return false;
        }

        if let Some((last, at)) = &state.last_loss {
            if last == session_id && now.duration_since(*at) < self.cooldown {
                debug!(session_id, ?signal, "Duplicate loss within cooldown");
                return false;
            }
        }

        state.last_loss = Some((session_id.to_string(), now));
        if state.session_id.as_deref() == Some(session_id) {
            state.session_id = None;
        }
        state.stop_polling();
        drop(state);

        info!(session_id, ?signal, "Connection lost");
        let _ = self.events.send(MonitorEvent::ConnectionLost {
            session_id: session_id.to_string(),
            signal,
        });
        true
    }
}

/// Tracks one UI's belief about its connection session.
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    /// Monitor with the production timings, plus the receiver for its events.
    pub fn new(backend: Arc<dyn CopilotBackend>) -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        Self::with_timings(backend, HEALTH_POLL_INTERVAL, LOSS_COOLDOWN, DISCONNECT_GRACE)
    }

    /// Monitor with explicit poll interval, loss cooldown and disconnect grace.
    pub fn with_timings(
        backend: Arc<dyn CopilotBackend>,
        poll_interval: Duration,
        cooldown: Duration,
        grace: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            backend,
            state: Mutex::new(MonitorState::default()),
            events,
            poll_interval,
            cooldown,
            grace,
        });
        (Self { inner }, rx)
    }

    /// Session currently being watched.
    pub fn session_id(&self) -> Option<String> {
        self.inner.state().session_id.clone()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.state().poller.is_some()
    }

    /// Adopts a freshly connected session and starts polling it.
    pub fn set_session(&self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        let token = CancellationToken::new();
        {
            let mut state = self.inner.state();
            state.stop_polling();
            state.suppress_until = None;
            state.session_id = Some(session_id.clone());
            state.poller = Some(token.clone());
        }
        debug!(session_id = %session_id, "Health polling started");
        tokio::spawn(poll_health(Arc::downgrade(&self.inner), session_id, token));
    }

    /// Clears the session from a path other than this monitor.
    ///
    /// Outside a manual disconnect this counts as a loss.
    pub fn clear_session(&self) -> bool {
        let previous = {
            let mut state = self.inner.state();
            state.stop_polling();
            state.session_id.take()
        };
        match previous {
            Some(session_id) => self
                .inner
                .handle_connection_lost(LossSignal::SessionCleared, &session_id),
            None => false,
        }
    }

    /// Feeds the error code of a query response.
    pub fn report_query_error(&self, code: Option<ErrorCode>) -> bool {
        if code != Some(ErrorCode::InvalidSession) {
            return false;
        }
        let Some(session_id) = self.session_id() else {
            return false;
        };
        self.inner
            .handle_connection_lost(LossSignal::QueryError, &session_id)
    }

    /// Runs the single loss transition. Returns whether an event went out.
    pub fn handle_connection_lost(&self, signal: LossSignal, session_id: &str) -> bool {
        self.inner.handle_connection_lost(signal, session_id)
    }

    /// User-initiated disconnect. Produces no loss event.
    pub async fn disconnect(&self) {
        let previous = {
            let mut state = self.inner.state();
            state.user_disconnecting = true;
            state.stop_polling();
            state.session_id.take()
        };

        if let Some(session_id) = &previous {
            if let Err(e) = self.inner.backend.disconnect(session_id).await {
                warn!(session_id = %session_id, error = %e, "Disconnect request failed");
            }
        }

        let mut state = self.inner.state();
        state.user_disconnecting = false;
        state.suppress_until = Some(Instant::now() + self.inner.grace);
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.inner.state().stop_polling();
    }
}

async fn poll_health(inner: Weak<Inner>, session_id: String, token: CancellationToken) {
    let interval = match inner.upgrade() {
        Some(inner) => inner.poll_interval,
        None => return,
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(live) = inner.upgrade() else { break };
        let backend = Arc::clone(&live.backend);
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = backend.check_health(&session_id) => result,
        };
        if token.is_cancelled() {
            break;
        }

        match result {
            Ok(check) if check.error_code == Some(ErrorCode::InvalidSession) => {
                live.handle_connection_lost(LossSignal::HealthPoll, &session_id);
                break;
            }
            Ok(check) if !check.success => {
                debug!(session_id = %session_id, "Health check failed without a verdict");
            }
            Ok(_) => {}
            Err(e) => {
                // Transport trouble is not proof of a lost session.
                warn!(session_id = %session_id, error = %e, "Health check unreachable");
            }
        }
    }
    debug!(session_id = %session_id, "Health polling stopped");
}
