//! Connect, disconnect and health checks over shared links.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Connector;
use crate::db::{DatabaseClient, ReadOnlyStatus};
use crate::error::{ErrorCode, Result};
use crate::session::{ConnectionSession, SessionStore};

/// Outcome of a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl HealthCheck {
    pub fn healthy() -> Self {
        Self {
            success: true,
            error_code: None,
        }
    }

    /// The session is unknown or its link was torn down.
    pub fn invalid_session() -> Self {
        Self {
            success: false,
            error_code: Some(ErrorCode::InvalidSession),
        }
    }
}

/// Told about every connection session the lifecycle tears down.
///
/// Called synchronously after the session record is gone, so a listener
/// must not block.
pub trait SessionListener: Send + Sync {
    fn session_closed(&self, session: &ConnectionSession);
}

struct Link {
    client: Arc<dyn DatabaseClient>,
    read_only: ReadOnlyStatus,
    last_used: Instant,
}

/// Owns the open database links and the sessions that use them.
pub struct ConnectionLifecycle {
    connector: Arc<dyn Connector>,
    sessions: Arc<dyn SessionStore>,
    links: Mutex<HashMap<i64, Link>>,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
    idle_timeout: Duration,
}

impl ConnectionLifecycle {
    pub fn new(
        connector: Arc<dyn Connector>,
        sessions: Arc<dyn SessionStore>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            sessions,
            links: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            idle_timeout,
        }
    }

    /// The store holding the sessions this lifecycle mints.
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Registers a listener for session teardown.
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn notify_closed(&self, session: &ConnectionSession) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.session_closed(session);
        }
    }

    /// Opens (or reuses) the link for `connection_id` and mints a session.
    pub async fn connect(&self, connection_id: i64) -> Result<ConnectionSession> {
        let (_, read_only) = self.acquire(connection_id).await?;
        let session = self
            .sessions
            .create_connection_session(connection_id, read_only);
        info!(
            connection_id,
            session_id = %session.id,
            read_only = %read_only,
            "Connection session created"
        );
        Ok(session)
    }

    /// Destroys the session. Unknown sessions are not an error.
    pub async fn disconnect(&self, session_id: &str) -> bool {
        match self.sessions.destroy_connection_session(session_id) {
            Some(session) => {
                info!(session_id, connection_id = session.connection_id, "Disconnected");
                self.notify_closed(&session);
                self.release_if_unused(session.connection_id).await;
            }
            None => debug!(session_id, "Disconnect for unknown session"),
        }
        true
    }

    /// Verifies the session record and its link.
    ///
    /// A missing record or a dead link yields `INVALID_SESSION`; a dead link
    /// also tears the session down and evicts the link.
    pub async fn check_health(&self, session_id: &str) -> HealthCheck {
        let Some(session) = self.sessions.connection_session(session_id) else {
            return HealthCheck::invalid_session();
        };

        let client = {
            let links = self.links.lock().await;
            links.get(&session.connection_id).map(|l| l.client.clone())
        };

        let alive = match client {
            Some(client) => match client.ping().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(session_id, connection_id = session.connection_id, error = %e, "Health check failed");
                    self.evict(session.connection_id).await;
                    false
                }
            },
            None => {
                warn!(session_id, connection_id = session.connection_id, "Session has no link");
                false
            }
        };

        if alive {
            self.sessions.touch_connection_session(session_id);
            HealthCheck::healthy()
        } else {
            if let Some(session) = self.sessions.destroy_connection_session(session_id) {
                self.notify_closed(&session);
            }
            HealthCheck::invalid_session()
        }
    }

    /// Returns the link for a connection, opening it if needed.
    pub async fn link_for(&self, connection_id: i64) -> Result<Arc<dyn DatabaseClient>> {
        self.acquire(connection_id).await.map(|(client, _)| client)
    }

    /// Write capability recorded for the connection's link.
    pub async fn read_only_status(&self, connection_id: i64) -> ReadOnlyStatus {
        self.links
            .lock()
            .await
            .get(&connection_id)
            .map(|l| l.read_only)
            .unwrap_or_default()
    }

    /// Expires idle sessions and closes links nobody is using.
    pub async fn expire_idle(&self) -> usize {
        let expired = self.sessions.expire_idle(self.idle_timeout, Utc::now());
        for session in &expired {
            info!(
                session_id = %session.id,
                connection_id = session.connection_id,
                "Connection session expired"
            );
            self.notify_closed(session);
        }

        let orphaned: Vec<(i64, Arc<dyn DatabaseClient>)> = {
            let mut links = self.links.lock().await;
            let ids: Vec<i64> = links
                .iter()
                .filter(|(id, link)| {
                    link.last_used.elapsed() >= self.idle_timeout
                        && self.sessions.sessions_for_connection(**id).is_empty()
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| links.remove(&id).map(|l| (id, l.client)))
                .collect()
        };
        for (connection_id, client) in orphaned {
            debug!(connection_id, "Closing idle link");
            close_quietly(connection_id, client.as_ref()).await;
        }

        for session in &expired {
            self.release_if_unused(session.connection_id).await;
        }
        expired.len()
    }

    /// Runs [`expire_idle`](Self::expire_idle) every `interval` until cancelled.
    pub fn spawn_reaper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = self.expire_idle().await;
                        if expired > 0 {
                            info!(expired, "Reaped idle sessions");
                        }
                    }
                }
            }
            debug!("Session reaper stopped");
        })
    }

    /// Closes every open link.
    pub async fn shutdown(&self) {
        let links: Vec<(i64, Link)> = self.links.lock().await.drain().collect();
        for (connection_id, link) in links {
            close_quietly(connection_id, link.client.as_ref()).await;
        }
    }

    async fn acquire(&self, connection_id: i64) -> Result<(Arc<dyn DatabaseClient>, ReadOnlyStatus)> {
        {
            let mut links = self.links.lock().await;
            if let Some(link) = links.get_mut(&connection_id) {
                link.last_used = Instant::now();
                return Ok((link.client.clone(), link.read_only));
            }
        }

        // Open outside the lock so a slow connect does not stall other links.
        let client = self.connector.open(connection_id).await?;
        let read_only = client.probe_read_only().await;
        debug!(connection_id, read_only = %read_only, "Opened link");

        let mut links = self.links.lock().await;
        if let Some(existing) = links.get_mut(&connection_id) {
            // Lost a race with a concurrent open; keep the first link.
            existing.last_used = Instant::now();
            let winner = (existing.client.clone(), existing.read_only);
            drop(links);
            close_quietly(connection_id, client.as_ref()).await;
            return Ok(winner);
        }
        links.insert(
            connection_id,
            Link {
                client: client.clone(),
                read_only,
                last_used: Instant::now(),
            },
        );
        Ok((client, read_only))
    }

    async fn release_if_unused(&self, connection_id: i64) {
        if !self.sessions.sessions_for_connection(connection_id).is_empty() {
            return;
        }
        let removed = self.links.lock().await.remove(&connection_id);
        if let Some(link) = removed {
            debug!(connection_id, "Last session gone, closing link");
            close_quietly(connection_id, link.client.as_ref()).await;
        }
    }

    async fn evict(&self, connection_id: i64) {
        let removed = self.links.lock().await.remove(&connection_id);
        if let Some(link) = removed {
            close_quietly(connection_id, link.client.as_ref()).await;
        }
    }
}

async fn close_quietly(connection_id: i64, client: &dyn DatabaseClient) {
    if let Err(e) = client.close().await {
        warn!(connection_id, error = %e, "Failed to close link");
    }
}
