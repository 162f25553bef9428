//! Opening database links by connection id.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::db::{self, DatabaseClient, MockDatabaseClient};
use crate::error::{CopilotError, Result};

/// Resolves a connection id to a live database link.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, connection_id: i64) -> Result<Arc<dyn DatabaseClient>>;
}

/// Opens PostgreSQL links for the `[[connections]]` entries in the config.
#[derive(Debug, Clone)]
pub struct ConfigConnector {
    connections: HashMap<i64, ConnectionConfig>,
}

impl ConfigConnector {
    pub fn new(connections: impl IntoIterator<Item = ConnectionConfig>) -> Self {
        Self {
            connections: connections.into_iter().map(|c| (c.id, c)).collect(),
        }
    }
}

#[async_trait]
impl Connector for ConfigConnector {
    async fn open(&self, connection_id: i64) -> Result<Arc<dyn DatabaseClient>> {
        let config = self.connections.get(&connection_id).ok_or_else(|| {
            CopilotError::connection(format!("Unknown connection id: {connection_id}"))
        })?;
        let client = db::connect(config).await?;
        Ok(Arc::from(client))
    }
}

/// Hands out pre-built mock clients.
///
/// Each id maps to one [`MockDatabaseClient`]; every open returns a clone
/// sharing its state.
#[derive(Clone, Default)]
pub struct MockConnector {
    clients: HashMap<i64, MockDatabaseClient>,
    opens: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `client` for `connection_id`. Unknown ids fail to connect.
    pub fn with_client(mut self, connection_id: i64, client: MockDatabaseClient) -> Self {
        self.clients.insert(connection_id, client);
        self
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, connection_id: i64) -> Result<Arc<dyn DatabaseClient>> {
        let client = self.clients.get(&connection_id).ok_or_else(|| {
            CopilotError::connection(format!("Unknown connection id: {connection_id}"))
        })?;
        client.set_alive(true);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(client.clone()))
    }
}
