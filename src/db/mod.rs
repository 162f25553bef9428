//! Database driver layer.
//!
//! The orchestration core talks to databases only through [`DatabaseClient`],
//! so the PostgreSQL driver and the in-memory mock are interchangeable.

mod mock;
mod postgres;
mod schema;
mod types;

pub use mock::{FailingDatabaseClient, MockDatabaseClient};
pub use postgres::PostgresClient;
pub use schema::{Column, ForeignKey, Schema, Table};
pub use types::{ColumnInfo, QueryResult, Row, Value};

use crate::config::ConnectionConfig;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Write capability of a database link, as far as it can be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadOnlyStatus {
    /// The link cannot modify data.
    #[serde(rename = "readonly")]
    ReadOnly,
    /// The link can modify at least one table.
    #[serde(rename = "readwrite")]
    ReadWrite,
    /// The check could not tell without side effects.
    #[default]
    Unknown,
}

impl ReadOnlyStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "readonly",
            Self::ReadWrite => "readwrite",
            Self::Unknown => "unknown",
        }
    }

    /// Only a positive read-only classification blocks writes.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

impl fmt::Display for ReadOnlyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens a PostgreSQL link for the given connection.
pub async fn connect(config: &ConnectionConfig) -> Result<Box<dyn DatabaseClient>> {
    let client = PostgresClient::connect(config).await?;
    Ok(Box::new(client))
}

/// Interface for database drivers.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Introspects tables, columns and foreign keys.
    async fn introspect_schema(&self) -> Result<Schema>;

    /// Executes a SQL statement and returns its rows.
    async fn execute_query(&self, sql: &str) -> Result<QueryResult>;

    /// Classifies the link's write capability without modifying anything.
    async fn probe_read_only(&self) -> ReadOnlyStatus;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<()>;

    /// Closes the link. Further calls fail.
    async fn close(&self) -> Result<()>;
}
