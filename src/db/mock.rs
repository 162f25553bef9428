//! In-memory database drivers for tests and `--mock-db`.

use super::{
    Column, ColumnInfo, DatabaseClient, ForeignKey, QueryResult, ReadOnlyStatus, Row, Schema, Table,
    Value,
};
use crate::error::{CopilotError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A mock database that serves a fixed schema and canned results.
///
/// Clones share state, so a test can keep a handle to flip liveness or read
/// the executed statements after handing the client to the system under test.
#[derive(Clone, Default)]
pub struct MockDatabaseClient {
    inner: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    schema: Schema,
    read_only: ReadOnlyStatus,
    dead: AtomicBool,
    canned: Mutex<HashMap<String, QueryResult>>,
    executed: Mutex<Vec<String>>,
    introspections: AtomicUsize,
}

impl MockDatabaseClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(schema: Schema) -> Self {
        Self::build(schema, ReadOnlyStatus::ReadWrite)
    }

    /// Mock whose read-only check reports `read_only`.
    pub fn with_read_only(schema: Schema, read_only: ReadOnlyStatus) -> Self {
        Self::build(schema, read_only)
    }

    /// Small users/orders database served by `--mock-db`.
    pub fn demo() -> Self {
        let schema = Schema {
            tables: vec![
                Table::new("users")
                    .with_columns(vec![
                        Column::new("id", "integer").not_null(),
                        Column::new("email", "varchar(255)").not_null(),
                        Column::new("created_at", "timestamp").with_default("now()"),
                    ])
                    .with_primary_key(&["id"]),
                Table::new("orders")
                    .with_columns(vec![
                        Column::new("id", "integer").not_null(),
                        Column::new("user_id", "integer"),
                        Column::new("total", "numeric(10,2)"),
                        Column::new("created_at", "timestamp").with_default("now()"),
                    ])
                    .with_primary_key(&["id"]),
            ],
            foreign_keys: vec![ForeignKey::new("orders", "user_id", "users", "id")],
        };
        Self::build(schema, ReadOnlyStatus::ReadWrite)
    }

    fn build(schema: Schema, read_only: ReadOnlyStatus) -> Self {
        Self {
            inner: Arc::new(MockState {
                schema,
                read_only,
                ..Default::default()
            }),
        }
    }

    /// Registers the result returned for an exact SQL string.
    pub fn with_result(self, sql: impl Into<String>, result: QueryResult) -> Self {
        if let Ok(mut canned) = self.inner.canned.lock() {
            canned.insert(sql.into(), result);
        }
        self
    }

    /// Simulates the link dying (or coming back).
    pub fn set_alive(&self, alive: bool) {
        self.inner.dead.store(!alive, Ordering::SeqCst);
    }

    /// Statements executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.inner
            .executed
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Number of schema fetches served.
    pub fn introspection_count(&self) -> usize {
        self.inner.introspections.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> Result<()> {
        if self.inner.dead.load(Ordering::SeqCst) {
            Err(CopilotError::connection("Mock connection is closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DatabaseClient for MockDatabaseClient {
    async fn introspect_schema(&self) -> Result<Schema> {
        self.check_alive()?;
        self.inner.introspections.fetch_add(1, Ordering::SeqCst);
        Ok(self.inner.schema.clone())
    }

    async fn execute_query(&self, sql: &str) -> Result<QueryResult> {
        self.check_alive()?;
        if let Ok(mut executed) = self.inner.executed.lock() {
            executed.push(sql.to_string());
        }

        let canned = self
            .inner
            .canned
            .lock()
            .ok()
            .and_then(|c| c.get(sql).cloned());
        if let Some(result) = canned {
            return Ok(result);
        }

        let trimmed = sql.trim_start().to_uppercase();
        let result = if trimmed.starts_with("SELECT") || trimmed.starts_with("WITH") {
            let rows: Vec<Row> = vec![vec![Value::String(format!("Mock result for: {sql}"))]];
            QueryResult::with_data(vec![ColumnInfo::new("result", "text")], rows)
        } else {
            QueryResult::default()
        };
        Ok(result.with_execution_time(Duration::from_millis(1)))
    }

    async fn probe_read_only(&self) -> ReadOnlyStatus {
        self.inner.read_only
    }

    async fn ping(&self) -> Result<()> {
        self.check_alive()
    }

    async fn close(&self) -> Result<()> {
        self.inner.dead.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A database whose every call fails, for degradation paths.
#[derive(Debug, Default, Clone)]
pub struct FailingDatabaseClient;

#[async_trait]
impl DatabaseClient for FailingDatabaseClient {
    async fn introspect_schema(&self) -> Result<Schema> {
        Err(CopilotError::query("Schema introspection failed"))
    }

    async fn execute_query(&self, _sql: &str) -> Result<QueryResult> {
        Err(CopilotError::query("ERROR: relation does not exist"))
    }

    async fn probe_read_only(&self) -> ReadOnlyStatus {
        ReadOnlyStatus::Unknown
    }

    async fn ping(&self) -> Result<()> {
        Err(CopilotError::connection("Connection refused"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
