//! Validated query execution.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::Visualization;
use crate::connection::ConnectionLifecycle;
use crate::db::{ColumnInfo, QueryResult};
use crate::error::ErrorCode;
use crate::safety::{SqlValidator, TrustLevel, Validation};

/// Result of running one statement, successful or not.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedQuery {
    pub success: bool,
    pub sql: String,
    pub data: Vec<serde_json::Map<String, serde_json::Value>>,
    pub columns: Vec<ColumnInfo>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization: Option<Visualization>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl ExecutedQuery {
    /// Successful run, with rows flattened into records.
    pub fn succeeded(sql: impl Into<String>, result: &QueryResult) -> Self {
        Self {
            success: true,
            sql: sql.into(),
            data: result.to_records(),
            columns: result.columns.clone(),
            row_count: result.row_count(),
            execution_time_ms: result.execution_time.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Failed run. Nothing was returned.
    pub fn failed(sql: impl Into<String>, code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            success: false,
            sql: sql.into(),
            error: Some(error.into()),
            error_code: Some(code),
            ..Default::default()
        }
    }

    fn rejected(sql: &str, validation: Validation) -> Self {
        Self::failed(
            sql,
            validation.error_code.unwrap_or(ErrorCode::InvalidSql),
            validation.error.unwrap_or_else(|| "Invalid SQL".to_string()),
        )
    }
}

/// Validates and runs SQL against a connection.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Checks a statement without running it.
    fn validate(&self, sql: &str) -> Validation;

    /// Runs a statement. Failures come back inside the result, never retried.
    async fn execute(&self, connection_id: i64, sql: &str, trusted: bool) -> ExecutedQuery;
}

/// Executes against links owned by a [`ConnectionLifecycle`].
pub struct SqlExecutor {
    lifecycle: Arc<ConnectionLifecycle>,
    validator: SqlValidator,
}

impl SqlExecutor {
    pub fn new(lifecycle: Arc<ConnectionLifecycle>) -> Self {
        Self {
            lifecycle,
            validator: SqlValidator::new(),
        }
    }
}

#[async_trait]
impl QueryExecutor for SqlExecutor {
    fn validate(&self, sql: &str) -> Validation {
        self.validator.validate(sql)
    }

    async fn execute(&self, connection_id: i64, sql: &str, trusted: bool) -> ExecutedQuery {
        let client = match self.lifecycle.link_for(connection_id).await {
            Ok(client) => client,
            Err(e) => {
                warn!(connection_id, error = %e, "No link for query");
                return ExecutedQuery::failed(sql, ErrorCode::ExecutionError, e.to_string());
            }
        };

        let read_only = self.lifecycle.read_only_status(connection_id).await;
        let validation = self
            .validator
            .check(sql, TrustLevel::from_trusted(trusted), read_only);
        if !validation.valid {
            debug!(connection_id, trusted, code = ?validation.error_code, "SQL rejected");
            return ExecutedQuery::rejected(sql, validation);
        }

        match client.execute_query(sql).await {
            Ok(result) => {
                debug!(
                    connection_id,
                    rows = result.row_count(),
                    ms = result.execution_time.as_millis() as u64,
                    "Query executed"
                );
                ExecutedQuery::succeeded(sql, &result)
            }
            Err(e) => {
                debug!(connection_id, error = %e, "Query failed");
                ExecutedQuery::failed(sql, ErrorCode::ExecutionError, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnector;
    use crate::db::{MockDatabaseClient, ReadOnlyStatus, Schema, Value};
    use crate::session::InMemorySessionStore;
    use std::time::Duration;

    fn executor(mock: MockDatabaseClient) -> SqlExecutor {
        let lifecycle = ConnectionLifecycle::new(
            Arc::new(MockConnector::new().with_client(1, mock)),
            Arc::new(InMemorySessionStore::new()),
            Duration::from_secs(60),
        );
        SqlExecutor::new(Arc::new(lifecycle))
    }

    #[tokio::test]
    async fn test_select_succeeds() {
        let canned = QueryResult::with_data(
            vec![ColumnInfo::new("n", "int8")],
            vec![vec![Value::Int(2)]],
        );
        let mock = MockDatabaseClient::new().with_result("SELECT COUNT(*) AS n FROM users", canned);
        let result = executor(mock)
            .execute(1, "SELECT COUNT(*) AS n FROM users", false)
            .await;

        assert!(result.success);
        assert_eq!(result.row_count, 1);
        assert_eq!(result.data[0]["n"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_untrusted_write_never_reaches_database() {
        let mock = MockDatabaseClient::new();
        let result = executor(mock.clone())
            .execute(1, "DELETE FROM users", false)
            .await;

        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::UnsafeSql));
        assert_eq!(result.sql, "DELETE FROM users");
        assert!(mock.executed().is_empty());
    }

    #[tokio::test]
    async fn test_read_only_connection_blocks_trusted_writes() {
        let mock = MockDatabaseClient::with_read_only(Schema::default(), ReadOnlyStatus::ReadOnly);
        let result = executor(mock)
            .execute(1, "UPDATE users SET name = 'x'", true)
            .await;
        assert_eq!(result.error_code, Some(ErrorCode::ReadOnlyViolation));
    }

    #[tokio::test]
    async fn test_unknown_connection_is_execution_error() {
        let result = executor(MockDatabaseClient::new())
            .execute(42, "SELECT 1", false)
            .await;
        assert_eq!(result.error_code, Some(ErrorCode::ExecutionError));
    }

    #[test]
    fn test_failed_serialization_keeps_sql() {
        let failed = ExecutedQuery::failed("SELECT nope", ErrorCode::ExecutionError, "boom");
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["sql"], "SELECT nope");
        assert_eq!(json["errorCode"], "EXECUTION_ERROR");
        assert!(json.get("visualization").is_none());
    }
}
