//! PostgreSQL driver built on sqlx.

use crate::config::ConnectionConfig;
use crate::db::{
    Column, ColumnInfo, DatabaseClient, ForeignKey, QueryResult, ReadOnlyStatus, Row, Schema,
    Table, Value,
};
use crate::error::{CopilotError, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column as SqlxColumn, Row as SqlxRow, TypeInfo};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const QUERY_TIMEOUT_SECS: u64 = 30;

/// Rows beyond this are dropped from the result.
const MAX_ROWS: usize = 1000;

const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;

/// PostgreSQL database client.
#[derive(Debug)]
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    /// Opens a pool, retrying transient failures with exponential backoff.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn_str = config.to_connection_string()?;
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        let mut attempt = 1;

        loop {
            debug!(attempt, connection = %config.display_string(), "Opening database pool");

            let result = PgPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&conn_str)
                .await;

            match result {
                Ok(pool) => return Ok(Self { pool }),
                Err(e) if attempt < MAX_RETRY_ATTEMPTS && is_transient_error(&e) => {
                    warn!(attempt, error = %e, "Transient connection failure, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(map_connection_error(e, config)),
            }
        }
    }

    async fn fetch_tables(&self) -> Result<Vec<Table>> {
        let table_names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CopilotError::query(format!("Failed to fetch tables: {e}")))?;

        let mut tables = Vec::with_capacity(table_names.len());
        for name in table_names {
            let columns = self.fetch_columns(&name).await?;
            let primary_key = self.fetch_primary_key(&name).await?;
            tables.push(Table {
                name,
                columns,
                primary_key,
            });
        }
        Ok(tables)
    }

    async fn fetch_columns(&self, table: &str) -> Result<Vec<Column>> {
        let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text, is_nullable::text, column_default::text
            FROM information_schema.columns
            WHERE table_schema = 'public' AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CopilotError::query(format!("Failed to fetch columns for {table}: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|(name, data_type, nullable, default)| Column {
                name,
                data_type,
                is_nullable: nullable == "YES",
                default,
            })
            .collect())
    }

    async fn fetch_primary_key(&self, table: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(
            r#"
            SELECT kcu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            WHERE tc.table_schema = 'public'
                AND tc.table_name = $1
                AND tc.constraint_type = 'PRIMARY KEY'
            ORDER BY kcu.ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CopilotError::query(format!("Failed to fetch primary key for {table}: {e}")))
    }

    async fn fetch_foreign_keys(&self) -> Result<Vec<ForeignKey>> {
        let rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT
                tc.constraint_name::text,
                kcu.table_name::text,
                kcu.column_name::text,
                ccu.table_name::text,
                ccu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON tc.constraint_name = ccu.constraint_name
                AND tc.table_schema = ccu.table_schema
            WHERE tc.table_schema = 'public' AND tc.constraint_type = 'FOREIGN KEY'
            ORDER BY kcu.table_name, tc.constraint_name, kcu.ordinal_position
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CopilotError::query(format!("Failed to fetch foreign keys: {e}")))?;

        // Group multi-column keys by constraint name, keeping query order.
        let mut order = Vec::new();
        let mut by_constraint: HashMap<String, ForeignKey> = HashMap::new();
        for (constraint, from_table, from_column, to_table, to_column) in rows {
            let fk = by_constraint.entry(constraint.clone()).or_insert_with(|| {
                order.push(constraint);
                ForeignKey {
                    from_table,
                    from_columns: Vec::new(),
                    to_table,
                    to_columns: Vec::new(),
                }
            });
            if !fk.from_columns.contains(&from_column) {
                fk.from_columns.push(from_column);
            }
            if !fk.to_columns.contains(&to_column) {
                fk.to_columns.push(to_column);
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|name| by_constraint.remove(&name))
            .collect())
    }
}

#[async_trait]
impl DatabaseClient for PostgresClient {
    async fn introspect_schema(&self) -> Result<Schema> {
        Ok(Schema {
            tables: self.fetch_tables().await?,
            foreign_keys: self.fetch_foreign_keys().await?,
        })
    }

    async fn execute_query(&self, sql: &str) -> Result<QueryResult> {
        let start = Instant::now();

        let pg_rows = tokio::time::timeout(
            Duration::from_secs(QUERY_TIMEOUT_SECS),
            sqlx::query(sql).fetch_all(&self.pool),
        )
        .await
        .map_err(|_| {
            CopilotError::query(format!(
                "Query timed out after {QUERY_TIMEOUT_SECS} seconds"
            ))
        })?
        .map_err(|e| CopilotError::query(format_query_error(e)))?;

        let execution_time = start.elapsed();

        let columns = pg_rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                    .collect()
            })
            .unwrap_or_default();

        if pg_rows.len() > MAX_ROWS {
            warn!(total = pg_rows.len(), kept = MAX_ROWS, "Truncating result set");
        }
        let rows: Vec<Row> = pg_rows.iter().take(MAX_ROWS).map(convert_row).collect();

        Ok(QueryResult::with_data(columns, rows).with_execution_time(execution_time))
    }

    async fn probe_read_only(&self) -> ReadOnlyStatus {
        // A read-only transaction default (hot standby, role setting) wins outright.
        let tx_read_only: std::result::Result<String, _> =
            sqlx::query_scalar("SHOW transaction_read_only")
                .fetch_one(&self.pool)
                .await;
        match tx_read_only {
            Ok(value) if value == "on" => return ReadOnlyStatus::ReadOnly,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "transaction_read_only check failed");
                return ReadOnlyStatus::Unknown;
            }
        }

        let can_write: std::result::Result<Option<bool>, _> = sqlx::query_scalar(
            r#"
            SELECT bool_or(has_table_privilege(c.oid, 'INSERT,UPDATE,DELETE'))
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = 'public' AND c.relkind = 'r'
            "#,
        )
        .fetch_one(&self.pool)
        .await;

        match can_write {
            Ok(Some(true)) => ReadOnlyStatus::ReadWrite,
            Ok(Some(false)) => ReadOnlyStatus::ReadOnly,
            // No tables to judge by.
            Ok(None) => ReadOnlyStatus::Unknown,
            Err(e) => {
                debug!(error = %e, "privilege check failed");
                ReadOnlyStatus::Unknown
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        if self.pool.is_closed() {
            return Err(CopilotError::connection("Connection pool is closed"));
        }
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| CopilotError::connection(format!("Health check failed: {e}")))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    fn get<'r, T>(row: &'r PgRow, index: usize) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        row.try_get::<Option<T>, _>(index).ok().flatten()
    }

    let value = match type_name.to_uppercase().as_str() {
        "BOOL" => get::<bool>(row, index).map(Value::Bool),
        "INT2" => get::<i16>(row, index).map(|v| Value::Int(v.into())),
        "INT4" => get::<i32>(row, index).map(|v| Value::Int(v.into())),
        "INT8" => get::<i64>(row, index).map(Value::Int),
        "FLOAT4" => get::<f32>(row, index).map(|v| Value::Float(v.into())),
        "FLOAT8" => get::<f64>(row, index).map(Value::Float),
        "BYTEA" => get::<Vec<u8>>(row, index).map(Value::Bytes),
        _ => get::<String>(row, index).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

fn is_transient_error(error: &sqlx::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    [
        "connection refused",
        "timed out",
        "timeout",
        "temporarily unavailable",
        "connection reset",
        "broken pipe",
    ]
    .iter()
    .any(|needle| msg.contains(needle))
}

fn map_connection_error(error: sqlx::Error, config: &ConnectionConfig) -> CopilotError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port;
    let msg = error.to_string().to_lowercase();

    if msg.contains("connection refused") || msg.contains("could not connect") {
        CopilotError::connection(format!(
            "Cannot connect to {host}:{port}. Check that the server is running."
        ))
    } else if msg.contains("authentication failed") {
        let user = config.user.as_deref().unwrap_or("unknown");
        CopilotError::connection(format!(
            "Authentication failed for user '{user}'. Check your credentials."
        ))
    } else if msg.contains("does not exist") && msg.contains("database") {
        let database = config.database.as_deref().unwrap_or("unknown");
        CopilotError::connection(format!("Database '{database}' does not exist."))
    } else if msg.contains("timed out") || msg.contains("timeout") {
        CopilotError::connection(format!("Connection to {host}:{port} timed out."))
    } else {
        CopilotError::connection(error.to_string())
    }
}

/// Formats a database error with DETAIL and HINT when Postgres supplies them.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut out = format!("ERROR: {}", db_error.message());
    if let Some(pg) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg.detail() {
            out.push_str(&format!("\n  DETAIL: {detail}"));
        }
        if let Some(hint) = pg.hint() {
            out.push_str(&format!("\n  HINT: {hint}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_client() -> Option<PostgresClient> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let config = ConnectionConfig::from_connection_string(1, &url).ok()?;
        PostgresClient::connect(&config).await.ok()
    }

    #[tokio::test]
    async fn test_select_roundtrip() {
        let Some(client) = test_client().await else {
            eprintln!("Skipping test: DATABASE_URL not set");
            return;
        };

        let result = client
            .execute_query("SELECT 1::int4 AS num, 'hello' AS greeting")
            .await
            .unwrap();
        assert_eq!(result.columns[0].name, "num");
        assert_eq!(result.rows[0][0], Value::Int(1));
        assert_eq!(result.rows[0][1], Value::String("hello".to_string()));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_only_check_and_ping() {
        let Some(client) = test_client().await else {
            eprintln!("Skipping test: DATABASE_URL not set");
            return;
        };

        client.ping().await.unwrap();
        // Any classification is acceptable; the check must simply not fail.
        let _ = client.probe_read_only().await;

        client.close().await.unwrap();
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_query_error_is_reported() {
        let Some(client) = test_client().await else {
            eprintln!("Skipping test: DATABASE_URL not set");
            return;
        };

        let err = client
            .execute_query("SELECT * FROM nonexistent_table_xyz")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_error() {
        let config = ConnectionConfig {
            id: 1,
            host: Some("nonexistent.invalid".to_string()),
            port: 5432,
            database: Some("testdb".to_string()),
            user: Some("tester".to_string()),
            ..Default::default()
        };

        let err = PostgresClient::connect(&config).await.unwrap_err();
        assert!(matches!(err, CopilotError::Connection(_)));
    }
}
