//! SQLite-backed knowledge store.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use super::{migrations, ColumnExplanation, KnowledgeBase, KnowledgeStore, SqlExample};
use crate::error::{CopilotError, Result};

const MAX_OPEN_ATTEMPTS: u32 = 3;
const RETRY_DELAY_MS: u64 = 100;

/// Knowledge store persisted in a local SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteKnowledgeStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteKnowledgeStore {
    /// Opens or creates the store at `path`, running migrations.
    ///
    /// Retries briefly on lock contention.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CopilotError::persistence(format!(
                    "Failed to create directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let mut attempt = 1;
        loop {
            match Self::connect(path).await {
                Ok(pool) => {
                    migrations::run_migrations(&pool).await?;
                    info!(path = %path.display(), "Knowledge store opened");
                    return Ok(Self {
                        pool,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if attempt < MAX_OPEN_ATTEMPTS => {
                    warn!(attempt, error = %e, "Failed to open knowledge store, retrying");
                    tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS * 2u64.pow(attempt)))
                        .await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect(path: &Path) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| CopilotError::persistence(format!("Invalid database path: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| {
                CopilotError::persistence(format!("Failed to open knowledge database: {e}"))
            })
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the pool, waiting for checked-out connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn db_err(context: &str) -> impl FnOnce(sqlx::Error) -> CopilotError + '_ {
    move |e| CopilotError::persistence(format!("{context}: {e}"))
}

#[async_trait]
impl KnowledgeStore for SqliteKnowledgeStore {
    async fn load(&self, connection_id: i64) -> Result<KnowledgeBase> {
        let tables: Vec<(String, String)> = sqlx::query_as(
            "SELECT table_name, explanation FROM table_explanations WHERE connection_id = ? ORDER BY table_name",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to load table explanations"))?;

        let columns: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT table_name, column_name, explanation FROM column_explanations WHERE connection_id = ? ORDER BY position",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to load column explanations"))?;

        let examples: Vec<(String, String)> = sqlx::query_as(
            "SELECT question, sql FROM sql_examples WHERE connection_id = ? ORDER BY id",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to load SQL examples"))?;

        Ok(KnowledgeBase {
            table_explanations: tables.into_iter().collect(),
            column_explanations: columns
                .into_iter()
                .map(|(table, column, explanation)| ColumnExplanation {
                    table,
                    column,
                    explanation,
                })
                .collect(),
            sql_examples: examples
                .into_iter()
                .map(|(question, sql)| SqlExample { question, sql })
                .collect(),
        })
    }

    async fn save_table_explanations(
        &self,
        connection_id: i64,
        explanations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin"))?;

        sqlx::query("DELETE FROM table_explanations WHERE connection_id = ?")
            .bind(connection_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to clear table explanations"))?;

        for (table, explanation) in explanations {
            sqlx::query(
                "INSERT INTO table_explanations (connection_id, table_name, explanation) VALUES (?, ?, ?)",
            )
            .bind(connection_id)
            .bind(table)
            .bind(explanation)
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to save table explanation"))?;
        }

        tx.commit().await.map_err(db_err("Failed to commit"))
    }

    async fn save_column_explanations(
        &self,
        connection_id: i64,
        explanations: &[ColumnExplanation],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin"))?;

        sqlx::query("DELETE FROM column_explanations WHERE connection_id = ?")
            .bind(connection_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to clear column explanations"))?;

        for (position, col) in explanations.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO column_explanations
                    (connection_id, table_name, column_name, explanation, position)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (connection_id, table_name, column_name)
                DO UPDATE SET explanation = excluded.explanation
                "#,
            )
            .bind(connection_id)
            .bind(&col.table)
            .bind(&col.column)
            .bind(&col.explanation)
            .bind(position as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to save column explanation"))?;
        }

        tx.commit().await.map_err(db_err("Failed to commit"))
    }

    async fn save_sql_examples(&self, connection_id: i64, examples: &[SqlExample]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin"))?;

        sqlx::query("DELETE FROM sql_examples WHERE connection_id = ?")
            .bind(connection_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to clear SQL examples"))?;

        for example in examples {
            sqlx::query("INSERT INTO sql_examples (connection_id, question, sql) VALUES (?, ?, ?)")
                .bind(connection_id)
                .bind(&example.question)
                .bind(&example.sql)
                .execute(&mut *tx)
                .await
                .map_err(db_err("Failed to save SQL example"))?;
        }

        tx.commit().await.map_err(db_err("Failed to commit"))
    }
}
