//! Forward-only migrations for the knowledge database.

use crate::error::{CopilotError, Result};
use sqlx::sqlite::SqlitePool;
use tracing::info;

const CURRENT_VERSION: i32 = 1;

/// Brings the database up to the current schema version.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| CopilotError::persistence(format!("Failed to create schema_versions table: {e}")))?;

    let current: Option<i32> = sqlx::query_scalar("SELECT MAX(version) FROM schema_versions")
        .fetch_one(pool)
        .await
        .map_err(|e| CopilotError::persistence(format!("Failed to get schema version: {e}")))?;
    let current = current.unwrap_or(0);

    if current > CURRENT_VERSION {
        return Err(CopilotError::persistence(format!(
            "Knowledge database version ({current}) is newer than supported version ({CURRENT_VERSION})"
        )));
    }

    for version in (current + 1)..=CURRENT_VERSION {
        apply(pool, version).await?;
        sqlx::query("INSERT INTO schema_versions (version) VALUES (?)")
            .bind(version)
            .execute(pool)
            .await
            .map_err(|e| CopilotError::persistence(format!("Failed to record migration: {e}")))?;
        info!(version, "Applied knowledge migration");
    }

    Ok(())
}

async fn apply(pool: &SqlitePool, version: i32) -> Result<()> {
    let statements: &[&str] = match version {
        1 => &[
            r#"
            CREATE TABLE IF NOT EXISTS table_explanations (
                connection_id INTEGER NOT NULL,
                table_name TEXT NOT NULL,
                explanation TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (connection_id, table_name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS column_explanations (
                connection_id INTEGER NOT NULL,
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                explanation TEXT NOT NULL,
                position INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (connection_id, table_name, column_name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sql_examples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                connection_id INTEGER NOT NULL,
                question TEXT NOT NULL,
                sql TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sql_examples_connection ON sql_examples(connection_id)",
        ],
        _ => {
            return Err(CopilotError::persistence(format!(
                "Unknown migration version: {version}"
            )))
        }
    };

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| CopilotError::persistence(format!("Migration v{version} failed: {e}")))?;
    }
    Ok(())
}
