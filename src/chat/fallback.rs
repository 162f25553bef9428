//! Template SQL for when no AI backend is available.
//!
//! A handful of fixed intents matched against the lower-cased question.
//! Output is built from schema names only, so it runs as trusted SQL.

use crate::db::{Schema, Table};
use crate::query::Visualization;

/// SQL produced by a matched intent.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackSql {
    pub sql: String,
    pub explanation: String,
    pub visualization: Option<Visualization>,
}

const TIMESTAMP_HINTS: [&str; 3] = ["created", "updated", "timestamp"];

/// Matches the question against the built-in intents.
///
/// Returns `None` when no intent matches or the schema has no tables.
pub fn generate_fallback_sql(question: &str, schema: Option<&Schema>) -> Option<FallbackSql> {
    let q = question.to_lowercase();
    let tables = schema.map(|s| s.tables.as_slice()).unwrap_or_default();
    if tables.is_empty() {
        return None;
    }

    if q.contains("count") && q.contains("by table") {
        return Some(count_by_table(tables));
    }

    if q.contains("show") || q.contains("list") {
        let table = resolve_table(&q, tables)?;
        return Some(FallbackSql {
            sql: format!("SELECT * FROM {} LIMIT 100", table.name),
            explanation: format!("Showing up to 100 rows from {}", table.name),
            visualization: None,
        });
    }

    if q.contains("count") || q.contains("how many") {
        let table = resolve_table(&q, tables)?;
        return Some(FallbackSql {
            sql: format!("SELECT COUNT(*) as count FROM {}", table.name),
            explanation: format!("Counting rows in {}", table.name),
            visualization: None,
        });
    }

    if q.contains("recent") || q.contains("latest") || q.contains("new") {
        let table = resolve_table(&q, tables)?;
        let order_column = table.columns.iter().find(|c| {
            let name = c.name.to_lowercase();
            TIMESTAMP_HINTS.iter().any(|hint| name.contains(hint))
        });
        let sql = match order_column {
            Some(col) => format!(
                "SELECT * FROM {} ORDER BY {} DESC LIMIT 10",
                table.name, col.name
            ),
            None => format!("SELECT * FROM {} LIMIT 10", table.name),
        };
        return Some(FallbackSql {
            sql,
            explanation: format!("Most recent rows from {}", table.name),
            visualization: None,
        });
    }

    None
}

fn count_by_table(tables: &[Table]) -> FallbackSql {
    let selects: Vec<String> = tables
        .iter()
        .map(|t| {
            format!(
                "SELECT '{}' as table_name, COUNT(*) as record_count FROM {}",
                t.name, t.name
            )
        })
        .collect();

    FallbackSql {
        sql: format!(
            "{}\nORDER BY record_count DESC;",
            selects.join("\nUNION ALL\n")
        ),
        explanation: "Record counts for every table".to_string(),
        visualization: Some(
            Visualization::new("bar")
                .with_x_axis("table_name")
                .with_y_axis(["record_count"])
                .with_title("Records by table"),
        ),
    }
}

/// Picks the table a question is about.
///
/// A table whose name appears in the question wins. Otherwise a table
/// named `users` is preferred, then the first table. The `users`
/// preference is a guess at the most commonly asked-about table.
fn resolve_table<'a>(question: &str, tables: &'a [Table]) -> Option<&'a Table> {
    tables
        .iter()
        .find(|t| question.contains(&t.name.to_lowercase()))
        .or_else(|| tables.iter().find(|t| t.name == "users"))
        .or_else(|| tables.first())
}
