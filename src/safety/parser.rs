//! sqlparser-backed statement classification.
//!
//! Uses the PostgreSQL dialect. The most dangerous statement (or nested
//! query part) decides the level of the whole input.

use sqlparser::ast::{Query, Select, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::{CopilotError, Result};

use super::SafetyLevel;

/// Parses `sql` and returns its safety level.
///
/// Fails with a query error when the input does not parse or holds no
/// statements.
pub fn classify_sql(sql: &str) -> Result<SafetyLevel> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| CopilotError::query(format!("SQL parse error: {e}")))?;

    statements
        .iter()
        .map(classify_statement)
        .max()
        .ok_or_else(|| CopilotError::query("Empty SQL statement"))
}

fn classify_statement(statement: &Statement) -> SafetyLevel {
    match statement {
        Statement::Query(query) => classify_query(query),
        // Plain EXPLAIN only plans; EXPLAIN ANALYZE runs the statement.
        Statement::Explain {
            analyze, statement, ..
        } => {
            if *analyze {
                classify_statement(statement)
            } else {
                SafetyLevel::Safe
            }
        }
        Statement::ShowVariable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. } => SafetyLevel::Safe,

        Statement::Insert(_) | Statement::Update { .. } => SafetyLevel::Mutating,

        // DELETE, DDL, GRANT and anything unrecognised.
        _ => SafetyLevel::Destructive,
    }
}

fn classify_query(query: &Query) -> SafetyLevel {
    let cte_level = query
        .with
        .iter()
        .flat_map(|with| with.cte_tables.iter())
        .map(|cte| classify_query(&cte.query))
        .max()
        .unwrap_or(SafetyLevel::Safe);

    cte_level.max(classify_set_expr(&query.body))
}

fn classify_set_expr(set_expr: &SetExpr) -> SafetyLevel {
    match set_expr {
        SetExpr::Select(select) => classify_select(select),
        SetExpr::Query(query) => classify_query(query),
        SetExpr::SetOperation { left, right, .. } => {
            classify_set_expr(left).max(classify_set_expr(right))
        }
        SetExpr::Values(_) | SetExpr::Table(_) => SafetyLevel::Safe,
        SetExpr::Insert(stmt) | SetExpr::Update(stmt) => classify_statement(stmt),
    }
}

fn classify_select(select: &Select) -> SafetyLevel {
    // SELECT ... INTO creates a table.
    if select.into.is_some() {
        return SafetyLevel::Destructive;
    }

    select
        .from
        .iter()
        .map(classify_table_with_joins)
        .max()
        .unwrap_or(SafetyLevel::Safe)
}

fn classify_table_with_joins(twj: &TableWithJoins) -> SafetyLevel {
    std::iter::once(&twj.relation)
        .chain(twj.joins.iter().map(|join| &join.relation))
        .map(classify_table_factor)
        .max()
        .unwrap_or(SafetyLevel::Safe)
}

fn classify_table_factor(factor: &TableFactor) -> SafetyLevel {
    match factor {
        TableFactor::Derived { subquery, .. } => classify_query(subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => classify_table_with_joins(table_with_joins),
        _ => SafetyLevel::Safe,
    }
}
