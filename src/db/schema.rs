//! Database schema types.

use serde::{Deserialize, Serialize};

/// Tables and relationships of one database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<Table>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl Schema {
    /// Builds a schema from tables only.
    pub fn with_tables(tables: Vec<Table>) -> Self {
        Self {
            tables,
            foreign_keys: Vec::new(),
        }
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    /// Looks up a table by exact name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Renders the schema as prompt text.
    ///
    /// One block per table, one line per column with PK / NOT NULL / FK
    /// annotations, so the model sees joins without a separate section.
    pub fn format_for_llm(&self) -> String {
        let mut out = String::from("Database Schema:\n\n");

        for table in &self.tables {
            out.push_str(&format!("Table: {}\n", table.name));
            for column in &table.columns {
                out.push_str(&self.column_line(table, column));
            }
            out.push('\n');
        }

        out
    }

    fn column_line(&self, table: &Table, column: &Column) -> String {
        let mut notes = Vec::new();
        if table.primary_key.iter().any(|pk| pk == &column.name) {
            notes.push("PK".to_string());
        }
        if !column.is_nullable {
            notes.push("NOT NULL".to_string());
        }
        for fk in self.foreign_keys.iter().filter(|fk| {
            fk.from_table == table.name && fk.from_columns.iter().any(|c| c == &column.name)
        }) {
            let target = fk.to_columns.first().map(String::as_str).unwrap_or("");
            notes.push(format!("FK -> {}.{}", fk.to_table, target));
        }
        if let Some(default) = &column.default {
            notes.push(format!("DEFAULT {default}"));
        }

        if notes.is_empty() {
            format!("  - {}: {}\n", column.name, column.data_type)
        } else {
            format!(
                "  - {}: {} ({})\n",
                column.name,
                column.data_type,
                notes.join(", ")
            )
        }
    }
}

/// A database table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_columns(mut self, columns: Vec<Column>) -> Self {
        self.columns = columns;
        self
    }

    /// Marks the named columns as the primary key.
    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }
}

/// A table column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub default: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable: true,
            default: None,
        }
    }

    /// Marks the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// A foreign key between two tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub from_table: String,
    pub from_columns: Vec<String>,
    pub to_table: String,
    pub to_columns: Vec<String>,
}

impl ForeignKey {
    pub fn new(
        from_table: impl Into<String>,
        from_column: impl Into<String>,
        to_table: impl Into<String>,
        to_column: impl Into<String>,
    ) -> Self {
        Self {
            from_table: from_table.into(),
            from_columns: vec![from_column.into()],
            to_table: to_table.into(),
            to_columns: vec![to_column.into()],
        }
    }
}
