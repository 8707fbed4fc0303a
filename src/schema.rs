//! Table schema parsing.
//!
//! The table layout for stored telemetry is configured as a compact string of
//! space separated `NAME:TYPE` tokens, for example:
//!
//! ```text
//! LOCATION:VARCHAR(64) TIMESTAMP:TIMESTAMP VOLTS:FLOAT(5,2) AMPS:FLOAT(5,2)
//! ```
//!
//! Types are passed to MySQL verbatim. Column order is preserved and decides
//! the column order of tables created from the schema. Every schema must
//! declare a `TIMESTAMP` column, which records when each row was inserted.

use std::fmt;

use thiserror::Error;

/// Name of the mandatory insertion time column.
pub const TIMESTAMP_COLUMN: &str = "TIMESTAMP";

/// Errors produced while parsing a schema string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("invalid table schema: no columns found")]
    Empty,

    #[error("{0} is an invalid table schema column (expected NAME:TYPE)")]
    MalformedColumn(String),

    #[error("column {0} is declared more than once")]
    DuplicateColumn(String),

    #[error("no TIMESTAMP table column defined")]
    MissingTimestamp,
}

/// A single declared column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
}

/// An ordered, validated set of columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{}", col.name, col.sql_type)?;
        }
        Ok(())
    }
}

/// Parse a schema string into an ordered [`TableSchema`].
///
/// Fails if the string has no tokens, if any token is not exactly one
/// `NAME:TYPE` pair, if a name repeats, or if no `TIMESTAMP` column is
/// declared.
pub fn parse_schema(input: &str) -> Result<TableSchema, SchemaError> {
    let mut columns: Vec<ColumnDef> = Vec::new();

    for token in input.split_whitespace() {
        let mut parts = token.split(':');
        let (name, sql_type) = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(sql_type), None) if !name.is_empty() && !sql_type.is_empty() => {
                (name, sql_type)
            }
            _ => return Err(SchemaError::MalformedColumn(token.to_string())),
        };

        if columns.iter().any(|c| c.name == name) {
            return Err(SchemaError::DuplicateColumn(name.to_string()));
        }

        columns.push(ColumnDef {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
        });
    }

    if columns.is_empty() {
        return Err(SchemaError::Empty);
    }

    if !columns.iter().any(|c| c.name == TIMESTAMP_COLUMN) {
        return Err(SchemaError::MissingTimestamp);
    }

    Ok(TableSchema { columns })
}
