//! Storage, history and messaging collaborators.
//!
//! The engine never talks to a database directly. It compiles SQL and hands
//! it to a [`CardStore`], asks a [`VersionStore`] about card history and
//! publishes expensive recomputation work to a [`WorkQueue`]. The SQLite
//! implementation backs the command-line tool and the test suite.

use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use serde::Serialize;

use crate::domain::{CardId, PropertyId};
use crate::schema::{ColumnType, SchemaRegistry};

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryWorkQueue;
pub use sqlite::SqliteCardStore;

/// Upper bound on ids in one `IN (...)` list.
pub const MAX_IDS_PER_STATEMENT: usize = 1000;

/// Columns that never make a card change count as a new version.
pub const HOUSEKEEPING_COLUMNS: &[&str] = &["id", "card_id", "version", "updated_at"];

/// One result row. Column lookups are case-insensitive and the last column
/// with a given name wins.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Option<String>>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Option<String>>) -> Self {
        Row { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .rposition(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values[i].as_deref())
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }

    pub fn value_at(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }
}

/// Render a stored number the way users typed it: `8` rather than `8.0`.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        let rounded = (value * 100.0).round() / 100.0;
        format!("{}", rounded)
    }
}

/// Storage collaborator: executes compiled SQL and manages physical tables.
pub trait CardStore {
    /// Create the fixed project tables (idempotent).
    fn create_project_tables(&self, schema: &SchemaRegistry) -> Result<()>;

    fn query_rows(&self, sql: &str) -> Result<Vec<Row>>;

    /// Returns the number of affected rows.
    fn execute(&self, sql: &str) -> Result<usize>;

    /// Next value of a named sequence, starting at 1.
    fn next_sequence(&self, name: &str) -> Result<i64>;

    fn table_columns(&self, table: &str) -> Result<Vec<String>>;

    fn add_column(&self, table: &str, column: &str, column_type: ColumnType) -> Result<()>;

    fn remove_column(&self, table: &str, column: &str) -> Result<()>;

    /// Timestamp written to `updated_at`.
    fn now(&self) -> NaiveDateTime;

    /// Run `f` atomically. Nested calls join the outer unit of work.
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        f()
    }

    /// First column of every row.
    fn query_column(&self, sql: &str) -> Result<Vec<Option<String>>> {
        Ok(self
            .query_rows(sql)?
            .into_iter()
            .map(|row| row.value_at(0).map(str::to_string))
            .collect())
    }

    fn query_ids(&self, sql: &str) -> Result<Vec<CardId>> {
        self.query_column(sql)?
            .into_iter()
            .flatten()
            .map(|v| {
                v.parse::<CardId>()
                    .map_err(|_| anyhow!("Expected a card id, got '{}'", v))
            })
            .collect()
    }

    /// First column of the first row, failing when the query returns no
    /// columns at all.
    fn query_scalar(&self, sql: &str) -> Result<Option<String>> {
        let rows = self.query_rows(sql)?;
        match rows.first() {
            Some(row) if row.columns().is_empty() => {
                Err(anyhow!("Query returned no columns: {}", sql))
            }
            Some(row) => Ok(row.value_at(0).map(str::to_string)),
            None => Ok(None),
        }
    }

    fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        Ok(self
            .table_columns(table)?
            .iter()
            .any(|c| c.eq_ignore_ascii_case(column)))
    }
}

/// A persisted snapshot of a card.
#[derive(Debug, Clone, PartialEq)]
pub struct CardVersion {
    pub card_id: CardId,
    pub version: i64,
    pub updated_at: String,
    pub row: Row,
}

/// History collaborator.
pub trait VersionStore {
    /// Append the current state of each card as a version row.
    fn record_versions(&self, schema: &SchemaRegistry, card_ids: &[CardId]) -> Result<usize>;

    fn latest_version(&self, schema: &SchemaRegistry, card_id: CardId)
        -> Result<Option<CardVersion>>;

    fn version(
        &self,
        schema: &SchemaRegistry,
        card_id: CardId,
        version: i64,
    ) -> Result<Option<CardVersion>>;

    /// Whether the current card row differs from its latest version,
    /// ignoring the given columns in addition to [`HOUSEKEEPING_COLUMNS`].
    fn is_new_version(
        &self,
        schema: &SchemaRegistry,
        card_id: CardId,
        ignore: &[&str],
    ) -> Result<bool>;
}

/// Asynchronous recomputation work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RecomputeMessage {
    /// Recompute the listed aggregates on one card.
    CardAggregates {
        card_id: CardId,
        aggregate_ids: Vec<PropertyId>,
    },
    /// Recompute an aggregate on every card returned by `card_ids_sql`.
    CardsMatching {
        aggregate_id: PropertyId,
        card_ids_sql: String,
    },
}

/// Messaging collaborator.
pub trait WorkQueue {
    fn publish(&self, message: RecomputeMessage) -> Result<()>;

    /// Remove and return every pending message in publish order.
    fn drain(&self) -> Vec<RecomputeMessage>;

    fn pending(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_lookup_prefers_last_column() {
        let row = Row::new(
            vec!["Release".to_string(), "release".to_string()],
            vec![Some("3".to_string()), Some("#3 R1".to_string())],
        );
        assert_eq!(row.get("RELEASE"), Some("#3 R1"));
        assert!(row.has_column("release"));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(8.0), "8");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(1.0 / 3.0), "0.33");
        assert_eq!(format_number(-4.0), "-4");
    }
}
