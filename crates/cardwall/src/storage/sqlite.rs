//! SQLite implementation of the storage and history collaborators.

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use std::cell::Cell;
use std::path::Path;
use tracing::{debug, warn};

use super::{
    format_number, CardStore, CardVersion, Row, VersionStore, HOUSEKEEPING_COLUMNS,
    MAX_IDS_PER_STATEMENT,
};
use crate::domain::CardId;
use crate::schema::{ColumnType, SchemaRegistry, STALE_PROP_DEFS_TABLE};

const FIXED_CARD_COLUMNS: &[&str] = &["number", "name", "description", "card_type_name"];

#[derive(Debug)]
pub struct SqliteCardStore {
    conn: Connection,
    clock: Cell<Option<NaiveDateTime>>,
    savepoint_depth: Cell<usize>,
}

impl SqliteCardStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open card database {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS sequences (
              name TEXT PRIMARY KEY,
              value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {stale} (
              card_id INTEGER NOT NULL,
              prop_def_id INTEGER NOT NULL,
              project_id TEXT NOT NULL,
              PRIMARY KEY (card_id, prop_def_id, project_id)
            );
            "#,
            stale = STALE_PROP_DEFS_TABLE
        ))?;
        Ok(SqliteCardStore {
            conn,
            clock: Cell::new(None),
            savepoint_depth: Cell::new(0),
        })
    }

    /// Pin the clock used for `updated_at`.
    pub fn set_time(&self, time: NaiveDateTime) {
        self.clock.set(Some(time));
    }

    fn load_card_row(&self, schema: &SchemaRegistry, card_id: CardId) -> Result<Option<Row>> {
        let sql = format!(
            r#"SELECT * FROM "{}" WHERE "id" = {}"#,
            schema.cards_table(),
            card_id
        );
        Ok(self.query_rows(&sql)?.into_iter().next())
    }

    fn load_version(&self, sql: &str) -> Result<Option<CardVersion>> {
        let Some(row) = self.query_rows(sql)?.into_iter().next() else {
            return Ok(None);
        };
        let card_id = row
            .get("card_id")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| anyhow!("Version row without card_id"))?;
        let version = row
            .get("version")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| anyhow!("Version row without version"))?;
        let updated_at = row.get("updated_at").unwrap_or_default().to_string();
        Ok(Some(CardVersion {
            card_id,
            version,
            updated_at,
            row,
        }))
    }
}

fn value_to_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(format_number(f)),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}

fn id_list(ids: &[CardId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl CardStore for SqliteCardStore {
    fn create_project_tables(&self, schema: &SchemaRegistry) -> Result<()> {
        self.conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{cards}" (
              id INTEGER PRIMARY KEY,
              number INTEGER NOT NULL UNIQUE,
              name TEXT NOT NULL,
              description TEXT,
              card_type_name TEXT NOT NULL,
              version INTEGER NOT NULL DEFAULT 1,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS "{versions}" (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              card_id INTEGER NOT NULL,
              version INTEGER NOT NULL,
              number INTEGER NOT NULL,
              name TEXT NOT NULL,
              description TEXT,
              card_type_name TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS "{belongings}" (
              tree_configuration_id INTEGER NOT NULL,
              card_id INTEGER NOT NULL,
              PRIMARY KEY (tree_configuration_id, card_id)
            );

            CREATE TABLE IF NOT EXISTS "{taggings}" (
              card_id INTEGER NOT NULL,
              tag TEXT NOT NULL,
              PRIMARY KEY (card_id, tag)
            );

            CREATE TABLE IF NOT EXISTS "{plan_works}" (
              card_id INTEGER NOT NULL,
              plan_name TEXT NOT NULL,
              PRIMARY KEY (card_id, plan_name)
            );
            "#,
            cards = schema.cards_table(),
            versions = schema.versions_table(),
            belongings = schema.tree_belongings_table(),
            taggings = schema.taggings_table(),
            plan_works = schema.plan_works_table(),
        ))?;
        Ok(())
    }

    fn query_rows(&self, sql: &str) -> Result<Vec<Row>> {
        debug!(sql, "query");
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("Failed to prepare query: {}", sql))?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut rows = stmt.query([])?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for index in 0..columns.len() {
                values.push(value_to_text(row.get_ref(index)?));
            }
            result.push(Row::new(columns.clone(), values));
        }
        Ok(result)
    }

    fn execute(&self, sql: &str) -> Result<usize> {
        debug!(sql, "execute");
        self.conn
            .execute(sql, [])
            .with_context(|| format!("Failed to execute: {}", sql))
    }

    fn next_sequence(&self, name: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sequences (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            params![name],
        )?;
        let value = self.conn.query_row(
            "SELECT value FROM sequences WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!(r#"PRAGMA table_info("{}")"#, table))?;
        let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
        Ok(names.collect::<Result<Vec<_>, _>>()?)
    }

    fn add_column(&self, table: &str, column: &str, column_type: ColumnType) -> Result<()> {
        self.execute(&format!(
            r#"ALTER TABLE "{}" ADD COLUMN "{}" {}"#,
            table,
            column,
            column_type.sql_type()
        ))?;
        Ok(())
    }

    fn remove_column(&self, table: &str, column: &str) -> Result<()> {
        self.execute(&format!(
            r#"ALTER TABLE "{}" DROP COLUMN "{}""#,
            table, column
        ))?;
        Ok(())
    }

    fn now(&self) -> NaiveDateTime {
        self.clock.get().unwrap_or_else(|| Utc::now().naive_utc())
    }

    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let depth = self.savepoint_depth.get();
        let name = format!("cardwall_{}", depth);
        self.conn.execute_batch(&format!("SAVEPOINT {}", name))?;
        self.savepoint_depth.set(depth + 1);
        let result = f();
        self.savepoint_depth.set(depth);
        match result {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {}", name))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
                {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(err)
            }
        }
    }
}

impl VersionStore for SqliteCardStore {
    fn record_versions(&self, schema: &SchemaRegistry, card_ids: &[CardId]) -> Result<usize> {
        let mut columns: Vec<String> = FIXED_CARD_COLUMNS.iter().map(|c| c.to_string()).collect();
        columns.extend(schema.columns().map(|c| c.name.clone()));
        let quoted = columns
            .iter()
            .map(|c| format!(r#""{}""#, c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut recorded = 0;
        for batch in card_ids.chunks(MAX_IDS_PER_STATEMENT) {
            recorded += self.execute(&format!(
                r#"INSERT INTO "{versions}" ("card_id", "version", "updated_at", {cols})
                   SELECT "id", "version", "updated_at", {cols} FROM "{cards}" WHERE "id" IN ({ids})"#,
                versions = schema.versions_table(),
                cards = schema.cards_table(),
                cols = quoted,
                ids = id_list(batch),
            ))?;
        }
        Ok(recorded)
    }

    fn latest_version(
        &self,
        schema: &SchemaRegistry,
        card_id: CardId,
    ) -> Result<Option<CardVersion>> {
        self.load_version(&format!(
            r#"SELECT * FROM "{}" WHERE "card_id" = {} ORDER BY "version" DESC, "id" DESC LIMIT 1"#,
            schema.versions_table(),
            card_id
        ))
    }

    fn version(
        &self,
        schema: &SchemaRegistry,
        card_id: CardId,
        version: i64,
    ) -> Result<Option<CardVersion>> {
        self.load_version(&format!(
            r#"SELECT * FROM "{}" WHERE "card_id" = {} AND "version" = {} ORDER BY "id" DESC LIMIT 1"#,
            schema.versions_table(),
            card_id,
            version
        ))
    }

    fn is_new_version(
        &self,
        schema: &SchemaRegistry,
        card_id: CardId,
        ignore: &[&str],
    ) -> Result<bool> {
        let current = self
            .load_card_row(schema, card_id)?
            .ok_or_else(|| anyhow!("Card {} not found", card_id))?;
        let Some(latest) = self.latest_version(schema, card_id)? else {
            return Ok(true);
        };
        let changed = current.columns().iter().any(|column| {
            let skipped = HOUSEKEEPING_COLUMNS
                .iter()
                .chain(ignore.iter())
                .any(|i| i.eq_ignore_ascii_case(column));
            !skipped && current.get(column) != latest.row.get(column)
        });
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaService;

    fn store_with_schema() -> (SqliteCardStore, SchemaRegistry) {
        let store = SqliteCardStore::open_in_memory().unwrap();
        let mut schema = SchemaRegistry::new("t");
        schema.assign(10, "Points", ColumnType::Numeric);
        SchemaService::new(&store).install(&schema).unwrap();
        store
            .execute(
                r#"INSERT INTO "t_cards" (id, number, name, card_type_name, updated_at, cp_points)
                   VALUES (1, 1, 'First', 'Story', '2024-01-01 10:00:00', '3')"#,
            )
            .unwrap();
        (store, schema)
    }

    #[test]
    fn test_query_rows_renders_numbers_without_fraction() {
        let (store, _) = store_with_schema();
        store
            .execute(r#"UPDATE "t_cards" SET cp_points = 8.0 WHERE id = 1"#)
            .unwrap();
        let rows = store
            .query_rows(r#"SELECT cp_points AS "Points", 2.5 AS half FROM "t_cards""#)
            .unwrap();
        assert_eq!(rows[0].get("Points"), Some("8"));
        assert_eq!(rows[0].get("half"), Some("2.5"));
    }

    #[test]
    fn test_next_sequence_increments_per_name() {
        let store = SqliteCardStore::open_in_memory().unwrap();
        assert_eq!(store.next_sequence("cards").unwrap(), 1);
        assert_eq!(store.next_sequence("cards").unwrap(), 2);
        assert_eq!(store.next_sequence("numbers").unwrap(), 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let (store, _) = store_with_schema();
        let result: Result<()> = store.transaction(|| {
            store.execute(r#"UPDATE "t_cards" SET name = 'Changed' WHERE id = 1"#)?;
            Err(anyhow!("boom"))
        });
        assert!(result.is_err());
        let name = store
            .query_scalar(r#"SELECT name FROM "t_cards" WHERE id = 1"#)
            .unwrap();
        assert_eq!(name.as_deref(), Some("First"));
    }

    #[test]
    fn test_version_tracking() {
        let (store, schema) = store_with_schema();
        assert!(store.is_new_version(&schema, 1, &[]).unwrap());

        store.record_versions(&schema, &[1]).unwrap();
        assert!(!store.is_new_version(&schema, 1, &[]).unwrap());

        store
            .execute(r#"UPDATE "t_cards" SET cp_points = 5 WHERE id = 1"#)
            .unwrap();
        assert!(store.is_new_version(&schema, 1, &[]).unwrap());
        assert!(!store.is_new_version(&schema, 1, &["cp_points"]).unwrap());

        let latest = store.latest_version(&schema, 1).unwrap().unwrap();
        assert_eq!(latest.version, 1);
        assert_eq!(latest.row.get("cp_points"), Some("3"));
        assert!(store.version(&schema, 1, 2).unwrap().is_none());
    }
}
