//! Project-scoped schema registry.
//!
//! Every non-predefined property definition owns one physical column on the
//! project's card and card-version tables. The registry is the single source
//! of truth for that mapping; the physical tables are brought in line with it
//! by [`SchemaService::sync`].

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tracing::info;

use crate::domain::{PropertyId, PropertyKind, ValueType};
use crate::storage::CardStore;

/// Shared table recording (card, property, project) triples whose derived
/// value is known to be out of date.
pub const STALE_PROP_DEFS_TABLE: &str = "stale_prop_defs";

/// Prefix of dynamic property columns.
pub const PROPERTY_COLUMN_PREFIX: &str = "cp_";

/// Storage affinity of a property column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Numeric,
    Integer,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Numeric => "NUMERIC",
            ColumnType::Integer => "INTEGER",
        }
    }

    pub fn for_kind(kind: &PropertyKind) -> ColumnType {
        match kind {
            PropertyKind::CardRelationship | PropertyKind::TreeRelationship { .. } => {
                ColumnType::Integer
            }
            PropertyKind::Aggregate(_) => ColumnType::Numeric,
            PropertyKind::Formula(f) if f.output == ValueType::Number => ColumnType::Numeric,
            PropertyKind::Text { numeric: true } | PropertyKind::Enumerated { numeric: true, .. } => {
                ColumnType::Numeric
            }
            _ => ColumnType::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
}

#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    identifier: String,
    columns: BTreeMap<PropertyId, ColumnDescriptor>,
}

impl SchemaRegistry {
    pub fn new(identifier: &str) -> Self {
        SchemaRegistry {
            identifier: identifier.to_string(),
            columns: BTreeMap::new(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn cards_table(&self) -> String {
        format!("{}_cards", self.identifier)
    }

    pub fn versions_table(&self) -> String {
        format!("{}_card_versions", self.identifier)
    }

    pub fn tree_belongings_table(&self) -> String {
        format!("{}_tree_belongings", self.identifier)
    }

    pub fn taggings_table(&self) -> String {
        format!("{}_taggings", self.identifier)
    }

    pub fn plan_works_table(&self) -> String {
        format!("{}_plan_works", self.identifier)
    }

    pub fn column_for(&self, property_id: PropertyId) -> Option<&ColumnDescriptor> {
        self.columns.get(&property_id)
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.values()
    }

    /// Bind a new column for a property; the chosen name is unique within
    /// the project and is never reused while the property exists.
    pub(crate) fn assign(
        &mut self,
        property_id: PropertyId,
        property_name: &str,
        column_type: ColumnType,
    ) -> String {
        if let Some(existing) = self.columns.get(&property_id) {
            return existing.name.clone();
        }
        let base = column_name_for(property_name);
        let mut candidate = base.clone();
        let mut suffix = 1;
        while self.columns.values().any(|c| c.name == candidate) {
            suffix += 1;
            candidate = format!("{}_{}", base, suffix);
        }
        self.columns.insert(
            property_id,
            ColumnDescriptor {
                name: candidate.clone(),
                column_type,
            },
        );
        candidate
    }

    pub(crate) fn release(&mut self, property_id: PropertyId) -> Option<ColumnDescriptor> {
        self.columns.remove(&property_id)
    }
}

/// Physical column name derived from a property name.
pub fn column_name_for(property_name: &str) -> String {
    let mut name = String::from(PROPERTY_COLUMN_PREFIX);
    let mut last_underscore = true;
    for ch in property_name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            name.push(ch.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            name.push('_');
            last_underscore = true;
        }
    }
    while name.ends_with('_') && name.len() > PROPERTY_COLUMN_PREFIX.len() {
        name.pop();
    }
    if name.len() == PROPERTY_COLUMN_PREFIX.len() {
        name.push_str("property");
    }
    name
}

/// Columns added and removed by one [`SchemaService::sync`] call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SchemaChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Applies registry changes to the physical tables.
pub struct SchemaService<'a, S: CardStore> {
    store: &'a S,
}

impl<'a, S: CardStore> SchemaService<'a, S> {
    pub fn new(store: &'a S) -> Self {
        SchemaService { store }
    }

    /// Create the project tables and every registered column.
    pub fn install(&self, registry: &SchemaRegistry) -> Result<SchemaChanges> {
        self.store
            .create_project_tables(registry)
            .with_context(|| format!("Failed to create tables for '{}'", registry.identifier()))?;
        self.sync(registry)
    }

    /// Add missing property columns and drop columns no property owns.
    pub fn sync(&self, registry: &SchemaRegistry) -> Result<SchemaChanges> {
        let mut changes = SchemaChanges::default();
        for table in [registry.cards_table(), registry.versions_table()] {
            let existing = self.store.table_columns(&table)?;
            for column in registry.columns() {
                if !existing.iter().any(|c| c == &column.name) {
                    self.store
                        .add_column(&table, &column.name, column.column_type)?;
                    if table == registry.cards_table() {
                        changes.added.push(column.name.clone());
                    }
                }
            }
            for column in existing
                .iter()
                .filter(|c| c.starts_with(PROPERTY_COLUMN_PREFIX))
            {
                if !registry.columns().any(|c| &c.name == column) {
                    self.store.remove_column(&table, column)?;
                    if table == registry.cards_table() {
                        changes.removed.push(column.clone());
                    }
                }
            }
        }
        if !changes.added.is_empty() || !changes.removed.is_empty() {
            info!(
                project = registry.identifier(),
                added = ?changes.added,
                removed = ?changes.removed,
                "Synchronized card schema"
            );
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteCardStore;

    #[test]
    fn test_column_name_for_sanitizes() {
        assert_eq!(column_name_for("Story Points"), "cp_story_points");
        assert_eq!(column_name_for("  Release Tree - Release "), "cp_release_tree_release");
        assert_eq!(column_name_for("%%"), "cp_property");
    }

    #[test]
    fn test_assign_is_stable_and_unique() {
        let mut registry = SchemaRegistry::new("agile");
        let first = registry.assign(10, "Points", ColumnType::Numeric);
        let again = registry.assign(10, "Renamed", ColumnType::Numeric);
        assert_eq!(first, again);

        let clash = registry.assign(11, "points", ColumnType::Text);
        assert_eq!(clash, "cp_points_2");
        assert_eq!(registry.column_for(11).unwrap().column_type, ColumnType::Text);
    }

    #[test]
    fn test_sync_adds_and_removes_columns() {
        let store = SqliteCardStore::open_in_memory().unwrap();
        let mut registry = SchemaRegistry::new("agile");
        registry.assign(10, "Points", ColumnType::Numeric);
        registry.assign(11, "Status", ColumnType::Text);

        let service = SchemaService::new(&store);
        let changes = service.install(&registry).unwrap();
        assert_eq!(changes.added, vec!["cp_points", "cp_status"]);
        assert!(store.column_exists("agile_card_versions", "cp_status").unwrap());

        registry.release(11);
        let changes = service.sync(&registry).unwrap();
        assert_eq!(changes.removed, vec!["cp_status"]);
        assert!(!store.column_exists("agile_cards", "cp_status").unwrap());
        assert!(store.column_exists("agile_cards", "cp_points").unwrap());
    }
}
