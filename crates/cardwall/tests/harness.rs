//! Test harness for in-process engine testing
//!
//! Provides a fluent API for building a project, installing its tables in
//! an in-memory SQLite database and working with cards.

#![allow(dead_code)]

use cardwall::aggregate::{AggregateDefinition, AggregateScope, RecomputeEngine};
use cardwall::cards::NewCard;
use cardwall::context::EvaluationContext;
use cardwall::domain::{Card, CardId, Project, PropertyId, PropertyKind};
use cardwall::mql::AggregateFunction;
use cardwall::properties::enumeration_values;
use cardwall::query::CardQuery;
use cardwall::schema::SchemaService;
use cardwall::storage::{InMemoryWorkQueue, SqliteCardStore};
use cardwall::tree::{RemovalMode, TreeMembership};

pub type Engine<'a> = RecomputeEngine<'a, SqliteCardStore, InMemoryWorkQueue>;

/// Test harness that provides an isolated project and database per test
pub struct TestHarness {
    pub project: Project,
    pub store: SqliteCardStore,
    pub queue: InMemoryWorkQueue,
}

impl TestHarness {
    pub fn new(identifier: &str) -> Self {
        Self {
            project: Project::new(identifier, identifier),
            store: SqliteCardStore::open_in_memory().unwrap(),
            queue: InMemoryWorkQueue::new(),
        }
    }

    // === Fluent API for project configuration ===

    pub fn card_types(mut self, names: &[&str]) -> Self {
        for name in names {
            self.project.create_card_type(name).unwrap();
        }
        self
    }

    pub fn numeric_enum(mut self, name: &str, values: &[&str], card_types: &[&str]) -> Self {
        self.project
            .create_property(
                name,
                PropertyKind::Enumerated {
                    numeric: true,
                    values: enumeration_values(values),
                },
                card_types,
            )
            .unwrap();
        self
    }

    pub fn text_enum(mut self, name: &str, values: &[&str], card_types: &[&str]) -> Self {
        self.project
            .create_property(
                name,
                PropertyKind::Enumerated {
                    numeric: false,
                    values: enumeration_values(values),
                },
                card_types,
            )
            .unwrap();
        self
    }

    pub fn tree(mut self, name: &str, levels: &[&str]) -> Self {
        self.project.create_tree(name, levels).unwrap();
        self
    }

    pub fn sum(mut self, name: &str, tree: &str, card_type: &str, target: &str) -> Self {
        let definition = self.sum_definition(tree, card_type, target, None);
        self.project.create_aggregate(name, definition).unwrap();
        self
    }

    pub fn formula(mut self, name: &str, formula: &str, card_types: &[&str]) -> Self {
        self.project
            .create_formula(name, formula, false, card_types)
            .unwrap();
        self
    }

    /// Create the project tables. Call after configuring the project.
    pub fn install(self) -> Self {
        SchemaService::new(&self.store)
            .install(&self.project.schema)
            .unwrap();
        self
    }

    pub fn sum_definition(
        &self,
        tree: &str,
        card_type: &str,
        target: &str,
        condition: Option<&str>,
    ) -> AggregateDefinition {
        AggregateDefinition {
            tree_id: self.project.tree(tree).unwrap().id,
            aggregate_card_type: card_type.to_string(),
            scope: AggregateScope::AllDescendants,
            function: AggregateFunction::Sum,
            target_property_id: Some(self.property_id(target)),
            condition: condition.map(str::to_string),
        }
    }

    // === Cards ===

    pub fn engine(&self) -> Engine<'_> {
        RecomputeEngine::new(&self.project, &self.store, &self.queue)
    }

    pub fn create_card(&self, card_type: &str, name: &str, values: &[(&str, &str)]) -> Card {
        let mut new_card = NewCard::new(card_type, name);
        for (property, value) in values {
            new_card = new_card.with_value(*property, *value);
        }
        self.engine().create_card(new_card).unwrap()
    }

    pub fn add_to_tree(&self, tree: &str, card: &Card, parent: Option<&Card>) {
        let engine = self.engine();
        TreeMembership::new(&engine, tree)
            .unwrap()
            .add_card(card.id, parent.map(|p| p.id))
            .unwrap();
    }

    pub fn remove_from_tree(&self, tree: &str, card: &Card, mode: RemovalMode) {
        let engine = self.engine();
        TreeMembership::new(&engine, tree)
            .unwrap()
            .remove_card(card.id, mode)
            .unwrap();
    }

    pub fn reload(&self, card: &Card) -> Card {
        self.engine().cards().load(card.id).unwrap().unwrap()
    }

    pub fn value(&self, card: &Card, property: &str) -> Option<String> {
        let property = self.project.find_property(property).unwrap();
        self.reload(card).value_of(property)
    }

    pub fn property_id(&self, name: &str) -> PropertyId {
        self.project.find_property(name).unwrap().id
    }

    // === Queries ===

    pub fn query(&self, mql: &str) -> CardQuery<'_> {
        CardQuery::parse(&EvaluationContext::new(&self.project), mql).unwrap()
    }

    /// Card numbers matching `mql`, ascending.
    pub fn numbers(&self, mql: &str) -> Vec<i64> {
        let mut numbers = self.query(mql).card_numbers(&self.store).unwrap();
        numbers.sort_unstable();
        numbers
    }

    pub fn ids(&self, mql: &str) -> Vec<CardId> {
        let mut ids = self.query(mql).card_ids(&self.store).unwrap();
        ids.sort_unstable();
        ids
    }
}
