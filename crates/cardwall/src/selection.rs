//! Bulk operations over a set of cards
//!
//! A selection is built from a card query, a list of cards or nothing, and
//! applies property updates, card type changes, tagging and destruction to
//! every card in it. Problems that concern the whole request (an unknown
//! property, an invalid value) abort before anything is written; problems
//! that concern single cards are collected per card in a
//! [`BulkUpdateResult`] while the remaining cards are processed.

use anyhow::Result;
use sea_query::{Alias, Expr, ExprTrait, Func, OnConflict, Query, SimpleExpr, SqliteQueryBuilder};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::aggregate::{RecomputeEngine, RecomputeStats, Seed, StaleMarkers};
use crate::cards::TIMESTAMP_FORMAT;
use crate::domain::{
    Card, CardId, Predefined, PropertyDefinition, PropertyId, PropertyKind, VariableKind,
};
use crate::errors::DomainError;
use crate::properties::ValuePipeline;
use crate::query::CardQuery;
use crate::storage::{CardStore, VersionStore, WorkQueue, MAX_IDS_PER_STATEMENT};
use crate::tree::{RemovalMode, TreeMembership};

/// Result of a bulk operation, keyed by card number
#[derive(Debug, Serialize)]
pub struct BulkUpdateResult {
    /// Cards in the selection
    pub matched: Vec<i64>,
    /// Cards successfully changed
    pub modified: Vec<i64>,
    /// Cards skipped with reasons (number, reason)
    pub skipped: Vec<(i64, String)>,
    /// Cards that failed with errors (number, error)
    pub errors: Vec<(i64, String)>,
    /// Summary statistics
    pub summary: BulkUpdateSummary,
    /// Derived values recomputed along the way
    pub recomputed: RecomputeStats,
}

/// Summary statistics for a bulk operation
#[derive(Debug, Serialize)]
pub struct BulkUpdateSummary {
    pub total_matched: usize,
    pub total_modified: usize,
    pub total_skipped: usize,
    pub total_errors: usize,
}

impl BulkUpdateResult {
    /// Create a new empty result
    pub fn new() -> Self {
        BulkUpdateResult {
            matched: Vec::new(),
            modified: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            summary: BulkUpdateSummary {
                total_matched: 0,
                total_modified: 0,
                total_skipped: 0,
                total_errors: 0,
            },
            recomputed: RecomputeStats::default(),
        }
    }

    /// Compute summary from current data
    pub fn compute_summary(&mut self) {
        self.summary = BulkUpdateSummary {
            total_matched: self.matched.len(),
            total_modified: self.modified.len(),
            total_skipped: self.skipped.len(),
            total_errors: self.errors.len(),
        };
    }

    fn has_error(&self, number: i64) -> bool {
        self.errors.iter().any(|(n, _)| *n == number)
    }

    fn skip(&mut self, number: i64, reason: impl Into<String>) {
        if !self.modified.contains(&number) && !self.skipped.iter().any(|(n, _)| *n == number) {
            self.skipped.push((number, reason.into()));
        }
    }

    fn modify(&mut self, number: i64) {
        self.skipped.retain(|(n, _)| *n != number);
        if !self.modified.contains(&number) {
            self.modified.push(number);
        }
    }
}

impl Default for BulkUpdateResult {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CardSelection<'e, 'a, S, Q>
where
    S: CardStore + VersionStore,
    Q: WorkQueue,
{
    engine: &'e RecomputeEngine<'a, S, Q>,
    card_ids: Vec<CardId>,
}

impl<'e, 'a, S, Q> CardSelection<'e, 'a, S, Q>
where
    S: CardStore + VersionStore,
    Q: WorkQueue,
{
    /// Every card the query matches at the time of the call.
    pub fn from_query(engine: &'e RecomputeEngine<'a, S, Q>, query: &CardQuery<'_>) -> Result<Self> {
        let card_ids = query.card_ids(engine.store())?;
        Ok(Self::from_ids(engine, card_ids))
    }

    pub fn from_cards(engine: &'e RecomputeEngine<'a, S, Q>, cards: &[Card]) -> Self {
        Self::from_ids(engine, cards.iter().map(|c| c.id).collect())
    }

    pub fn from_ids(engine: &'e RecomputeEngine<'a, S, Q>, mut card_ids: Vec<CardId>) -> Self {
        card_ids.sort_unstable();
        card_ids.dedup();
        CardSelection { engine, card_ids }
    }

    pub fn empty(engine: &'e RecomputeEngine<'a, S, Q>) -> Self {
        Self::from_ids(engine, Vec::new())
    }

    pub fn card_ids(&self) -> &[CardId] {
        &self.card_ids
    }

    pub fn len(&self) -> usize {
        self.card_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.card_ids.is_empty()
    }

    fn load(&self) -> Result<Vec<Card>> {
        self.engine.cards().load_many(&self.card_ids)
    }

    fn batch_size(&self) -> usize {
        self.engine.settings().batch_size.clamp(1, MAX_IDS_PER_STATEMENT)
    }

    /// Apply column assignments to `card_ids`, bump their version and
    /// record the new versions.
    fn write(&self, assignments: &[(Alias, SimpleExpr)], card_ids: &[CardId]) -> Result<()> {
        if card_ids.is_empty() {
            return Ok(());
        }
        let store = self.engine.store();
        let project = self.engine.project();
        let now = store.now().format(TIMESTAMP_FORMAT).to_string();
        for batch in card_ids.chunks(self.batch_size()) {
            let mut values = assignments.to_vec();
            values.push((Alias::new("version"), Expr::cust(r#""version" + 1"#)));
            values.push((Alias::new("updated_at"), now.clone().into()));
            let sql = Query::update()
                .table(Alias::new(project.cards_table()))
                .values(values)
                .and_where(Expr::col(Alias::new("id")).is_in(batch.iter().copied()))
                .to_string(SqliteQueryBuilder);
            store.execute(&sql)?;
        }
        store.record_versions(&project.schema, card_ids)?;
        Ok(())
    }

    /// Why a card may not change type or be destroyed: it is the value of
    /// a card variable or of a transition prerequisite or action.
    fn usages_of(&self, card: &Card) -> Vec<String> {
        let project = self.engine.project();
        let number = card.number.to_string();
        let refers = |value: Option<&str>| {
            value.is_some_and(|v| v.trim().trim_start_matches('#') == number)
        };
        let mut reasons = Vec::new();
        for variable in &project.variables {
            if matches!(variable.kind, VariableKind::Card { .. }) && refers(variable.value.as_deref())
            {
                reasons.push(format!(
                    "Card #{} is the value of project variable ({}).",
                    card.number, variable.name
                ));
            }
        }
        for transition in &project.transitions {
            let used = transition
                .prerequisites
                .iter()
                .chain(&transition.actions)
                .any(|assignment| {
                    project
                        .find_property(&assignment.property)
                        .is_some_and(PropertyDefinition::is_relationship)
                        && refers(assignment.value.as_deref())
                });
            if used {
                reasons.push(format!(
                    "Card #{} is used in transition {}.",
                    card.number, transition.name
                ));
            }
        }
        reasons
    }

    /// Set property values on every card. `Type` changes the card type.
    pub fn update_properties(&self, values: &[(&str, Option<&str>)]) -> Result<BulkUpdateResult> {
        let project = self.engine.project();
        let repository = self.engine.cards();
        let pipeline = ValuePipeline::new(project);

        let mut errors = Vec::new();
        let mut new_type = None;
        let mut assignments: Vec<(&PropertyDefinition, Option<String>)> = Vec::new();
        for (name, raw) in values {
            let Some(property) = project.find_property(name) else {
                errors.push(format!("Card property '{}' does not exist!", name));
                continue;
            };
            match property.predefined() {
                Some(Predefined::Type) => {
                    match raw.map(str::trim).filter(|t| !t.is_empty()) {
                        Some(card_type) => new_type = Some(card_type.to_string()),
                        None => errors.push("Type can't be blank.".to_string()),
                    }
                    continue;
                }
                Some(Predefined::Number) => {
                    errors.push("Number cannot be changed.".to_string());
                    continue;
                }
                Some(Predefined::Name) if raw.map_or(true, |v| v.trim().is_empty()) => {
                    errors.push("Name can't be blank.".to_string());
                    continue;
                }
                _ => {}
            }
            if property.is_tree_relationship() {
                errors.push(format!(
                    "{} is set by adding the card to its tree.",
                    property.name
                ));
                continue;
            }
            match pipeline.correct(property, *raw) {
                Ok(value) => match repository.resolve_card_value(property, value) {
                    Ok(value) => assignments.push((property, value)),
                    Err(err) => errors.push(err.to_string()),
                },
                Err(err) => errors.extend(err.messages()),
            }
        }
        if let Some(card_type) = &new_type {
            if project.card_type(card_type).is_none() {
                errors.push(format!("Card type '{}' does not exist.", card_type));
            }
        }
        if !errors.is_empty() {
            return Err(DomainError::Validation(errors).into());
        }

        let mut result = match &new_type {
            Some(card_type) => self.change_card_type(card_type)?,
            None => BulkUpdateResult::new(),
        };
        let cards = self.load()?;
        if result.matched.is_empty() {
            result.matched = cards.iter().map(|c| c.number).collect();
        }
        if assignments.is_empty() {
            for card in &cards {
                result.skip(card.number, "No changes");
            }
            result.compute_summary();
            return Ok(result);
        }

        let mut to_update = Vec::new();
        for card in &cards {
            if result.has_error(card.number) {
                continue;
            }
            let inapplicable: Vec<&str> = assignments
                .iter()
                .filter(|(p, _)| !p.is_predefined() && !p.applies_to(&card.card_type_name))
                .map(|(p, _)| p.name.as_str())
                .collect();
            if !inapplicable.is_empty() {
                result.errors.push((
                    card.number,
                    format!(
                        "{} not applicable to card type {}.",
                        inapplicable.join(", "),
                        card.card_type_name
                    ),
                ));
                continue;
            }
            let unchanged = assignments
                .iter()
                .all(|(p, v)| card.value_of(p).as_deref() == v.as_deref());
            if unchanged {
                result.skip(card.number, "No changes");
            } else {
                to_update.push(card);
            }
        }

        if !to_update.is_empty() {
            let ids: Vec<CardId> = to_update.iter().map(|c| c.id).collect();
            let columns: Vec<(Alias, SimpleExpr)> = assignments
                .iter()
                .map(|(p, v)| (Alias::new(&p.column_name), v.clone().into()))
                .collect();
            let properties: Vec<PropertyId> = assignments.iter().map(|(p, _)| p.id).collect();
            let stats = self.engine.store().transaction(|| {
                self.write(&columns, &ids)?;
                self.engine.properties_changed(&ids, &properties)
            })?;
            result.recomputed.merge(stats);
            for card in &to_update {
                result.modify(card.number);
            }
            info!(
                cards = ids.len(),
                properties = ?assignments.iter().map(|(p, _)| p.name.as_str()).collect::<Vec<_>>(),
                "Updated card properties"
            );
        }
        if !result.errors.is_empty() {
            warn!(errors = result.errors.len(), "Some cards were not updated");
        }
        result.compute_summary();
        Ok(result)
    }

    /// Change the type of every card. Cards leave the trees they were in
    /// (their children move up) and rejoin at the top when the new type is
    /// also part of the tree. Values of properties the new type does not
    /// have are cleared.
    pub fn change_card_type(&self, card_type: &str) -> Result<BulkUpdateResult> {
        let project = self.engine.project();
        let new_type = project
            .card_type(card_type)
            .ok_or_else(|| DomainError::not_found("Card type", card_type))?
            .name
            .clone();

        let cards = self.load()?;
        let mut result = BulkUpdateResult::new();
        result.matched = cards.iter().map(|c| c.number).collect();
        let mut changing = Vec::new();
        for card in cards {
            if card.card_type_name.eq_ignore_ascii_case(&new_type) {
                result.skip(card.number, format!("Card is already a {}.", new_type));
                continue;
            }
            let usages = self.usages_of(&card);
            if !usages.is_empty() {
                result.errors.push((card.number, usages.join(" ")));
                continue;
            }
            changing.push(card);
        }
        if changing.is_empty() {
            result.compute_summary();
            return Ok(result);
        }

        let ids: Vec<CardId> = changing.iter().map(|c| c.id).collect();
        let mut columns: Vec<(Alias, SimpleExpr)> = project
            .properties
            .iter()
            .filter(|p| !p.is_predefined() && !p.is_tree_relationship() && !p.applies_to(&new_type))
            .map(|p| (Alias::new(&p.column_name), Option::<String>::None.into()))
            .collect();
        columns.push((
            Alias::new(Predefined::Type.column_name()),
            new_type.as_str().into(),
        ));

        // relationships and belongings are written first; the derived
        // values are then recomputed in one run over the merged seeds
        let stats = self.engine.store().transaction(|| {
            let mut seeds = Vec::new();
            let mut old_ancestors = BTreeSet::new();
            let mut rejoin: Vec<(&str, CardId)> = Vec::new();
            for tree in &project.trees {
                let membership = TreeMembership::new(self.engine, &tree.name)?;
                for card in &changing {
                    if !membership.contains(card.id)? {
                        continue;
                    }
                    let pending = membership.detach(card.id, RemovalMode::SingleCard)?;
                    old_ancestors.extend(pending.old_ancestors.iter().filter(|id| **id != card.id));
                    seeds.extend(pending.seeds);
                    if tree.contains(&new_type) {
                        rejoin.push((tree.name.as_str(), card.id));
                    }
                }
            }

            self.write(&columns, &ids)?;
            for (tree, card_id) in rejoin {
                let pending = TreeMembership::new(self.engine, tree)?.place(card_id, None)?;
                seeds.extend(pending.seeds);
            }
            let old_ancestors: Vec<CardId> = old_ancestors.into_iter().collect();
            seeds.extend(self.engine.card_type_seeds(&ids, &old_ancestors));
            self.engine.run(seeds, false)
        })?;

        result.recomputed = stats;
        for card in &changing {
            result.modify(card.number);
        }
        info!(cards = changing.len(), card_type = %new_type, "Changed card type");
        result.compute_summary();
        Ok(result)
    }

    /// Tags currently on the selected cards, lowercased, per card.
    fn current_tags(&self) -> Result<BTreeMap<CardId, BTreeSet<String>>> {
        let table = Alias::new(self.engine.project().schema.taggings_table());
        let mut tags: BTreeMap<CardId, BTreeSet<String>> = BTreeMap::new();
        for batch in self.card_ids.chunks(MAX_IDS_PER_STATEMENT) {
            let sql = Query::select()
                .columns([Alias::new("card_id"), Alias::new("tag")])
                .from(table.clone())
                .and_where(Expr::col(Alias::new("card_id")).is_in(batch.iter().copied()))
                .to_string(SqliteQueryBuilder);
            for row in self.engine.store().query_rows(&sql)? {
                let (Some(card_id), Some(tag)) = (
                    row.get("card_id").and_then(|v| v.parse().ok()),
                    row.get("tag"),
                ) else {
                    continue;
                };
                tags.entry(card_id).or_default().insert(tag.to_lowercase());
            }
        }
        Ok(tags)
    }

    fn clean_tags(tags: &[&str]) -> Result<Vec<String>> {
        let cleaned: Vec<String> = tags
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if cleaned.is_empty() {
            return Err(DomainError::Validation(vec!["Tag can't be blank.".to_string()]).into());
        }
        Ok(cleaned)
    }

    pub fn tag(&self, tags: &[&str]) -> Result<BulkUpdateResult> {
        let tags = Self::clean_tags(tags)?;
        let cards = self.load()?;
        let current = self.current_tags()?;
        let mut result = BulkUpdateResult::new();
        result.matched = cards.iter().map(|c| c.number).collect();

        let mut rows = Vec::new();
        for card in &cards {
            let existing = current.get(&card.id);
            let missing: Vec<&String> = tags
                .iter()
                .filter(|t| !existing.is_some_and(|e| e.contains(&t.to_lowercase())))
                .collect();
            if missing.is_empty() {
                result.skip(card.number, "Already tagged");
                continue;
            }
            rows.extend(missing.into_iter().map(|t| (card.id, t.clone())));
            result.modify(card.number);
        }

        let table = Alias::new(self.engine.project().schema.taggings_table());
        self.engine.store().transaction(|| {
            for batch in rows.chunks(MAX_IDS_PER_STATEMENT) {
                let mut insert = Query::insert();
                insert
                    .into_table(table.clone())
                    .columns([Alias::new("card_id"), Alias::new("tag")])
                    .on_conflict(
                        OnConflict::columns([Alias::new("card_id"), Alias::new("tag")])
                            .do_nothing()
                            .to_owned(),
                    );
                for (card_id, tag) in batch {
                    insert.values([(*card_id).into(), tag.as_str().into()])?;
                }
                self.engine
                    .store()
                    .execute(&insert.to_string(SqliteQueryBuilder))?;
            }
            Ok(())
        })?;
        info!(cards = result.modified.len(), tags = ?tags, "Tagged cards");
        result.compute_summary();
        Ok(result)
    }

    pub fn untag(&self, tags: &[&str]) -> Result<BulkUpdateResult> {
        let tags = Self::clean_tags(tags)?;
        let lowered: Vec<String> = tags.iter().map(|t| t.to_lowercase()).collect();
        let cards = self.load()?;
        let current = self.current_tags()?;
        let mut result = BulkUpdateResult::new();
        result.matched = cards.iter().map(|c| c.number).collect();

        let mut ids = Vec::new();
        for card in &cards {
            let tagged = current
                .get(&card.id)
                .is_some_and(|e| lowered.iter().any(|t| e.contains(t)));
            if tagged {
                ids.push(card.id);
                result.modify(card.number);
            } else {
                result.skip(card.number, format!("Not tagged with {}", tags.join(", ")));
            }
        }

        let table = Alias::new(self.engine.project().schema.taggings_table());
        self.engine.store().transaction(|| {
            for batch in ids.chunks(MAX_IDS_PER_STATEMENT) {
                let sql = Query::delete()
                    .from_table(table.clone())
                    .and_where(Expr::col(Alias::new("card_id")).is_in(batch.iter().copied()))
                    .and_where(
                        Expr::expr(Func::lower(Expr::col(Alias::new("tag"))))
                            .is_in(lowered.iter().cloned()),
                    )
                    .to_string(SqliteQueryBuilder);
                self.engine.store().execute(&sql)?;
            }
            Ok(())
        })?;
        info!(cards = result.modified.len(), tags = ?tags, "Removed tags from cards");
        result.compute_summary();
        Ok(result)
    }

    /// Delete every card. Cards leave their trees first (children move up),
    /// and card relationship values pointing at them are cleared. History
    /// rows are kept.
    pub fn destroy(&self) -> Result<BulkUpdateResult> {
        let project = self.engine.project();
        let store = self.engine.store();
        let cards = self.load()?;
        let mut result = BulkUpdateResult::new();
        result.matched = cards.iter().map(|c| c.number).collect();
        let mut doomed = Vec::new();
        for card in &cards {
            let usages = self.usages_of(card);
            if usages.is_empty() {
                doomed.push(card);
            } else {
                result.errors.push((card.number, usages.join(" ")));
            }
        }
        if doomed.is_empty() {
            result.compute_summary();
            return Ok(result);
        }
        let ids: Vec<CardId> = doomed.iter().map(|c| c.id).collect();
        let cards_table = Alias::new(project.cards_table());

        let stats = store.transaction(|| {
            let mut seeds = Vec::new();
            for tree in &project.trees {
                let membership = TreeMembership::new(self.engine, &tree.name)?;
                for card_id in &ids {
                    if membership.contains(*card_id)? {
                        seeds.extend(membership.detach(*card_id, RemovalMode::SingleCard)?.seeds);
                    }
                }
            }

            for property in project
                .properties
                .iter()
                .filter(|p| matches!(p.kind, PropertyKind::CardRelationship))
            {
                let mut referencing = Vec::new();
                for batch in ids.chunks(self.batch_size()) {
                    let sql = Query::select()
                        .column(Alias::new("id"))
                        .from(cards_table.clone())
                        .and_where(
                            Expr::col(Alias::new(&property.column_name))
                                .is_in(batch.iter().copied()),
                        )
                        .to_string(SqliteQueryBuilder);
                    referencing.extend(store.query_ids(&sql)?);
                }
                referencing.retain(|id| !ids.contains(id));
                if referencing.is_empty() {
                    continue;
                }
                self.write(
                    &[(Alias::new(&property.column_name), Option::<i64>::None.into())],
                    &referencing,
                )?;
                seeds.push(Seed::Changed {
                    cards: referencing,
                    properties: vec![property.id],
                });
            }

            StaleMarkers::new(store, &project.identifier).forget_cards(&ids)?;
            for table in [
                project.schema.taggings_table(),
                project.schema.plan_works_table(),
            ] {
                for batch in ids.chunks(MAX_IDS_PER_STATEMENT) {
                    let sql = Query::delete()
                        .from_table(Alias::new(&table))
                        .and_where(Expr::col(Alias::new("card_id")).is_in(batch.iter().copied()))
                        .to_string(SqliteQueryBuilder);
                    store.execute(&sql)?;
                }
            }
            for batch in ids.chunks(MAX_IDS_PER_STATEMENT) {
                let sql = Query::delete()
                    .from_table(cards_table.clone())
                    .and_where(Expr::col(Alias::new("id")).is_in(batch.iter().copied()))
                    .to_string(SqliteQueryBuilder);
                store.execute(&sql)?;
            }
            // destroyed cards drop out of every scope; their ancestors and
            // former children are recomputed once
            self.engine.run(seeds, false)
        })?;

        result.recomputed = stats;
        for card in &doomed {
            result.modify(card.number);
        }
        info!(cards = doomed.len(), "Destroyed cards");
        result.compute_summary();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateDefinition, AggregateScope};
    use crate::cards::NewCard;
    use crate::domain::{Project, ProjectVariable, Transition, TransitionValue};
    use crate::mql::AggregateFunction;
    use crate::properties::enumeration_values;
    use crate::schema::SchemaService;
    use crate::storage::{InMemoryWorkQueue, SqliteCardStore};

    fn setup() -> (Project, SqliteCardStore) {
        let mut project = Project::new("agile", "Agile");
        for card_type in ["Release", "Story", "Bug"] {
            project.create_card_type(card_type).unwrap();
        }
        let points = project
            .create_property(
                "Points",
                PropertyKind::Enumerated {
                    numeric: true,
                    values: enumeration_values(&["1", "2", "3", "5"]),
                },
                &["Story"],
            )
            .unwrap();
        project
            .create_property(
                "Status",
                PropertyKind::Enumerated {
                    numeric: false,
                    values: enumeration_values(&["open", "done"]),
                },
                &["Story", "Bug"],
            )
            .unwrap();
        project
            .create_property("Blocked By", PropertyKind::CardRelationship, &["Story", "Bug"])
            .unwrap();
        let tree_id = project.create_tree("Planning", &["Release", "Story"]).unwrap();
        project
            .create_aggregate(
                "Total Points",
                AggregateDefinition {
                    tree_id,
                    aggregate_card_type: "Release".to_string(),
                    scope: AggregateScope::AllDescendants,
                    function: AggregateFunction::Sum,
                    target_property_id: Some(points),
                    condition: None,
                },
            )
            .unwrap();
        let store = SqliteCardStore::open_in_memory().unwrap();
        SchemaService::new(&store).install(&project.schema).unwrap();
        (project, store)
    }

    fn value(engine: &RecomputeEngine<'_, SqliteCardStore, InMemoryWorkQueue>, id: CardId, property: &str) -> Option<String> {
        let card = engine.cards().load(id).unwrap().unwrap();
        card.value_of(engine.project().find_property(property).unwrap())
    }

    #[test]
    fn test_update_properties_skips_unchanged_and_reports_inapplicable() {
        let (project, store) = setup();
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let s1 = engine
            .create_card(NewCard::new("Story", "S1").with_value("Points", "3"))
            .unwrap();
        let s2 = engine.create_card(NewCard::new("Story", "S2")).unwrap();
        let bug = engine.create_card(NewCard::new("Bug", "B1")).unwrap();

        let selection = CardSelection::from_ids(&engine, vec![s1.id, s2.id, bug.id]);
        let result = selection.update_properties(&[("points", Some("3.0"))]).unwrap();
        assert_eq!(result.matched, vec![1, 2, 3]);
        assert_eq!(result.modified, vec![2]);
        assert_eq!(result.skipped, vec![(1, "No changes".to_string())]);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].0, 3);
        assert_eq!(result.summary.total_errors, 1);
        assert_eq!(value(&engine, s2.id, "Points").as_deref(), Some("3"));
        assert_eq!(engine.cards().load(s2.id).unwrap().unwrap().version, 2);
    }

    #[test]
    fn test_structural_errors_abort_before_writing() {
        let (project, store) = setup();
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let story = engine.create_card(NewCard::new("Story", "S1")).unwrap();
        let selection = CardSelection::from_cards(&engine, &[story.clone()]);
        let err = selection
            .update_properties(&[("Owner", Some("bob")), ("Status", Some("blocked"))])
            .unwrap_err();
        let messages = err.downcast_ref::<DomainError>().unwrap().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(engine.cards().load(story.id).unwrap().unwrap().version, 1);
    }

    #[test]
    fn test_update_recomputes_aggregates_of_ancestors() {
        let (project, store) = setup();
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let release = engine.create_card(NewCard::new("Release", "R1")).unwrap();
        let story = engine
            .create_card(NewCard::new("Story", "S1").with_value("Points", "2"))
            .unwrap();
        let tree = TreeMembership::new(&engine, "Planning").unwrap();
        tree.add_card(release.id, None).unwrap();
        tree.add_card(story.id, Some(release.id)).unwrap();
        assert_eq!(value(&engine, release.id, "Total Points").as_deref(), Some("2"));

        let result = CardSelection::from_ids(&engine, vec![story.id])
            .update_properties(&[("Points", Some("5"))])
            .unwrap();
        let total = project.find_property("Total Points").unwrap().id;
        assert_eq!(result.recomputed.aggregate_cards(total), vec![release.id]);
        assert_eq!(value(&engine, release.id, "Total Points").as_deref(), Some("5"));
    }

    #[test]
    fn test_card_type_change_clears_values_and_leaves_tree() {
        let (project, store) = setup();
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let release = engine.create_card(NewCard::new("Release", "R1")).unwrap();
        let story = engine
            .create_card(
                NewCard::new("Story", "S1")
                    .with_value("Points", "3")
                    .with_value("Status", "open"),
            )
            .unwrap();
        let tree = TreeMembership::new(&engine, "Planning").unwrap();
        tree.add_card(release.id, None).unwrap();
        tree.add_card(story.id, Some(release.id)).unwrap();

        let result = CardSelection::from_ids(&engine, vec![story.id])
            .update_properties(&[("Type", Some("bug"))])
            .unwrap();
        assert_eq!(result.modified, vec![story.number]);
        let card = engine.cards().load(story.id).unwrap().unwrap();
        assert_eq!(card.card_type_name, "Bug");
        assert_eq!(value(&engine, story.id, "Points"), None);
        assert_eq!(value(&engine, story.id, "Status").as_deref(), Some("open"));
        assert!(!tree.contains(story.id).unwrap());
        assert_eq!(value(&engine, release.id, "Total Points"), None);
    }

    #[test]
    fn test_card_type_change_refused_for_referenced_cards() {
        let (mut project, store) = setup();
        project.add_variable(ProjectVariable {
            name: "Current Release".to_string(),
            kind: VariableKind::Card {
                card_type: Some("Release".to_string()),
            },
            value: Some("1".to_string()),
            property_ids: Vec::new(),
        });
        project.add_transition(Transition {
            name: "Block".to_string(),
            card_type: Some("Story".to_string()),
            prerequisites: Vec::new(),
            actions: vec![TransitionValue {
                property: "Blocked By".to_string(),
                value: Some("#1".to_string()),
            }],
        });
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let release = engine.create_card(NewCard::new("Release", "R1")).unwrap();
        let other = engine.create_card(NewCard::new("Release", "R2")).unwrap();

        let result = CardSelection::from_ids(&engine, vec![release.id, other.id])
            .change_card_type("Story")
            .unwrap();
        assert_eq!(result.modified, vec![2]);
        assert_eq!(result.errors.len(), 1);
        let (number, message) = &result.errors[0];
        assert_eq!(*number, 1);
        assert!(message.contains("project variable (Current Release)"));
        assert!(message.contains("transition Block"));
        assert_eq!(
            engine.cards().load(release.id).unwrap().unwrap().card_type_name,
            "Release"
        );
    }

    #[test]
    fn test_tag_and_untag() {
        let (project, store) = setup();
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let a = engine.create_card(NewCard::new("Story", "A")).unwrap();
        let b = engine.create_card(NewCard::new("Story", "B")).unwrap();

        CardSelection::from_ids(&engine, vec![a.id])
            .tag(&["Urgent"])
            .unwrap();
        let both = CardSelection::from_ids(&engine, vec![a.id, b.id]);
        let result = both.tag(&["urgent"]).unwrap();
        assert_eq!(result.modified, vec![2]);
        assert_eq!(result.skipped.len(), 1);

        let query = CardQuery::parse(&engine.context(), "WHERE TAGGED WITH urgent").unwrap();
        assert_eq!(query.card_ids(&store).unwrap(), vec![a.id, b.id]);

        let result = both.untag(&["URGENT"]).unwrap();
        assert_eq!(result.summary.total_modified, 2);
        assert!(query.card_ids(&store).unwrap().is_empty());
        assert!(both.tag(&["  "]).is_err());
    }

    #[test]
    fn test_destroy_clears_references_and_tree_membership() {
        let (project, store) = setup();
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let release = engine.create_card(NewCard::new("Release", "R1")).unwrap();
        let story = engine
            .create_card(NewCard::new("Story", "S1").with_value("Points", "5"))
            .unwrap();
        let bug = engine
            .create_card(NewCard::new("Bug", "B1").with_value("Blocked By", "#2"))
            .unwrap();
        let tree = TreeMembership::new(&engine, "Planning").unwrap();
        tree.add_card(release.id, None).unwrap();
        tree.add_card(story.id, Some(release.id)).unwrap();

        let selection = CardSelection::from_ids(&engine, vec![story.id]);
        let result = selection.destroy().unwrap();
        assert_eq!(result.modified, vec![2]);
        assert!(engine.cards().load(story.id).unwrap().is_none());
        assert_eq!(value(&engine, bug.id, "Blocked By"), None);
        assert_eq!(tree.members().unwrap(), vec![release.id]);
        assert_eq!(value(&engine, release.id, "Total Points"), None);
        assert!(CardSelection::empty(&engine).destroy().unwrap().matched.is_empty());
    }
}
