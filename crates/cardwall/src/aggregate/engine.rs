//! Incremental recomputation of formula and aggregate values.
//!
//! Every entry point turns a change into seeds, then walks derived
//! properties once in dependency order. Each property is applied as one
//! set-oriented pass over the cards in its scope, and the cards whose value
//! actually changed feed the properties that depend on it. A property is
//! never revisited within one run.

use anyhow::{anyhow, Context, Result};
use sea_query::{Alias, Expr, ExprTrait, Func, Query, SqliteQueryBuilder};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::{AggregateDefinition, AggregateEvent, AggregateState, StaleMarkers};
use crate::cards::TIMESTAMP_FORMAT;
use crate::context::EvaluationContext;
use crate::domain::{
    CardId, FormulaDefinition, Project, PropertyDefinition, PropertyId, PropertyKind, TreeId,
    TYPE_PROPERTY_ID,
};
use crate::formula::FormulaExpr;
use crate::graph::{property_dependencies, property_nodes, DependencyGraph, PropertyNode};
use crate::mql::{Condition, Operator, Value};
use crate::query::CardQuery;
use crate::storage::{CardStore, RecomputeMessage, VersionStore, WorkQueue, MAX_IDS_PER_STATEMENT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Ids per `IN (...)` slice.
    pub batch_size: usize,
    /// Above this many cards a new aggregate is computed in the background.
    pub inline_recompute_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            batch_size: MAX_IDS_PER_STATEMENT,
            inline_recompute_limit: 50,
        }
    }
}

/// What one engine call did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecomputeStats {
    /// (aggregate, card) pairs computed inline.
    pub aggregates: Vec<(PropertyId, CardId)>,
    /// (formula, card) pairs whose value changed.
    pub formulas: Vec<(PropertyId, CardId)>,
    /// Work items published to the queue.
    pub enqueued: usize,
    /// Statements sent to the store.
    pub statements: usize,
}

impl RecomputeStats {
    pub fn aggregate_cards(&self, property: PropertyId) -> Vec<CardId> {
        self.aggregates
            .iter()
            .filter(|(p, _)| *p == property)
            .map(|(_, c)| *c)
            .collect()
    }

    pub fn formula_cards(&self, property: PropertyId) -> Vec<CardId> {
        self.formulas
            .iter()
            .filter(|(p, _)| *p == property)
            .map(|(_, c)| *c)
            .collect()
    }

    pub fn merge(&mut self, other: RecomputeStats) {
        self.aggregates.extend(other.aggregates);
        self.formulas.extend(other.formulas);
        self.enqueued += other.enqueued;
        self.statements += other.statements;
    }
}

/// Starting point of a recompute run.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Seed {
    /// Values of `properties` changed on `cards`.
    Changed {
        cards: Vec<CardId>,
        properties: Vec<PropertyId>,
    },
    /// Recompute `property` on `cards` regardless of inputs.
    Recompute {
        property: PropertyId,
        cards: Vec<CardId>,
    },
}

pub struct RecomputeEngine<'a, S, Q>
where
    S: CardStore + VersionStore,
    Q: WorkQueue,
{
    project: &'a Project,
    store: &'a S,
    queue: &'a Q,
    settings: EngineSettings,
}

impl<'a, S, Q> RecomputeEngine<'a, S, Q>
where
    S: CardStore + VersionStore,
    Q: WorkQueue,
{
    pub fn new(project: &'a Project, store: &'a S, queue: &'a Q) -> Self {
        RecomputeEngine {
            project,
            store,
            queue,
            settings: EngineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn project(&self) -> &'a Project {
        self.project
    }

    pub fn store(&self) -> &'a S {
        self.store
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub(crate) fn context(&self) -> EvaluationContext<'a> {
        EvaluationContext::new(self.project)
    }

    fn markers(&self) -> StaleMarkers<'a, S> {
        StaleMarkers::new(self.store, &self.project.identifier)
    }

    fn batch_size(&self) -> usize {
        self.settings.batch_size.clamp(1, MAX_IDS_PER_STATEMENT)
    }

    fn execute(&self, sql: &str, stats: &mut RecomputeStats) -> Result<usize> {
        stats.statements += 1;
        self.store.execute(sql)
    }

    fn query_ids(&self, sql: &str, stats: &mut RecomputeStats) -> Result<Vec<CardId>> {
        stats.statements += 1;
        self.store.query_ids(sql)
    }

    fn aggregate_property(
        &self,
        property_id: PropertyId,
    ) -> Result<(&'a PropertyDefinition, &'a AggregateDefinition)> {
        let property = self
            .project
            .property(property_id)
            .ok_or_else(|| anyhow!("Property {} not found", property_id))?;
        let aggregate = property
            .aggregate()
            .ok_or_else(|| anyhow!("{} is not an aggregate property", property.name))?;
        Ok((property, aggregate))
    }

    fn cards_of_type(&self, card_type: &str) -> Result<CardQuery<'a>> {
        let condition = Condition::compare(
            "Type",
            Operator::Eq,
            Value::Literal(card_type.to_string()),
        );
        Ok(CardQuery::from_condition(&self.context(), Some(condition))?)
    }

    /// Derived property ids, dependencies first.
    fn recompute_order(&self) -> Result<Vec<PropertyId>> {
        let nodes = property_nodes(self.project);
        let refs: Vec<&PropertyNode> = nodes.iter().collect();
        let order = DependencyGraph::new(&refs)
            .topological_order()
            .context("Derived properties form a cycle")?;
        Ok(order
            .iter()
            .filter_map(|id| id.parse::<PropertyId>().ok())
            .filter(|id| self.project.property(*id).is_some_and(|p| p.is_calculated()))
            .collect())
    }

    /// Properties whose change on a descendant affects an aggregate.
    fn aggregate_inputs(
        &self,
        property: &PropertyDefinition,
        aggregate: &AggregateDefinition,
    ) -> Vec<PropertyId> {
        let mut inputs = property_dependencies(self.project, &property.kind);
        inputs.push(TYPE_PROPERTY_ID);
        if let Some(relationship) = aggregate.relationship(self.project) {
            inputs.push(relationship.id);
        }
        inputs
    }

    /// Aggregate cards above `sources`, found through the aggregate's
    /// relationship column.
    fn ancestors(
        &self,
        aggregate: &AggregateDefinition,
        sources: &BTreeSet<CardId>,
        stats: &mut RecomputeStats,
    ) -> Result<BTreeSet<CardId>> {
        let mut ancestors = BTreeSet::new();
        let Some(relationship) = aggregate.relationship(self.project) else {
            return Ok(ancestors);
        };
        let scope: Vec<String> = aggregate
            .scope_card_types(self.project)
            .iter()
            .map(|t| t.to_lowercase())
            .collect();
        let sources: Vec<CardId> = sources.iter().copied().collect();
        for batch in sources.chunks(self.batch_size()) {
            let sql = Query::select()
                .distinct()
                .column(Alias::new(&relationship.column_name))
                .from(Alias::new(self.project.cards_table()))
                .and_where(Expr::col(Alias::new("id")).is_in(batch.iter().copied()))
                .and_where(
                    Expr::expr(Func::lower(Expr::col(Alias::new("card_type_name"))))
                        .is_in(scope.clone()),
                )
                .and_where(Expr::col(Alias::new(&relationship.column_name)).is_not_null())
                .to_string(SqliteQueryBuilder);
            ancestors.extend(self.query_ids(&sql, stats)?);
        }
        Ok(ancestors)
    }

    /// The cards among `card_ids` that are of the aggregate's card type.
    fn aggregate_cards(
        &self,
        aggregate: &AggregateDefinition,
        card_ids: &BTreeSet<CardId>,
        stats: &mut RecomputeStats,
    ) -> Result<Vec<CardId>> {
        let card_ids: Vec<CardId> = card_ids.iter().copied().collect();
        let mut cards = Vec::new();
        for batch in card_ids.chunks(self.batch_size()) {
            let sql = Query::select()
                .column(Alias::new("id"))
                .from(Alias::new(self.project.cards_table()))
                .and_where(Expr::col(Alias::new("id")).is_in(batch.iter().copied()))
                .and_where(
                    Expr::expr(Func::lower(Expr::col(Alias::new("card_type_name"))))
                        .eq(aggregate.aggregate_card_type.to_lowercase()),
                )
                .order_by(Alias::new("id"), sea_query::Order::Asc)
                .to_string(SqliteQueryBuilder);
            cards.extend(self.query_ids(&sql, stats)?);
        }
        Ok(cards)
    }

    /// Bring a formula up to date on `card_ids`; returns the cards whose
    /// value changed.
    fn apply_formula(
        &self,
        property: &PropertyDefinition,
        formula: &FormulaDefinition,
        card_ids: &[CardId],
        stats: &mut RecomputeStats,
    ) -> Result<Vec<CardId>> {
        let table = self.project.cards_table();
        let value = FormulaExpr::parse(&formula.formula)?.to_sql(
            self.project,
            &table,
            formula.null_is_zero,
        )?;
        let types: Vec<String> = property.card_types.iter().map(|t| t.to_lowercase()).collect();
        let mut changed = Vec::new();
        for batch in card_ids.chunks(self.batch_size()) {
            let select = Query::select()
                .column(Alias::new("id"))
                .from(Alias::new(&table))
                .and_where(Expr::col(Alias::new("id")).is_in(batch.iter().copied()))
                .and_where(
                    Expr::expr(Func::lower(Expr::col(Alias::new("card_type_name"))))
                        .is_in(types.clone()),
                )
                .and_where(Expr::cust(format!(
                    r#""{}"."{}" IS NOT ({})"#,
                    table, property.column_name, value
                )))
                .to_string(SqliteQueryBuilder);
            let ids = self.query_ids(&select, stats)?;
            if ids.is_empty() {
                continue;
            }
            let update = Query::update()
                .table(Alias::new(&table))
                .value(Alias::new(&property.column_name), Expr::cust(value.clone()))
                .and_where(Expr::col(Alias::new("id")).is_in(ids.iter().copied()))
                .to_string(SqliteQueryBuilder);
            self.execute(&update, stats)?;
            changed.extend(ids);
        }
        Ok(changed)
    }

    /// Recompute an aggregate on `card_ids`; returns the cards whose value
    /// changed.
    fn apply_aggregate(
        &self,
        property: &PropertyDefinition,
        aggregate: &AggregateDefinition,
        card_ids: &[CardId],
        stats: &mut RecomputeStats,
    ) -> Result<Vec<CardId>> {
        let mut changed = Vec::new();
        for batch in card_ids.chunks(self.batch_size()) {
            let sql = aggregate.stale_ids_sql(self.project, property, batch)?;
            let ids = self.query_ids(&sql, stats)?;
            if ids.is_empty() {
                continue;
            }
            self.execute(&aggregate.update_sql(self.project, property, &ids)?, stats)?;
            changed.extend(ids);
        }
        Ok(changed)
    }

    /// Walk derived properties in dependency order starting from `seeds`.
    /// With `defer_aggregates`, aggregates are marked stale and queued
    /// instead of computed.
    pub(crate) fn run(&self, seeds: Vec<Seed>, defer_aggregates: bool) -> Result<RecomputeStats> {
        let mut stats = RecomputeStats::default();
        let mut touched: BTreeMap<PropertyId, BTreeSet<CardId>> = BTreeMap::new();
        let mut explicit: BTreeMap<PropertyId, BTreeSet<CardId>> = BTreeMap::new();
        for seed in seeds {
            match seed {
                Seed::Changed { cards, properties } => {
                    for property in properties {
                        touched.entry(property).or_default().extend(cards.iter().copied());
                    }
                }
                Seed::Recompute { property, cards } => {
                    explicit.entry(property).or_default().extend(cards);
                }
            }
        }

        let mut deferred: BTreeMap<CardId, Vec<PropertyId>> = BTreeMap::new();
        for property_id in self.recompute_order()? {
            let Some(property) = self.project.property(property_id) else {
                continue;
            };
            let mut scope = explicit.remove(&property_id).unwrap_or_default();
            match &property.kind {
                PropertyKind::Formula(formula) => {
                    for input in property_dependencies(self.project, &property.kind) {
                        if let Some(cards) = touched.get(&input) {
                            scope.extend(cards);
                        }
                    }
                    if scope.is_empty() {
                        continue;
                    }
                    let ids: Vec<CardId> = scope.into_iter().collect();
                    let changed = self.apply_formula(property, formula, &ids, &mut stats)?;
                    debug!(formula = %property.name, scope = ids.len(), changed = changed.len(), "Recomputed formula");
                    stats
                        .formulas
                        .extend(changed.iter().map(|card| (property_id, *card)));
                    touched.entry(property_id).or_default().extend(changed);
                }
                PropertyKind::Aggregate(aggregate) => {
                    let mut sources = BTreeSet::new();
                    for input in self.aggregate_inputs(property, aggregate) {
                        if let Some(cards) = touched.get(&input) {
                            sources.extend(cards);
                        }
                    }
                    if !sources.is_empty() {
                        scope.extend(self.ancestors(aggregate, &sources, &mut stats)?);
                    }
                    if scope.is_empty() {
                        continue;
                    }
                    let ids = self.aggregate_cards(aggregate, &scope, &mut stats)?;
                    if ids.is_empty() {
                        continue;
                    }
                    if defer_aggregates {
                        self.markers().mark(property_id, &ids)?;
                        for card in &ids {
                            deferred.entry(*card).or_default().push(property_id);
                        }
                        continue;
                    }
                    let changed = self.apply_aggregate(property, aggregate, &ids, &mut stats)?;
                    debug!(aggregate = %property.name, scope = ids.len(), changed = changed.len(), "Recomputed aggregate");
                    stats
                        .aggregates
                        .extend(ids.iter().map(|card| (property_id, *card)));
                    touched.entry(property_id).or_default().extend(changed);
                }
                _ => {}
            }
        }

        for (card_id, aggregate_ids) in deferred {
            self.queue.publish(RecomputeMessage::CardAggregates {
                card_id,
                aggregate_ids,
            })?;
            stats.enqueued += 1;
        }
        Ok(stats)
    }

    /// Compute a newly created aggregate on every card of its type, in the
    /// background when there are many.
    pub fn aggregate_created(&self, property_id: PropertyId) -> Result<RecomputeStats> {
        let (property, aggregate) = self.aggregate_property(property_id)?;
        let query = self.cards_of_type(&aggregate.aggregate_card_type)?;
        let count = query.count(self.store)?;
        if count > self.settings.inline_recompute_limit {
            let card_ids_sql = query.to_card_id_sql();
            self.markers().mark_matching(property_id, &card_ids_sql)?;
            self.queue.publish(RecomputeMessage::CardsMatching {
                aggregate_id: property_id,
                card_ids_sql,
            })?;
            info!(aggregate = %property.name, cards = count, "Queued aggregate computation");
            return Ok(RecomputeStats {
                enqueued: 1,
                ..RecomputeStats::default()
            });
        }
        let cards = query.card_ids(self.store)?;
        self.store.transaction(|| {
            self.run(
                vec![Seed::Recompute {
                    property: property_id,
                    cards,
                }],
                false,
            )
        })
    }

    /// Values of `properties` changed on `card_ids`.
    pub fn properties_changed(
        &self,
        card_ids: &[CardId],
        properties: &[PropertyId],
    ) -> Result<RecomputeStats> {
        self.run(
            vec![Seed::Changed {
                cards: card_ids.to_vec(),
                properties: properties.to_vec(),
            }],
            false,
        )
    }

    /// Cards moved within, added to or removed from a tree. `card_ids` are
    /// the cards whose relationship values changed; `old_ancestors` are the
    /// ancestors they had before.
    pub fn membership_changed(
        &self,
        tree_id: TreeId,
        card_ids: &[CardId],
        old_ancestors: &[CardId],
    ) -> Result<RecomputeStats> {
        let seeds = self.membership_seeds(tree_id, card_ids, old_ancestors)?;
        self.run(seeds, false)
    }

    /// Seeds for a membership change. `recompute` are cards whose aggregates
    /// on the tree must be recomputed whatever their inputs: the old
    /// ancestors, and aggregate cards that lost their subtree.
    pub(crate) fn membership_seeds(
        &self,
        tree_id: TreeId,
        card_ids: &[CardId],
        recompute: &[CardId],
    ) -> Result<Vec<Seed>> {
        let tree = self
            .project
            .tree_by_id(tree_id)
            .ok_or_else(|| anyhow!("Tree {} not found", tree_id))?;
        let mut seeds = vec![Seed::Changed {
            cards: card_ids.to_vec(),
            properties: tree.relationship_ids().to_vec(),
        }];
        for property in self.project.aggregate_properties() {
            if property.aggregate().is_some_and(|a| a.tree_id == tree_id) {
                seeds.push(Seed::Recompute {
                    property: property.id,
                    cards: recompute.to_vec(),
                });
            }
        }
        Ok(seeds)
    }

    /// Cards changed type. Both their old ancestors and the cards themselves
    /// are recomputed for every derived property.
    pub fn card_type_changed(
        &self,
        card_ids: &[CardId],
        old_ancestors: &[CardId],
    ) -> Result<RecomputeStats> {
        self.run(self.card_type_seeds(card_ids, old_ancestors), false)
    }

    pub(crate) fn card_type_seeds(&self, card_ids: &[CardId], old_ancestors: &[CardId]) -> Vec<Seed> {
        let mut seeds = vec![Seed::Changed {
            cards: card_ids.to_vec(),
            properties: vec![TYPE_PROPERTY_ID],
        }];
        let mut cards = card_ids.to_vec();
        cards.extend_from_slice(old_ancestors);
        for property in self.project.properties.iter().filter(|p| p.is_calculated()) {
            seeds.push(Seed::Recompute {
                property: property.id,
                cards: cards.clone(),
            });
        }
        seeds
    }

    /// A formula's text or null handling changed. Only cards whose value
    /// differs between the old and new definitions are written; they get a
    /// new version. Dependent formulas follow inline, dependent aggregates
    /// are marked stale and queued.
    pub fn formula_changed(
        &self,
        property_id: PropertyId,
        previous: &FormulaDefinition,
    ) -> Result<RecomputeStats> {
        let property = self
            .project
            .property(property_id)
            .ok_or_else(|| anyhow!("Property {} not found", property_id))?;
        let current = property
            .formula()
            .ok_or_else(|| anyhow!("{} is not a formula property", property.name))?;
        let table = self.project.cards_table();
        let old_sql =
            FormulaExpr::parse(&previous.formula)?.to_sql(self.project, &table, previous.null_is_zero)?;
        let new_sql =
            FormulaExpr::parse(&current.formula)?.to_sql(self.project, &table, current.null_is_zero)?;
        let types: Vec<String> = property.card_types.iter().map(|t| t.to_lowercase()).collect();

        let mut stats = RecomputeStats::default();
        let select = Query::select()
            .column(Alias::new("id"))
            .from(Alias::new(&table))
            .and_where(
                Expr::expr(Func::lower(Expr::col(Alias::new("card_type_name")))).is_in(types),
            )
            .and_where(Expr::cust(format!(
                "LOWER(CAST(({}) AS TEXT)) IS NOT LOWER(CAST(({}) AS TEXT))",
                old_sql, new_sql
            )))
            .to_string(SqliteQueryBuilder);
        let changed = self.query_ids(&select, &mut stats)?;
        if changed.is_empty() {
            debug!(formula = %property.name, "Formula change affects no card");
            return Ok(stats);
        }

        self.store.transaction(|| {
            let now = self.store.now().format(TIMESTAMP_FORMAT).to_string();
            for batch in changed.chunks(self.batch_size()) {
                let update = Query::update()
                    .table(Alias::new(&table))
                    .values([
                        (Alias::new(&property.column_name), Expr::cust(new_sql.clone())),
                        (Alias::new("version"), Expr::cust(r#""version" + 1"#)),
                        (Alias::new("updated_at"), Expr::val(now.clone()).into()),
                    ])
                    .and_where(Expr::col(Alias::new("id")).is_in(batch.iter().copied()))
                    .to_string(SqliteQueryBuilder);
                self.execute(&update, &mut stats)?;
            }
            self.store.record_versions(&self.project.schema, &changed)?;
            info!(formula = %property.name, cards = changed.len(), "Applied formula change");

            stats
                .formulas
                .extend(changed.iter().map(|card| (property_id, *card)));
            let dependents = self.run(
                vec![Seed::Changed {
                    cards: changed.clone(),
                    properties: vec![property_id],
                }],
                true,
            )?;
            stats.merge(dependents);
            Ok(stats)
        })
    }

    /// Recompute aggregates on every card of their aggregate type.
    pub fn recompute_aggregates(&self, property_ids: &[PropertyId]) -> Result<RecomputeStats> {
        let mut seeds = Vec::new();
        for property_id in property_ids {
            let (_, aggregate) = self.aggregate_property(*property_id)?;
            let cards = self
                .cards_of_type(&aggregate.aggregate_card_type)?
                .card_ids(self.store)?;
            seeds.push(Seed::Recompute {
                property: *property_id,
                cards,
            });
        }
        self.store.transaction(|| self.run(seeds, false))
    }

    /// Drain the work queue, recomputing queued aggregates and clearing
    /// their stale markers.
    pub fn process_pending(&self) -> Result<RecomputeStats> {
        let mut stats = RecomputeStats::default();
        for message in self.queue.drain() {
            let (aggregate_ids, cards) = match message {
                RecomputeMessage::CardAggregates {
                    card_id,
                    aggregate_ids,
                } => (aggregate_ids, vec![card_id]),
                RecomputeMessage::CardsMatching {
                    aggregate_id,
                    card_ids_sql,
                } => (
                    vec![aggregate_id],
                    self.query_ids(&card_ids_sql, &mut stats)?,
                ),
            };
            for aggregate_id in &aggregate_ids {
                let state = self.aggregate_state(*aggregate_id)?;
                debug!(
                    aggregate = aggregate_id,
                    from = %state,
                    to = ?state.on(AggregateEvent::RecomputeStarted),
                    "Recomputing queued aggregate"
                );
            }
            let seeds = aggregate_ids
                .iter()
                .map(|id| Seed::Recompute {
                    property: *id,
                    cards: cards.clone(),
                })
                .collect();
            let run = self.store.transaction(|| {
                let run = self.run(seeds, false)?;
                for aggregate_id in &aggregate_ids {
                    self.markers().clear(*aggregate_id, &cards)?;
                }
                Ok(run)
            })?;
            stats.merge(run);
        }
        Ok(stats)
    }

    pub fn aggregate_state(&self, property_id: PropertyId) -> Result<AggregateState> {
        let Some(property) = self.project.property(property_id) else {
            return Ok(AggregateState::Unconfigured);
        };
        let Some(aggregate) = property.aggregate() else {
            return Ok(AggregateState::Unconfigured);
        };
        if !aggregate
            .validate(self.project, Some(property_id), &property.name)
            .is_empty()
        {
            return Ok(AggregateState::Unconfigured);
        }
        if self.markers().is_stale(property_id)? {
            Ok(AggregateState::Stale)
        } else {
            Ok(AggregateState::Valid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateScope;
    use crate::cards::NewCard;
    use crate::domain::Card;
    use crate::mql::AggregateFunction;
    use crate::properties::enumeration_values;
    use crate::schema::SchemaService;
    use crate::storage::{InMemoryWorkQueue, SqliteCardStore};
    use crate::tree::TreeMembership;

    struct Ids {
        double: PropertyId,
        total: PropertyId,
    }

    fn setup() -> (Project, SqliteCardStore, Ids) {
        let mut project = Project::new("agile", "Agile");
        for card_type in ["Release", "Story"] {
            project.create_card_type(card_type).unwrap();
        }
        project
            .create_property(
                "Points",
                PropertyKind::Enumerated {
                    numeric: true,
                    values: enumeration_values(&["1", "2", "3"]),
                },
                &["Story"],
            )
            .unwrap();
        let double = project
            .create_formula("Double", "Points * 2", false, &["Story"])
            .unwrap();
        let tree_id = project.create_tree("Planning", &["Release", "Story"]).unwrap();
        let total = project
            .create_aggregate(
                "Total Double",
                AggregateDefinition {
                    tree_id,
                    aggregate_card_type: "Release".to_string(),
                    scope: AggregateScope::AllDescendants,
                    function: AggregateFunction::Sum,
                    target_property_id: Some(double),
                    condition: None,
                },
            )
            .unwrap();
        let store = SqliteCardStore::open_in_memory().unwrap();
        SchemaService::new(&store).install(&project.schema).unwrap();
        (project, store, Ids { double, total })
    }

    /// Releases R1 (#1) and R2 (#2); stories with points 1 and 2 under R1
    /// and one without points under R2.
    fn populate(engine: &RecomputeEngine<'_, SqliteCardStore, InMemoryWorkQueue>) -> Vec<Card> {
        let tree = TreeMembership::new(engine, "Planning").unwrap();
        let r1 = engine.create_card(NewCard::new("Release", "R1")).unwrap();
        let r2 = engine.create_card(NewCard::new("Release", "R2")).unwrap();
        let s1 = engine
            .create_card(NewCard::new("Story", "S1").with_value("Points", "1"))
            .unwrap();
        let s2 = engine
            .create_card(NewCard::new("Story", "S2").with_value("Points", "2"))
            .unwrap();
        let s3 = engine.create_card(NewCard::new("Story", "S3")).unwrap();
        tree.add_card(r1.id, None).unwrap();
        tree.add_card(r2.id, None).unwrap();
        tree.add_card(s1.id, Some(r1.id)).unwrap();
        tree.add_card(s2.id, Some(r1.id)).unwrap();
        tree.add_card(s3.id, Some(r2.id)).unwrap();
        vec![r1, r2, s1, s2, s3]
    }

    fn value_of(
        engine: &RecomputeEngine<'_, SqliteCardStore, InMemoryWorkQueue>,
        card: &Card,
        property: PropertyId,
    ) -> Option<String> {
        let property = engine.project().property(property).unwrap();
        engine.cards().load(card.id).unwrap().unwrap().value_of(property)
    }

    #[test]
    fn test_aggregates_follow_tree_changes() {
        let (project, store, ids) = setup();
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let cards = populate(&engine);
        assert_eq!(value_of(&engine, &cards[0], ids.total).as_deref(), Some("6"));
        assert_eq!(value_of(&engine, &cards[1], ids.total), None);
        assert_eq!(value_of(&engine, &cards[3], ids.double).as_deref(), Some("4"));
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_move_recomputes_only_old_and_new_branch() {
        let (project, store, ids) = setup();
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let cards = populate(&engine);
        let r3 = engine.create_card(NewCard::new("Release", "R3")).unwrap();
        let tree = TreeMembership::new(&engine, "Planning").unwrap();
        tree.add_card(r3.id, None).unwrap();

        let change = tree.add_card(cards[3].id, Some(cards[1].id)).unwrap();
        let mut recomputed = change.stats.aggregate_cards(ids.total);
        recomputed.sort_unstable();
        assert_eq!(recomputed, vec![cards[0].id, cards[1].id]);
        assert_eq!(value_of(&engine, &cards[0], ids.total).as_deref(), Some("2"));
        assert_eq!(value_of(&engine, &cards[1], ids.total).as_deref(), Some("4"));
        assert_eq!(value_of(&engine, &r3, ids.total), None);
    }

    #[test]
    fn test_new_aggregate_computed_inline_or_queued() {
        let (project, store, ids) = setup();
        let queue = InMemoryWorkQueue::new();
        let cards = {
            let engine = RecomputeEngine::new(&project, &store, &queue);
            populate(&engine)
        };

        let engine = RecomputeEngine::new(&project, &store, &queue);
        let stats = engine.aggregate_created(ids.total).unwrap();
        let mut computed = stats.aggregate_cards(ids.total);
        computed.sort_unstable();
        assert_eq!(computed, vec![cards[0].id, cards[1].id]);
        assert_eq!(stats.enqueued, 0);

        let engine = RecomputeEngine::new(&project, &store, &queue).with_settings(EngineSettings {
            inline_recompute_limit: 1,
            ..EngineSettings::default()
        });
        let stats = engine.aggregate_created(ids.total).unwrap();
        assert_eq!(stats.enqueued, 1);
        assert!(stats.aggregates.is_empty());
        assert_eq!(engine.aggregate_state(ids.total).unwrap(), AggregateState::Stale);

        let processed = engine.process_pending().unwrap();
        assert_eq!(processed.aggregate_cards(ids.total).len(), 2);
        assert_eq!(engine.aggregate_state(ids.total).unwrap(), AggregateState::Valid);
        assert_eq!(value_of(&engine, &cards[0], ids.total).as_deref(), Some("6"));
    }

    #[test]
    fn test_formula_change_rewrites_only_differing_cards() {
        let (mut project, store, ids) = setup();
        let queue = InMemoryWorkQueue::new();
        let cards = {
            let engine = RecomputeEngine::new(&project, &store, &queue);
            populate(&engine)
        };
        let versions: Vec<i64> = {
            let engine = RecomputeEngine::new(&project, &store, &queue);
            cards
                .iter()
                .map(|c| engine.cards().load(c.id).unwrap().unwrap().version)
                .collect()
        };

        let previous = project.update_formula(ids.double, "Points * 3", false).unwrap();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let stats = engine.formula_changed(ids.double, &previous).unwrap();
        let mut rewritten = stats.formula_cards(ids.double);
        rewritten.sort_unstable();
        assert_eq!(rewritten, vec![cards[2].id, cards[3].id]);

        let reloaded = engine.cards().load(cards[4].id).unwrap().unwrap();
        assert_eq!(reloaded.version, versions[4]);
        let reloaded = engine.cards().load(cards[2].id).unwrap().unwrap();
        assert_eq!(reloaded.version, versions[2] + 1);
        assert!(!store.is_new_version(&project.schema, cards[2].id, &[]).unwrap());

        // the aggregate over the formula is queued, not computed inline
        assert_eq!(stats.enqueued, 1);
        assert_eq!(engine.aggregate_state(ids.total).unwrap(), AggregateState::Stale);
        assert_eq!(value_of(&engine, &cards[0], ids.total).as_deref(), Some("6"));

        engine.process_pending().unwrap();
        assert_eq!(value_of(&engine, &cards[0], ids.total).as_deref(), Some("9"));
        assert_eq!(engine.aggregate_state(ids.total).unwrap(), AggregateState::Valid);
    }

    #[test]
    fn test_unchanged_formula_touches_nothing() {
        let (mut project, store, ids) = setup();
        let queue = InMemoryWorkQueue::new();
        {
            let engine = RecomputeEngine::new(&project, &store, &queue);
            populate(&engine);
        }
        let previous = project.update_formula(ids.double, "2 * Points", false).unwrap();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let stats = engine.formula_changed(ids.double, &previous).unwrap();
        assert!(stats.formulas.is_empty());
        assert_eq!(stats.enqueued, 0);
    }
}
