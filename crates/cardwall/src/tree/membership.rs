//! Adding cards to trees, moving them and removing them.
//!
//! A card's position is stored in relationship columns: on a card at level
//! `i`, the relationship of level `j < i` holds the id of its ancestor at
//! level `j`. A card is only ever placed directly below a card of the level
//! above; the relationship of a level reads NULL (not set) once the card in
//! between was removed on its own. Every operation rewrites the card and
//! all of its descendants in set-oriented statements, then hands the old
//! ancestors to the engine so both the old and the new branch get their
//! aggregates recomputed.

use anyhow::Result;
use sea_query::{Alias, Expr, ExprTrait, OnConflict, Query, SimpleExpr, SqliteQueryBuilder};
use serde::Serialize;
use tracing::info;

use super::{RelationshipsMap, TreeConfiguration};
use crate::aggregate::{RecomputeEngine, RecomputeStats, Seed};
use crate::cards::TIMESTAMP_FORMAT;
use crate::domain::{Card, CardId, PropertyDefinition};
use crate::errors::DomainError;
use crate::storage::{CardStore, VersionStore, WorkQueue, MAX_IDS_PER_STATEMENT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalMode {
    /// Remove only the card; its children move up to its parent.
    SingleCard,
    /// Remove the card and everything below it.
    WithChildren,
}

/// Outcome of one membership operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MembershipChange {
    /// Cards whose relationship values were rewritten.
    pub changed: Vec<CardId>,
    /// Ancestors the changed cards had before the operation.
    pub old_ancestors: Vec<CardId>,
    pub stats: RecomputeStats,
}

/// Relationship and belonging writes of one operation together with the
/// recompute seeds they call for. Callers that apply several operations
/// merge the seeds into a single engine run.
pub(crate) struct PendingMembership {
    pub changed: Vec<CardId>,
    pub old_ancestors: Vec<CardId>,
    pub seeds: Vec<Seed>,
}

pub struct TreeMembership<'e, 'a, S, Q>
where
    S: CardStore + VersionStore,
    Q: WorkQueue,
{
    engine: &'e RecomputeEngine<'a, S, Q>,
    tree: &'a TreeConfiguration,
}

impl<'e, 'a, S, Q> TreeMembership<'e, 'a, S, Q>
where
    S: CardStore + VersionStore,
    Q: WorkQueue,
{
    pub fn new(engine: &'e RecomputeEngine<'a, S, Q>, tree_name: &str) -> Result<Self> {
        let tree = engine
            .project()
            .tree(tree_name)
            .ok_or_else(|| DomainError::not_found("Tree", tree_name))?;
        Ok(TreeMembership { engine, tree })
    }

    pub fn tree(&self) -> &'a TreeConfiguration {
        self.tree
    }

    fn relationships(&self) -> RelationshipsMap<'a> {
        self.tree.relationships(self.engine.project())
    }

    fn belongings_table(&self) -> Alias {
        Alias::new(self.engine.project().schema.tree_belongings_table())
    }

    fn load(&self, card_id: CardId) -> Result<Card> {
        self.engine
            .cards()
            .load(card_id)?
            .ok_or_else(|| DomainError::not_found("Card", card_id.to_string()).into())
    }

    /// Ids of every card in the tree.
    pub fn members(&self) -> Result<Vec<CardId>> {
        let sql = Query::select()
            .column(Alias::new("card_id"))
            .from(self.belongings_table())
            .and_where(Expr::col(Alias::new("tree_configuration_id")).eq(self.tree.id))
            .order_by(Alias::new("card_id"), sea_query::Order::Asc)
            .to_string(SqliteQueryBuilder);
        self.engine.store().query_ids(&sql)
    }

    pub fn contains(&self, card_id: CardId) -> Result<bool> {
        let sql = Query::select()
            .column(Alias::new("card_id"))
            .from(self.belongings_table())
            .and_where(Expr::col(Alias::new("tree_configuration_id")).eq(self.tree.id))
            .and_where(Expr::col(Alias::new("card_id")).eq(card_id))
            .to_string(SqliteQueryBuilder);
        Ok(!self.engine.store().query_ids(&sql)?.is_empty())
    }

    /// Every card below `card` in this tree.
    pub fn descendants_of(&self, card: &Card) -> Result<Vec<CardId>> {
        let Some(relationship) = self.relationships().relationship_for(&card.card_type_name) else {
            return Ok(Vec::new());
        };
        let sql = Query::select()
            .column(Alias::new("id"))
            .from(Alias::new(self.engine.project().cards_table()))
            .and_where(Expr::col(Alias::new(&relationship.column_name)).eq(card.id))
            .order_by(Alias::new("number"), sea_query::Order::Asc)
            .to_string(SqliteQueryBuilder);
        self.engine.store().query_ids(&sql)
    }

    /// Cards whose nearest ancestor is `card`.
    pub fn children_of(&self, card: &Card) -> Result<Vec<CardId>> {
        let relationships = self.relationships();
        let descendants = self.engine.cards().load_many(&self.descendants_of(card)?)?;
        Ok(descendants
            .iter()
            .filter(|d| relationships.parent_of(d) == Some(card.id))
            .map(|d| d.id)
            .collect())
    }

    /// Rewrite relationship columns on a set of cards, bumping their version.
    fn write_relationships(
        &self,
        values: &[(&PropertyDefinition, Option<CardId>)],
        card_ids: &[CardId],
    ) -> Result<()> {
        if values.is_empty() || card_ids.is_empty() {
            return Ok(());
        }
        let store = self.engine.store();
        let now = store.now().format(TIMESTAMP_FORMAT).to_string();
        for batch in card_ids.chunks(self.engine.settings().batch_size.clamp(1, MAX_IDS_PER_STATEMENT)) {
            let mut assignments: Vec<(Alias, SimpleExpr)> = values
                .iter()
                .map(|(p, v)| (Alias::new(&p.column_name), (*v).into()))
                .collect();
            assignments.push((Alias::new("version"), Expr::cust(r#""version" + 1"#)));
            assignments.push((Alias::new("updated_at"), now.clone().into()));
            let sql = Query::update()
                .table(Alias::new(self.engine.project().cards_table()))
                .values(assignments)
                .and_where(Expr::col(Alias::new("id")).is_in(batch.iter().copied()))
                .to_string(SqliteQueryBuilder);
            store.execute(&sql)?;
        }
        store.record_versions(&self.engine.project().schema, card_ids)?;
        Ok(())
    }

    fn add_belongings(&self, card_ids: &[CardId]) -> Result<()> {
        for batch in card_ids.chunks(MAX_IDS_PER_STATEMENT) {
            let mut insert = Query::insert();
            insert
                .into_table(self.belongings_table())
                .columns([Alias::new("tree_configuration_id"), Alias::new("card_id")])
                .on_conflict(
                    OnConflict::columns([
                        Alias::new("tree_configuration_id"),
                        Alias::new("card_id"),
                    ])
                    .do_nothing()
                    .to_owned(),
                );
            for card_id in batch {
                insert.values([self.tree.id.into(), (*card_id).into()])?;
            }
            self.engine
                .store()
                .execute(&insert.to_string(SqliteQueryBuilder))?;
        }
        Ok(())
    }

    fn remove_belongings(&self, card_ids: &[CardId]) -> Result<()> {
        for batch in card_ids.chunks(MAX_IDS_PER_STATEMENT) {
            let sql = Query::delete()
                .from_table(self.belongings_table())
                .and_where(Expr::col(Alias::new("tree_configuration_id")).eq(self.tree.id))
                .and_where(Expr::col(Alias::new("card_id")).is_in(batch.iter().copied()))
                .to_string(SqliteQueryBuilder);
            self.engine.store().execute(&sql)?;
        }
        Ok(())
    }

    /// Add `card_id` to the tree under `parent_id`, or at the top when
    /// there is no parent. A card already in the tree is moved, taking its
    /// descendants along. The parent must sit on the level directly above
    /// the card.
    pub fn add_card(&self, card_id: CardId, parent_id: Option<CardId>) -> Result<MembershipChange> {
        self.engine.store().transaction(|| {
            let pending = self.place(card_id, parent_id)?;
            self.apply(pending)
        })
    }

    pub fn remove_card(&self, card_id: CardId, mode: RemovalMode) -> Result<MembershipChange> {
        self.engine.store().transaction(|| {
            let pending = self.detach(card_id, mode)?;
            self.apply(pending)
        })
    }

    fn apply(&self, pending: PendingMembership) -> Result<MembershipChange> {
        let stats = self.engine.run(pending.seeds, false)?;
        Ok(MembershipChange {
            changed: pending.changed,
            old_ancestors: pending.old_ancestors,
            stats,
        })
    }

    /// Write a placement without recomputing anything.
    pub(crate) fn place(&self, card_id: CardId, parent_id: Option<CardId>) -> Result<PendingMembership> {
        let card = self.load(card_id)?;
        if !self.tree.contains(&card.card_type_name) {
            return Err(DomainError::Validation(vec![format!(
                "Card type {} is not part of tree {}.",
                card.card_type_name, self.tree.name
            )])
            .into());
        }
        let parent = match parent_id {
            Some(id) => Some(self.load(id)?),
            None => None,
        };
        if let Some(parent) = &parent {
            let mut errors = Vec::new();
            if !self.tree.is_parent_level(&parent.card_type_name, &card.card_type_name) {
                errors.push(format!(
                    "Card #{} of type {} cannot be placed below #{} of type {} in tree {}.",
                    card.number, card.card_type_name, parent.number, parent.card_type_name, self.tree.name
                ));
            }
            if !self.contains(parent.id)? {
                errors.push(format!(
                    "Parent card #{} is not in tree {}.",
                    parent.number, self.tree.name
                ));
            }
            if !errors.is_empty() {
                return Err(DomainError::Validation(errors).into());
            }
        }

        let relationships = self.relationships();
        let old_ancestors = relationships.parent_card_ids_of(&card);
        let parent_relationship = parent
            .as_ref()
            .and_then(|p| relationships.relationship_for(&p.card_type_name))
            .map(|r| r.id);
        let values: Vec<(&PropertyDefinition, Option<CardId>)> = relationships
            .relationships_above(&card.card_type_name)
            .into_iter()
            .map(|relationship| {
                let value = match &parent {
                    Some(parent) if parent_relationship == Some(relationship.id) => Some(parent.id),
                    Some(parent) => parent.related_card_id(relationship),
                    None => None,
                };
                (relationship, value)
            })
            .collect();

        let descendants = self.descendants_of(&card)?;
        let mut changed = vec![card.id];
        changed.extend(&descendants);
        self.write_relationships(&values, &changed)?;
        self.add_belongings(&[card.id])?;
        info!(
            card = card.number,
            parent = ?parent.as_ref().map(|p| p.number),
            tree = %self.tree.name,
            descendants = descendants.len(),
            "Placed card in tree"
        );
        let seeds = self
            .engine
            .membership_seeds(self.tree.id, &changed, &old_ancestors)?;
        Ok(PendingMembership {
            changed,
            old_ancestors,
            seeds,
        })
    }

    /// Write a removal without recomputing anything.
    pub(crate) fn detach(&self, card_id: CardId, mode: RemovalMode) -> Result<PendingMembership> {
        let card = self.load(card_id)?;
        if !self.contains(card.id)? {
            return Err(DomainError::Validation(vec![format!(
                "Card #{} is not in tree {}.",
                card.number, self.tree.name
            )])
            .into());
        }
        let relationships = self.relationships();
        // the card keeps its aggregates but loses every descendant
        let mut old_ancestors = vec![card.id];
        old_ancestors.extend(relationships.parent_card_ids_of(&card));
        let above: Vec<(&PropertyDefinition, Option<CardId>)> = relationships
            .relationships_above(&card.card_type_name)
            .into_iter()
            .map(|r| (r, None))
            .collect();

        let descendants = self.descendants_of(&card)?;
        let mut recompute = old_ancestors.clone();
        self.write_relationships(&above, &[card.id])?;
        let mut removed = vec![card.id];
        match mode {
            RemovalMode::SingleCard => {
                if let Some(own) = relationships.relationship_for(&card.card_type_name) {
                    self.write_relationships(&[(own, None)], &descendants)?;
                }
            }
            RemovalMode::WithChildren => {
                let all: Vec<(&PropertyDefinition, Option<CardId>)> =
                    relationships.all().iter().map(|r| (*r, None)).collect();
                self.write_relationships(&all, &descendants)?;
                removed.extend(&descendants);
                // aggregate cards inside the subtree lose their own children too
                recompute.extend(&descendants);
            }
        }
        self.remove_belongings(&removed)?;
        info!(
            card = card.number,
            tree = %self.tree.name,
            mode = ?mode,
            removed = removed.len(),
            "Removed card from tree"
        );

        let mut changed = vec![card.id];
        changed.extend(&descendants);
        let seeds = self
            .engine
            .membership_seeds(self.tree.id, &changed, &recompute)?;
        Ok(PendingMembership {
            changed,
            old_ancestors,
            seeds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::NewCard;
    use crate::domain::{Project, PropertyKind};
    use crate::schema::SchemaService;
    use crate::storage::{InMemoryWorkQueue, SqliteCardStore};

    fn setup() -> (Project, SqliteCardStore) {
        let mut project = Project::new("agile", "Agile");
        for card_type in ["Release", "Iteration", "Story"] {
            project.create_card_type(card_type).unwrap();
        }
        project
            .create_property("Size", PropertyKind::Text { numeric: true }, &["Story"])
            .unwrap();
        project
            .create_tree("Planning", &["Release", "Iteration", "Story"])
            .unwrap();
        let store = SqliteCardStore::open_in_memory().unwrap();
        SchemaService::new(&store).install(&project.schema).unwrap();
        (project, store)
    }

    fn rel(project: &Project, name: &str) -> PropertyDefinition {
        project.find_property(name).unwrap().clone()
    }

    #[test]
    fn test_add_card_copies_ancestors_from_parent() {
        let (project, store) = setup();
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let tree = TreeMembership::new(&engine, "planning").unwrap();

        let release = engine.create_card(NewCard::new("Release", "R1")).unwrap();
        let iteration = engine.create_card(NewCard::new("Iteration", "I1")).unwrap();
        let story = engine.create_card(NewCard::new("Story", "S1")).unwrap();
        tree.add_card(release.id, None).unwrap();
        tree.add_card(iteration.id, Some(release.id)).unwrap();
        tree.add_card(story.id, Some(iteration.id)).unwrap();

        let story = engine.cards().load(story.id).unwrap().unwrap();
        assert_eq!(
            story.related_card_id(&rel(&project, "Planning - Release")),
            Some(release.id)
        );
        assert_eq!(
            story.related_card_id(&rel(&project, "Planning - Iteration")),
            Some(iteration.id)
        );
        assert_eq!(tree.members().unwrap().len(), 3);
        assert_eq!(tree.children_of(&release).unwrap(), vec![iteration.id]);
    }

    #[test]
    fn test_parent_must_be_on_the_level_above() {
        let (project, store) = setup();
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let tree = TreeMembership::new(&engine, "Planning").unwrap();
        let release = engine.create_card(NewCard::new("Release", "R1")).unwrap();
        let story = engine.create_card(NewCard::new("Story", "S1")).unwrap();
        tree.add_card(release.id, None).unwrap();

        let err = tree.add_card(story.id, Some(release.id)).unwrap_err();
        let messages = err.downcast_ref::<DomainError>().unwrap().messages();
        assert_eq!(
            messages,
            vec!["Card #2 of type Story cannot be placed below #1 of type Release in tree Planning."]
        );
        assert!(!tree.contains(story.id).unwrap());
        let story = engine.cards().load(story.id).unwrap().unwrap();
        assert_eq!(story.version, 1);
        assert_eq!(
            story.related_card_id(&rel(&project, "Planning - Release")),
            None
        );
    }

    #[test]
    fn test_moving_a_card_carries_descendants() {
        let (project, store) = setup();
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let tree = TreeMembership::new(&engine, "Planning").unwrap();
        let r1 = engine.create_card(NewCard::new("Release", "R1")).unwrap();
        let r2 = engine.create_card(NewCard::new("Release", "R2")).unwrap();
        let iteration = engine.create_card(NewCard::new("Iteration", "I1")).unwrap();
        let story = engine.create_card(NewCard::new("Story", "S1")).unwrap();
        tree.add_card(r1.id, None).unwrap();
        tree.add_card(r2.id, None).unwrap();
        tree.add_card(iteration.id, Some(r1.id)).unwrap();
        tree.add_card(story.id, Some(iteration.id)).unwrap();

        let change = tree.add_card(iteration.id, Some(r2.id)).unwrap();
        assert_eq!(change.changed, vec![iteration.id, story.id]);
        assert_eq!(change.old_ancestors, vec![r1.id]);
        let story = engine.cards().load(story.id).unwrap().unwrap();
        assert_eq!(
            story.related_card_id(&rel(&project, "Planning - Release")),
            Some(r2.id)
        );
    }

    #[test]
    fn test_invalid_placement_is_refused() {
        let (project, store) = setup();
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let tree = TreeMembership::new(&engine, "Planning").unwrap();
        let release = engine.create_card(NewCard::new("Release", "R1")).unwrap();
        let story = engine.create_card(NewCard::new("Story", "S1")).unwrap();
        tree.add_card(story.id, None).unwrap();

        let err = tree.add_card(release.id, Some(story.id)).unwrap_err();
        let messages = err.downcast_ref::<DomainError>().unwrap().messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("cannot be placed below"));
    }

    #[test]
    fn test_remove_single_card_reattaches_children() {
        let (project, store) = setup();
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let tree = TreeMembership::new(&engine, "Planning").unwrap();
        let release = engine.create_card(NewCard::new("Release", "R1")).unwrap();
        let iteration = engine.create_card(NewCard::new("Iteration", "I1")).unwrap();
        let story = engine.create_card(NewCard::new("Story", "S1")).unwrap();
        tree.add_card(release.id, None).unwrap();
        tree.add_card(iteration.id, Some(release.id)).unwrap();
        tree.add_card(story.id, Some(iteration.id)).unwrap();

        tree.remove_card(iteration.id, RemovalMode::SingleCard).unwrap();
        assert!(!tree.contains(iteration.id).unwrap());
        assert_eq!(tree.children_of(&release).unwrap(), vec![story.id]);
    }

    #[test]
    fn test_remove_with_children_clears_subtree() {
        let (project, store) = setup();
        let queue = InMemoryWorkQueue::new();
        let engine = RecomputeEngine::new(&project, &store, &queue);
        let tree = TreeMembership::new(&engine, "Planning").unwrap();
        let release = engine.create_card(NewCard::new("Release", "R1")).unwrap();
        let iteration = engine.create_card(NewCard::new("Iteration", "I1")).unwrap();
        let story = engine.create_card(NewCard::new("Story", "S1")).unwrap();
        tree.add_card(release.id, None).unwrap();
        tree.add_card(iteration.id, Some(release.id)).unwrap();
        tree.add_card(story.id, Some(iteration.id)).unwrap();

        tree.remove_card(iteration.id, RemovalMode::WithChildren)
            .unwrap();
        assert_eq!(tree.members().unwrap(), vec![release.id]);
        let story = engine.cards().load(story.id).unwrap().unwrap();
        assert_eq!(
            story.related_card_id(&rel(&project, "Planning - Release")),
            None
        );
    }
}
