//! Persisted stale markers for derived values.
//!
//! A marker `(card, property, project)` records that the stored value of an
//! aggregate on a card is known to be out of date and that recomputation
//! has been queued.

use anyhow::Result;
use sea_query::{Alias, Expr, ExprTrait, OnConflict, Query, SqliteQueryBuilder};
use tracing::warn;

use crate::domain::{CardId, PropertyId};
use crate::schema::STALE_PROP_DEFS_TABLE;
use crate::storage::{CardStore, MAX_IDS_PER_STATEMENT};

pub struct StaleMarkers<'a, S: CardStore> {
    store: &'a S,
    project: &'a str,
}

impl<'a, S: CardStore> StaleMarkers<'a, S> {
    pub fn new(store: &'a S, project: &'a str) -> Self {
        StaleMarkers { store, project }
    }

    fn table() -> Alias {
        Alias::new(STALE_PROP_DEFS_TABLE)
    }

    /// Mark `property` stale on each card. Existing markers are kept.
    pub fn mark(&self, property: PropertyId, card_ids: &[CardId]) -> Result<usize> {
        let mut marked = 0;
        for batch in card_ids.chunks(MAX_IDS_PER_STATEMENT) {
            let mut insert = Query::insert();
            insert
                .into_table(Self::table())
                .columns([
                    Alias::new("card_id"),
                    Alias::new("prop_def_id"),
                    Alias::new("project_id"),
                ])
                .on_conflict(
                    OnConflict::columns([
                        Alias::new("card_id"),
                        Alias::new("prop_def_id"),
                        Alias::new("project_id"),
                    ])
                    .do_nothing()
                    .to_owned(),
                );
            for card_id in batch {
                insert.values([
                    (*card_id).into(),
                    property.into(),
                    self.project.into(),
                ])?;
            }
            marked += self.store.execute(&insert.to_string(SqliteQueryBuilder))?;
        }
        if marked > 0 {
            warn!(property, cards = marked, "Marked aggregate values stale");
        }
        Ok(marked)
    }

    /// Mark `property` stale on every card returned by `card_ids_sql`.
    pub fn mark_matching(&self, property: PropertyId, card_ids_sql: &str) -> Result<usize> {
        let marked = self.store.execute(&format!(
            r#"INSERT INTO "{table}" ("card_id", "prop_def_id", "project_id")
               SELECT "id", {property}, '{project}' FROM ({ids}) AS "matching" WHERE 1 = 1
               ON CONFLICT DO NOTHING"#,
            table = STALE_PROP_DEFS_TABLE,
            property = property,
            project = self.project.replace('\'', "''"),
            ids = card_ids_sql,
        ))?;
        if marked > 0 {
            warn!(property, cards = marked, "Marked aggregate values stale");
        }
        Ok(marked)
    }

    pub fn clear(&self, property: PropertyId, card_ids: &[CardId]) -> Result<usize> {
        let mut cleared = 0;
        for batch in card_ids.chunks(MAX_IDS_PER_STATEMENT) {
            let delete = Query::delete()
                .from_table(Self::table())
                .and_where(Expr::col(Alias::new("prop_def_id")).eq(property))
                .and_where(Expr::col(Alias::new("project_id")).eq(self.project))
                .and_where(Expr::col(Alias::new("card_id")).is_in(batch.iter().copied()))
                .to_string(SqliteQueryBuilder);
            cleared += self.store.execute(&delete)?;
        }
        Ok(cleared)
    }

    /// Drop every marker held by the cards, whatever the property.
    pub fn forget_cards(&self, card_ids: &[CardId]) -> Result<usize> {
        let mut cleared = 0;
        for batch in card_ids.chunks(MAX_IDS_PER_STATEMENT) {
            let delete = Query::delete()
                .from_table(Self::table())
                .and_where(Expr::col(Alias::new("project_id")).eq(self.project))
                .and_where(Expr::col(Alias::new("card_id")).is_in(batch.iter().copied()))
                .to_string(SqliteQueryBuilder);
            cleared += self.store.execute(&delete)?;
        }
        Ok(cleared)
    }

    /// Cards on which `property` is stale.
    pub fn cards(&self, property: PropertyId) -> Result<Vec<CardId>> {
        let select = Query::select()
            .column(Alias::new("card_id"))
            .from(Self::table())
            .and_where(Expr::col(Alias::new("prop_def_id")).eq(property))
            .and_where(Expr::col(Alias::new("project_id")).eq(self.project))
            .order_by(Alias::new("card_id"), sea_query::Order::Asc)
            .to_string(SqliteQueryBuilder);
        self.store.query_ids(&select)
    }

    pub fn is_stale(&self, property: PropertyId) -> Result<bool> {
        Ok(!self.cards(property)?.is_empty())
    }
}
