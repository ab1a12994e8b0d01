//! Card rows: loading through the schema registry and creating new cards.

use anyhow::{anyhow, Result};
use sea_query::{Alias, Asterisk, Expr, ExprTrait, Func, Query, SelectStatement, SimpleExpr, SqliteQueryBuilder};
use tracing::info;

use crate::aggregate::engine::Seed;
use crate::aggregate::RecomputeEngine;
use crate::domain::{
    Card, CardId, Project, PropertyDefinition, PropertyKind, NAME_PROPERTY_ID, NUMBER_PROPERTY_ID,
    TYPE_PROPERTY_ID,
};
use crate::errors::DomainError;
use crate::properties::ValuePipeline;
use crate::storage::{CardStore, Row, VersionStore, WorkQueue, MAX_IDS_PER_STATEMENT};

/// Timestamp format of `updated_at` columns.
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A card to create. Values are keyed by property name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewCard {
    pub card_type: String,
    pub name: String,
    pub description: Option<String>,
    pub values: Vec<(String, Option<String>)>,
}

impl NewCard {
    pub fn new(card_type: impl Into<String>, name: impl Into<String>) -> Self {
        NewCard {
            card_type: card_type.into(),
            name: name.into(),
            ..NewCard::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_value(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.push((property.into(), Some(value.into())));
        self
    }
}

/// Reads card rows of one project.
pub struct CardRepository<'a, S: CardStore> {
    project: &'a Project,
    store: &'a S,
}

impl<'a, S: CardStore> CardRepository<'a, S> {
    pub fn new(project: &'a Project, store: &'a S) -> Self {
        CardRepository { project, store }
    }

    fn select(&self) -> SelectStatement {
        Query::select()
            .column(Asterisk)
            .from(Alias::new(self.project.cards_table()))
            .to_owned()
    }

    fn card_from_row(&self, row: &Row) -> Result<Card> {
        let integer = |column: &str| -> Result<i64> {
            row.get(column)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| anyhow!("Card row has no {}", column))
        };
        let values = self
            .project
            .schema
            .columns()
            .map(|c| (c.name.clone(), row.get(&c.name).map(str::to_string)))
            .collect();
        Ok(Card {
            id: integer("id")?,
            number: integer("number")?,
            name: row.get("name").unwrap_or_default().to_string(),
            description: row.get("description").map(str::to_string),
            card_type_name: row.get("card_type_name").unwrap_or_default().to_string(),
            version: integer("version")?,
            values,
        })
    }

    pub fn load(&self, card_id: CardId) -> Result<Option<Card>> {
        Ok(self.load_many(&[card_id])?.into_iter().next())
    }

    /// Cards with the given ids, ordered by number.
    pub fn load_many(&self, card_ids: &[CardId]) -> Result<Vec<Card>> {
        let mut cards = Vec::with_capacity(card_ids.len());
        for batch in card_ids.chunks(MAX_IDS_PER_STATEMENT) {
            let sql = self
                .select()
                .and_where(Expr::col(Alias::new("id")).is_in(batch.iter().copied()))
                .to_string(SqliteQueryBuilder);
            for row in self.store.query_rows(&sql)? {
                cards.push(self.card_from_row(&row)?);
            }
        }
        cards.sort_by_key(|c| c.number);
        Ok(cards)
    }

    pub fn find_by_number(&self, number: i64) -> Result<Option<Card>> {
        let sql = self
            .select()
            .and_where(Expr::col(Alias::new("number")).eq(number))
            .to_string(SqliteQueryBuilder);
        match self.store.query_rows(&sql)?.first() {
            Some(row) => Ok(Some(self.card_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Number of cards of a card type, for guarded card type deletion.
    pub fn count_of_type(&self, card_type: &str) -> Result<usize> {
        let sql = Query::select()
            .expr(Expr::col(Asterisk).count())
            .from(Alias::new(self.project.cards_table()))
            .and_where(
                Expr::expr(Func::lower(Expr::col(Alias::new("card_type_name"))))
                    .eq(card_type.trim().to_lowercase()),
            )
            .to_string(SqliteQueryBuilder);
        Ok(self
            .store
            .query_scalar(&sql)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Turn a card reference (`12` or `#12`) into the referenced card's id
    /// for card-valued properties. Other values pass through.
    pub(crate) fn resolve_card_value(
        &self,
        property: &PropertyDefinition,
        value: Option<String>,
    ) -> Result<Option<String>> {
        let Some(raw) = value else {
            return Ok(None);
        };
        if !property.is_relationship() {
            return Ok(Some(raw));
        }
        let number: i64 = raw.trim_start_matches('#').parse().map_err(|_| {
            DomainError::invalid(format!("{} is not a valid card number for {}.", raw, property.name))
        })?;
        let card = self.find_by_number(number)?.ok_or_else(|| {
            DomainError::invalid(format!("Card #{} referenced by {} does not exist.", number, property.name))
        })?;
        Ok(Some(card.id.to_string()))
    }

    pub(crate) fn insert(
        &self,
        card_id: CardId,
        number: i64,
        card: &NewCard,
        card_type: &str,
        values: &[(&PropertyDefinition, Option<String>)],
        updated_at: &str,
    ) -> Result<()> {
        let mut columns = vec![
            Alias::new("id"),
            Alias::new("number"),
            Alias::new("name"),
            Alias::new("description"),
            Alias::new("card_type_name"),
            Alias::new("version"),
            Alias::new("updated_at"),
        ];
        let mut row: Vec<SimpleExpr> = vec![
            card_id.into(),
            number.into(),
            card.name.trim().into(),
            card.description.clone().into(),
            card_type.into(),
            1i64.into(),
            updated_at.into(),
        ];
        for (property, value) in values {
            columns.push(Alias::new(&property.column_name));
            row.push(value.clone().into());
        }
        let sql = Query::insert()
            .into_table(Alias::new(self.project.cards_table()))
            .columns(columns)
            .values(row)?
            .to_string(SqliteQueryBuilder);
        self.store.execute(&sql)?;
        Ok(())
    }
}

impl<'a, S, Q> RecomputeEngine<'a, S, Q>
where
    S: CardStore + VersionStore,
    Q: WorkQueue,
{
    pub fn cards(&self) -> CardRepository<'a, S> {
        CardRepository::new(self.project(), self.store())
    }

    /// Create a card. Values go through the correction pipeline, formulas
    /// are computed and aggregates of the card's own type are initialized.
    pub fn create_card(&self, new_card: NewCard) -> Result<Card> {
        let project = self.project();
        let store = self.store();
        let card_type = project
            .card_type(&new_card.card_type)
            .ok_or_else(|| DomainError::not_found("Card type", new_card.card_type.clone()))?
            .name
            .clone();

        let repository = self.cards();
        let pipeline = ValuePipeline::new(project);
        let mut errors = Vec::new();
        if new_card.name.trim().is_empty() {
            errors.push("Name can't be blank.".to_string());
        }
        let mut values = Vec::new();
        for (name, raw) in &new_card.values {
            let Some(property) = project.find_property(name) else {
                errors.push(format!("Card property '{}' does not exist!", name));
                continue;
            };
            if property.is_predefined() {
                errors.push(format!("{} is set on the card itself.", property.name));
                continue;
            }
            if !property.applies_to(&card_type) {
                errors.push(format!(
                    "{} is not applicable to card type {}.",
                    property.name, card_type
                ));
                continue;
            }
            if property.is_tree_relationship() {
                errors.push(format!(
                    "{} is set by adding the card to its tree.",
                    property.name
                ));
                continue;
            }
            match pipeline.correct(property, raw.as_deref()) {
                Ok(value) => values.push((property, repository.resolve_card_value(property, value)?)),
                Err(err) => errors.push(err.to_string()),
            }
        }
        if !errors.is_empty() {
            return Err(DomainError::Validation(errors).into());
        }

        store.transaction(|| {
            let card_id = store.next_sequence(&format!("{}_card_ids", project.identifier))?;
            let number = store.next_sequence(&format!("{}_card_numbers", project.identifier))?;
            let updated_at = store.now().format(TIMESTAMP_FORMAT).to_string();
            repository.insert(card_id, number, &new_card, &card_type, &values, &updated_at)?;

            let mut changed = vec![NUMBER_PROPERTY_ID, NAME_PROPERTY_ID, TYPE_PROPERTY_ID];
            changed.extend(values.iter().map(|(p, _)| p.id));
            let mut seeds = vec![Seed::Changed {
                cards: vec![card_id],
                properties: changed,
            }];
            for property in project.properties.iter().filter(|p| p.is_calculated()) {
                let applies = match &property.kind {
                    PropertyKind::Aggregate(aggregate) => {
                        aggregate.aggregate_card_type.eq_ignore_ascii_case(&card_type)
                    }
                    _ => property.applies_to(&card_type),
                };
                if applies {
                    seeds.push(Seed::Recompute {
                        property: property.id,
                        cards: vec![card_id],
                    });
                }
            }
            self.run(seeds, false)?;
            store.record_versions(&project.schema, &[card_id])?;
            info!(number, card_type = %card_type, "Created card");
            repository
                .load(card_id)?
                .ok_or_else(|| anyhow!("Card {} not found after insert", card_id))
        })
    }
}
