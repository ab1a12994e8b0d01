//! Cascaded tree filters.
//!
//! Each tree level may carry its own view filters (`tf_<Card Type>` params)
//! and levels may be excluded (`excluded` param). A filter on a level also
//! restricts every level below it: a card is shown only when each filtered
//! ancestor level holds an ancestor matching that level's filters. A card
//! whose filtered children are all hidden is still shown.

use serde::Serialize;

use super::TreeConfiguration;
use crate::context::EvaluationContext;
use crate::domain::{Params, Project};
use crate::errors::DomainError;
use crate::filters::Filters;
use crate::mql::{Condition, Operator, ParsedQuery, SelectColumn, Value};
use crate::query::CardQuery;

pub const TREE_FILTER_PREFIX: &str = "tf_";
pub const EXCLUDED_PARAM: &str = "excluded";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeFilters<'a> {
    #[serde(skip)]
    tree: &'a TreeConfiguration,
    levels: Vec<(String, Filters)>,
    excluded: Vec<String>,
    /// `tf_` params naming card types outside the tree.
    unknown_levels: Vec<String>,
}

impl<'a> TreeFilters<'a> {
    pub fn new(tree: &'a TreeConfiguration) -> Self {
        TreeFilters {
            tree,
            levels: tree
                .levels()
                .iter()
                .map(|l| (l.clone(), Filters::default()))
                .collect(),
            excluded: Vec::new(),
            unknown_levels: Vec::new(),
        }
    }

    pub fn from_params(tree: &'a TreeConfiguration, params: &Params) -> Result<Self, DomainError> {
        let mut filters = TreeFilters::new(tree);
        let mut errors = Vec::new();
        for (key, values) in params {
            let Some(card_type) = key.strip_prefix(TREE_FILTER_PREFIX) else {
                continue;
            };
            match Filters::parse(values) {
                Ok(parsed) => {
                    if filters.set_filters(card_type, parsed).is_err() {
                        filters.unknown_levels.push(card_type.to_string());
                    }
                }
                Err(err) => errors.extend(err.messages()),
            }
        }
        if let Some(excluded) = params.get(EXCLUDED_PARAM) {
            for card_type in excluded {
                filters.exclude(card_type);
            }
        }
        if errors.is_empty() {
            Ok(filters)
        } else {
            Err(DomainError::Validation(errors))
        }
    }

    pub fn tree(&self) -> &'a TreeConfiguration {
        self.tree
    }

    pub fn set_filters(&mut self, card_type: &str, filters: Filters) -> Result<(), DomainError> {
        let level = self
            .tree
            .level_of(card_type)
            .ok_or_else(|| DomainError::not_found("Tree level", card_type))?;
        self.levels[level].1 = filters;
        Ok(())
    }

    pub fn exclude(&mut self, card_type: &str) {
        if !self.excluded.iter().any(|e| e.eq_ignore_ascii_case(card_type.trim())) {
            self.excluded.push(card_type.trim().to_string());
        }
    }

    pub fn filters_for(&self, card_type: &str) -> Option<&Filters> {
        self.tree.level_of(card_type).map(|level| &self.levels[level].1)
    }

    pub fn is_excluded(&self, card_type: &str) -> bool {
        self.excluded.iter().any(|e| e.eq_ignore_ascii_case(card_type))
    }

    pub fn is_empty(&self) -> bool {
        self.excluded.is_empty() && self.levels.iter().all(|(_, f)| f.is_empty())
    }

    pub fn to_params(&self) -> Params {
        let mut params = Params::new();
        for (card_type, filters) in &self.levels {
            if !filters.is_empty() {
                params.insert(
                    format!("{}{}", TREE_FILTER_PREFIX, card_type),
                    filters.to_strings(),
                );
            }
        }
        if !self.excluded.is_empty() {
            params.insert(EXCLUDED_PARAM.to_string(), self.excluded.clone());
        }
        params
    }

    /// Problems on any level make the whole set invalid, whether or not
    /// that level currently matches cards.
    pub fn validation_errors(&self, project: &Project) -> Vec<String> {
        let mut errors = Vec::new();
        for card_type in &self.unknown_levels {
            errors.push(format!(
                "Card type {} is not part of tree {}.",
                card_type, self.tree.name
            ));
        }
        for card_type in &self.excluded {
            if !self.tree.contains(card_type) {
                errors.push(format!(
                    "Card type {} is not part of tree {}.",
                    card_type, self.tree.name
                ));
            }
        }
        if self.levels.iter().all(|(card_type, _)| self.is_excluded(card_type)) {
            errors.push(format!(
                "Every card type of tree {} is excluded.",
                self.tree.name
            ));
        }
        for (card_type, filters) in &self.levels {
            for error in filters.validation_errors(project) {
                errors.push(format!("{} filter: {}", card_type, error));
            }
            for filter in filters.iter() {
                let Some(property) = project.find_property(&filter.property) else {
                    continue;
                };
                if !property.is_predefined() && !property.applies_to(card_type) {
                    errors.push(format!(
                        "{} filter: Property {} is not valid for card type {}.",
                        card_type, property.name, card_type
                    ));
                }
            }
        }
        errors
    }

    pub fn description(&self) -> String {
        let mut parts: Vec<String> = self
            .levels
            .iter()
            .filter(|(_, f)| !f.is_empty())
            .map(|(card_type, f)| format!("{}: {}", card_type, f.description()))
            .collect();
        if !self.excluded.is_empty() {
            parts.push(format!("excluding {}", self.excluded.join(", ")));
        }
        if parts.is_empty() {
            format!("All cards in tree {}", self.tree.name)
        } else {
            parts.join("; ")
        }
    }

    /// Condition selecting the visible cards of the tree; `None` when no
    /// level is filtered or excluded.
    pub fn to_condition(&self, project: &Project) -> Result<Option<Condition>, DomainError> {
        let errors = self.validation_errors(project);
        if !errors.is_empty() {
            return Err(DomainError::Validation(errors));
        }
        if self.is_empty() {
            return Ok(None);
        }
        let relationships = self.tree.relationships(project);
        let mut own_conditions = Vec::with_capacity(self.levels.len());
        for (_, filters) in &self.levels {
            own_conditions.push(filters.to_condition(project)?);
        }

        let mut visible = Vec::new();
        for (level, (card_type, _)) in self.levels.iter().enumerate() {
            if self.is_excluded(card_type) {
                continue;
            }
            let mut parts = vec![of_type(card_type)];
            if let Some(own) = &own_conditions[level] {
                parts.push(own.clone());
            }
            for (above, (ancestor_type, _)) in self.levels[..level].iter().enumerate() {
                let (Some(filter), Some(relationship)) = (
                    &own_conditions[above],
                    relationships.relationship_for(ancestor_type),
                ) else {
                    continue;
                };
                let matching_ancestors = ParsedQuery {
                    columns: vec![SelectColumn::Property("Number".to_string())],
                    condition: Condition::all([of_type(ancestor_type), filter.clone()]),
                    ..ParsedQuery::default()
                };
                parts.push(Condition::InQuery {
                    property: relationship.name.clone(),
                    query: Box::new(matching_ancestors),
                    negated: false,
                });
            }
            visible.extend(Condition::all(parts));
        }
        Ok(Condition::any(visible))
    }

    /// The filtered tree as a query over its members.
    pub fn to_query<'c>(&self, ctx: &EvaluationContext<'c>) -> Result<CardQuery<'c>, DomainError> {
        let parsed = ParsedQuery {
            from_trees: vec![self.tree.name.clone()],
            condition: self.to_condition(ctx.project)?,
            ..ParsedQuery::default()
        };
        CardQuery::new(ctx, parsed)
    }
}

fn of_type(card_type: &str) -> Condition {
    Condition::compare("Type", Operator::Eq, Value::Literal(card_type.to_string()))
}
