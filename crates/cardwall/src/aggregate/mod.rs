//! Aggregate properties: roll-ups of a target property over the
//! descendants of a card in a tree.

pub mod engine;
pub mod stale;
pub mod state;

pub use engine::{EngineSettings, RecomputeEngine, RecomputeStats};
pub(crate) use engine::Seed;
pub use stale::StaleMarkers;
pub use state::{AggregateEvent, AggregateState};

use sea_query::{Alias, Expr, ExprTrait, Func, Query, SqliteQueryBuilder};
use tracing::info;

use crate::context::EvaluationContext;
use crate::domain::{CardId, Project, PropertyDefinition, PropertyId, PropertyKind, TreeId};
use crate::errors::DomainError;
use crate::graph::{check_circular_reference, property_dependencies};
use crate::mql::{self, AggregateFunction, Condition};
use crate::query::CardQuery;

/// Which descendants contribute to an aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateScope {
    AllDescendants,
    /// Only descendants of this card type.
    CardType(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateDefinition {
    pub tree_id: TreeId,
    /// Card type the aggregate is shown on.
    pub aggregate_card_type: String,
    pub scope: AggregateScope,
    pub function: AggregateFunction,
    /// Required for every function except COUNT.
    pub target_property_id: Option<PropertyId>,
    /// MQL condition restricting contributing descendants.
    pub condition: Option<String>,
}

impl AggregateDefinition {
    pub fn parsed_condition(&self) -> Result<Option<Condition>, DomainError> {
        match self.condition.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Ok(Some(mql::parse_condition(text)?)),
            _ => Ok(None),
        }
    }

    /// Properties named in the condition; empty when it does not parse.
    pub fn condition_property_names(&self) -> Vec<String> {
        self.parsed_condition()
            .ok()
            .flatten()
            .map(|c| c.property_names())
            .unwrap_or_default()
    }

    /// Card types whose cards contribute values.
    pub fn scope_card_types(&self, project: &Project) -> Vec<String> {
        match &self.scope {
            AggregateScope::CardType(card_type) => vec![card_type.clone()],
            AggregateScope::AllDescendants => project
                .tree_by_id(self.tree_id)
                .map(|tree| tree.types_below(&self.aggregate_card_type))
                .unwrap_or_default(),
        }
    }

    /// Relationship linking contributing cards to the aggregate card.
    pub fn relationship<'p>(&self, project: &'p Project) -> Option<&'p PropertyDefinition> {
        project
            .tree_by_id(self.tree_id)
            .and_then(|tree| tree.relationship_id_for(&self.aggregate_card_type))
            .and_then(|id| project.property(id))
    }

    pub fn describe(&self, project: &Project) -> String {
        let target = self
            .target_property_id
            .and_then(|id| project.property(id))
            .map_or("*".to_string(), |p| p.name.clone());
        let scope = match &self.scope {
            AggregateScope::AllDescendants => "all descendants".to_string(),
            AggregateScope::CardType(t) => t.clone(),
        };
        format!("{}({}) of {}", self.function.as_str(), target, scope)
    }

    /// Every problem with this definition, all reported together.
    pub fn validate(
        &self,
        project: &Project,
        property_id: Option<PropertyId>,
        name: &str,
    ) -> Vec<String> {
        let mut errors = Vec::new();
        let Some(tree) = project.tree_by_id(self.tree_id) else {
            errors.push(format!("Tree {} does not exist.", self.tree_id));
            return errors;
        };
        match tree.level_of(&self.aggregate_card_type) {
            None => errors.push(format!(
                "Card type {} is not part of tree {}.",
                self.aggregate_card_type, tree.name
            )),
            Some(level) if level + 1 == tree.levels().len() => errors.push(format!(
                "Card type {} has no descendants in tree {}.",
                self.aggregate_card_type, tree.name
            )),
            Some(_) => {}
        }
        if let AggregateScope::CardType(scope) = &self.scope {
            if !tree.type_contains(&self.aggregate_card_type, scope) {
                errors.push(format!(
                    "Scope card type {} is not below {} in tree {}.",
                    scope, self.aggregate_card_type, tree.name
                ));
            }
        }

        match self.target_property_id.map(|id| (id, project.property(id))) {
            None if self.function != AggregateFunction::Count => errors.push(format!(
                "{} needs a target property for {}.",
                name,
                self.function.as_str()
            )),
            None => {}
            Some((id, None)) => errors.push(format!("Target property {} does not exist.", id)),
            Some((_, Some(target))) => {
                if target.aggregate().is_some() {
                    errors.push(format!(
                        "{} cannot have another aggregate property ({}) as a target.",
                        name, target.name
                    ));
                } else if self.function != AggregateFunction::Count && !target.is_numeric() {
                    errors.push(format!(
                        "Target property {} of {} must be numeric.",
                        target.name, name
                    ));
                }
                let scope_types = self.scope_card_types(project);
                if !scope_types.is_empty() && !scope_types.iter().any(|t| target.applies_to(t)) {
                    errors.push(format!(
                        "Target property {} is not available to {}.",
                        target.name,
                        scope_types.join(", ")
                    ));
                }
            }
        }

        match self.parsed_condition() {
            Err(err) => errors.push(format!("Aggregate condition is not valid. {}", err)),
            Ok(Some(condition)) if condition.uses_this_card() => {
                errors.push("Aggregate conditions cannot use THIS CARD.".to_string())
            }
            Ok(Some(condition)) => {
                let ctx = EvaluationContext::new(project);
                if let Err(err) = CardQuery::from_condition(&ctx, Some(condition)) {
                    errors.push(format!("Aggregate condition is not valid. {}", err));
                }
            }
            Ok(None) => {}
        }

        if errors.is_empty() {
            if let Some(id) = property_id {
                let dependencies =
                    property_dependencies(project, &PropertyKind::Aggregate(self.clone()));
                if let Err(err) = check_circular_reference(project, id, name, &dependencies) {
                    errors.extend(err.messages());
                }
            }
        }
        errors
    }

    /// Correlated sub-select computing the aggregate for each row of the
    /// cards table.
    pub fn value_sql(&self, project: &Project) -> Result<String, DomainError> {
        let relationship = self.relationship(project).ok_or_else(|| {
            DomainError::invalid(format!(
                "Card type {} has no relationship in its tree.",
                self.aggregate_card_type
            ))
        })?;
        let cards = project.cards_table();
        let descendants = "descendants";
        let target = match self.target_property_id.and_then(|id| project.property(id)) {
            Some(target) => Some(Expr::col((Alias::new(descendants), Alias::new(&target.column_name)))),
            None => None,
        };
        let value = match (self.function, target) {
            (AggregateFunction::Count, _) => Expr::cust("COUNT(*)"),
            (AggregateFunction::Sum, Some(t)) => Func::sum(t).into(),
            (AggregateFunction::Avg, Some(t)) => Func::avg(t).into(),
            (AggregateFunction::Min, Some(t)) => Func::min(t).into(),
            (AggregateFunction::Max, Some(t)) => Func::max(t).into(),
            (function, None) => {
                return Err(DomainError::invalid(format!(
                    "{} needs a target property.",
                    function.as_str()
                )))
            }
        };
        let scope: Vec<String> = self
            .scope_card_types(project)
            .iter()
            .map(|t| t.to_lowercase())
            .collect();

        let mut select = Query::select();
        select
            .expr(value)
            .from_as(Alias::new(&cards), Alias::new(descendants))
            .and_where(
                Expr::col((Alias::new(descendants), Alias::new(&relationship.column_name)))
                    .equals((Alias::new(&cards), Alias::new("id"))),
            )
            .and_where(
                Expr::expr(Func::lower(Expr::col((
                    Alias::new(descendants),
                    Alias::new("card_type_name"),
                ))))
                .is_in(scope),
            );
        if let Some(condition) = self.parsed_condition()? {
            let ctx = EvaluationContext::new(project);
            let matching = CardQuery::from_condition(&ctx, Some(condition))?;
            select.and_where(Expr::cust(format!(
                r#""{}"."id" IN ({})"#,
                descendants,
                matching.to_card_id_sql()
            )));
        }
        Ok(select.to_string(SqliteQueryBuilder))
    }

    /// Ids of aggregate cards among `card_ids` whose stored value differs
    /// from the computed one.
    pub(crate) fn stale_ids_sql(
        &self,
        project: &Project,
        property: &PropertyDefinition,
        card_ids: &[CardId],
    ) -> Result<String, DomainError> {
        let cards = project.cards_table();
        Ok(Query::select()
            .column(Alias::new("id"))
            .from(Alias::new(&cards))
            .and_where(Expr::col(Alias::new("id")).is_in(card_ids.iter().copied()))
            .and_where(
                Expr::expr(Func::lower(Expr::col(Alias::new("card_type_name"))))
                    .eq(self.aggregate_card_type.to_lowercase()),
            )
            .and_where(Expr::cust(format!(
                r#""{}"."{}" IS NOT ({})"#,
                cards,
                property.column_name,
                self.value_sql(project)?
            )))
            .to_string(SqliteQueryBuilder))
    }

    pub(crate) fn update_sql(
        &self,
        project: &Project,
        property: &PropertyDefinition,
        card_ids: &[CardId],
    ) -> Result<String, DomainError> {
        Ok(Query::update()
            .table(Alias::new(project.cards_table()))
            .value(
                Alias::new(&property.column_name),
                Expr::cust(format!("({})", self.value_sql(project)?)),
            )
            .and_where(Expr::col(Alias::new("id")).is_in(card_ids.iter().copied()))
            .to_string(SqliteQueryBuilder))
    }
}

impl Project {
    pub fn create_aggregate(
        &mut self,
        name: &str,
        definition: AggregateDefinition,
    ) -> Result<PropertyId, DomainError> {
        self.validate_property_name(name, None)?;
        let errors = definition.validate(self, None, name);
        if !errors.is_empty() {
            return Err(DomainError::Validation(errors));
        }
        let card_type = definition.aggregate_card_type.clone();
        let description = definition.describe(self);
        let id = self.insert_property(name, PropertyKind::Aggregate(definition), &[&card_type])?;
        info!(property = name, aggregate = %description, "Created aggregate property");
        Ok(id)
    }

    /// Replace an aggregate's definition. Returns the previous definition.
    pub fn update_aggregate(
        &mut self,
        property_id: PropertyId,
        definition: AggregateDefinition,
    ) -> Result<AggregateDefinition, DomainError> {
        let property = self
            .property(property_id)
            .ok_or_else(|| DomainError::not_found("Property", property_id.to_string()))?;
        let previous = property.aggregate().cloned().ok_or_else(|| {
            DomainError::invalid(format!("{} is not an aggregate property.", property.name))
        })?;
        let name = property.name.clone();
        let errors = definition.validate(self, Some(property_id), &name);
        if !errors.is_empty() {
            return Err(DomainError::Validation(errors));
        }
        let card_type = self
            .card_type(&definition.aggregate_card_type)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| definition.aggregate_card_type.clone());
        if let Some(property) = self.property_mut(property_id) {
            property.card_types = vec![card_type];
            property.kind = PropertyKind::Aggregate(definition);
        }
        info!(property = %name, "Updated aggregate property");
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::enumeration_values;

    fn project() -> (Project, PropertyId) {
        let mut project = Project::new("agile", "Agile");
        for t in ["Release", "Iteration", "Story"] {
            project.create_card_type(t).unwrap();
        }
        let points = project
            .create_property(
                "Points",
                PropertyKind::Enumerated {
                    numeric: true,
                    values: enumeration_values(&["1", "2", "3", "5", "8"]),
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
                &["Story"],
            )
            .unwrap();
        project
            .create_tree("Planning", &["Release", "Iteration", "Story"])
            .unwrap();
        (project, points)
    }

    fn sum_of(project: &Project, target: PropertyId) -> AggregateDefinition {
        AggregateDefinition {
            tree_id: project.tree("Planning").unwrap().id,
            aggregate_card_type: "Release".to_string(),
            scope: AggregateScope::AllDescendants,
            function: AggregateFunction::Sum,
            target_property_id: Some(target),
            condition: None,
        }
    }

    #[test]
    fn test_scope_card_types() {
        let (project, points) = project();
        let definition = sum_of(&project, points);
        assert_eq!(definition.scope_card_types(&project), vec!["Iteration", "Story"]);
        let scoped = AggregateDefinition {
            scope: AggregateScope::CardType("Story".to_string()),
            ..definition
        };
        assert_eq!(scoped.scope_card_types(&project), vec!["Story"]);
    }

    #[test]
    fn test_aggregate_target_cannot_be_aggregate() {
        let (mut project, points) = project();
        let total = project
            .create_aggregate("Total Points", sum_of(&project, points))
            .unwrap();
        let other = project
            .create_aggregate("Other Total", sum_of(&project, points))
            .unwrap();
        let err = project
            .update_aggregate(other, sum_of(&project, total))
            .unwrap_err();
        assert!(err.messages()[0]
            .contains("cannot have another aggregate property (Total Points) as a target"));
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let (project, _) = project();
        let status = project.find_property("Status").unwrap().id;
        let definition = AggregateDefinition {
            tree_id: project.tree("Planning").unwrap().id,
            aggregate_card_type: "Story".to_string(),
            scope: AggregateScope::CardType("Release".to_string()),
            function: AggregateFunction::Sum,
            target_property_id: Some(status),
            condition: Some("Status = THIS CARD.Status".to_string()),
        };
        let errors = definition.validate(&project, None, "Broken");
        assert_eq!(errors.len(), 5, "{:?}", errors);
        assert!(errors[0].contains("has no descendants"));
        assert!(errors[1].contains("is not below"));
        assert!(errors[2].contains("must be numeric"));
        assert!(errors[3].contains("not available to Release"));
        assert!(errors[4].contains("THIS CARD"));
    }

    #[test]
    fn test_count_needs_no_target() {
        let (mut project, _) = project();
        let definition = AggregateDefinition {
            function: AggregateFunction::Count,
            target_property_id: None,
            condition: Some("Status = done".to_string()),
            ..sum_of(&project, 0)
        };
        let id = project.create_aggregate("Done Stories", definition).unwrap();
        let property = project.property(id).unwrap();
        assert!(property.applies_to("Release"));
        assert_eq!(
            property.aggregate().unwrap().condition_property_names(),
            vec!["Status"]
        );
    }

    #[test]
    fn test_value_sql_shape() {
        let (project, points) = project();
        let mut definition = sum_of(&project, points);
        definition.condition = Some("Status = done".to_string());
        let sql = definition.value_sql(&project).unwrap();
        assert!(sql.starts_with(r#"SELECT SUM("descendants"."cp_points") FROM "agile_cards" AS "descendants""#), "{}", sql);
        assert!(sql.contains(r#""descendants"."cp_planning_release" = "agile_cards"."id""#), "{}", sql);
        assert!(sql.contains("IN ('iteration', 'story')"), "{}", sql);
        assert!(sql.contains(r#""descendants"."id" IN (SELECT"#), "{}", sql);
    }

    #[test]
    fn test_cycle_through_formula_is_rejected() {
        let (mut project, points) = project();
        let total = project
            .create_aggregate("Total Points", sum_of(&project, points))
            .unwrap();
        let doubled = project
            .create_formula("Doubled Total", "'Total Points' * 2", false, &["Release"])
            .unwrap();
        project.associate_property(doubled, "Story").unwrap();
        let err = project
            .update_aggregate(total, sum_of(&project, doubled))
            .unwrap_err();
        assert!(err.messages()[0].contains("circular reference"), "{:?}", err);
    }
}
