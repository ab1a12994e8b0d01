//! Renaming properties and enumeration values.
//!
//! A property keeps its column binding when renamed; only the objects that
//! refer to it by name are rewritten. Stored MQL is parsed, renamed on the
//! AST and serialized again.

use anyhow::{Context, Result};
use sea_query::{Alias, Expr, ExprTrait, Func, Query, SqliteQueryBuilder};
use serde::Serialize;
use tracing::{debug, info};

use crate::domain::{Params, Project, PropertyId, PropertyKind};
use crate::errors::DomainError;
use crate::filters::{rename_property_in_params, rename_value_in_params};
use crate::formula::FormulaExpr;
use crate::mql;
use crate::storage::CardStore;

use super::{canonical_number, same_enumeration_value};

/// View params whose values are plain property names.
const PROPERTY_NAME_PARAMS: &[&str] = &["columns", "sort", "group_by", "color_by", "lanes"];

/// View param holding a full MQL statement.
pub const MQL_PARAM: &str = "mql";

/// Everything a rename rewrote, by owner name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenameReport {
    /// Formula properties whose formula text changed
    pub formulas: Vec<String>,
    /// Aggregate properties whose condition changed
    pub aggregates: Vec<String>,
    /// Favorite views whose params changed
    pub views: Vec<String>,
    /// Transitions whose prerequisites or actions changed
    pub transitions: Vec<String>,
    /// Users whose history subscriptions changed
    pub subscriptions: Vec<String>,
    /// Project variables whose value changed
    pub variables: Vec<String>,
    /// Aggregates to recompute once the new names are stored
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recompute: Vec<PropertyId>,
}

impl RenameReport {
    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
            && self.aggregates.is_empty()
            && self.views.is_empty()
            && self.transitions.is_empty()
            && self.subscriptions.is_empty()
            && self.variables.is_empty()
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|n| n == name) {
        list.push(name.to_string());
    }
}

fn rename_in_view_params(params: &mut Params, old: &str, new: &str) -> Result<bool, DomainError> {
    let mut changed = rename_property_in_params(params, old, new);
    for key in PROPERTY_NAME_PARAMS {
        if let Some(values) = params.get_mut(*key) {
            for value in values.iter_mut() {
                if value.trim().eq_ignore_ascii_case(old) {
                    *value = new.to_string();
                    changed = true;
                }
            }
        }
    }
    if let Some(values) = params.get_mut(MQL_PARAM) {
        for value in values.iter_mut() {
            let mut query = mql::parse(value)?;
            if query.rename_property(old, new) {
                *value = query.to_string();
                changed = true;
            }
        }
    }
    Ok(changed)
}

impl Project {
    /// Rename a property and rewrite every reference to it by name.
    pub fn rename_property(
        &mut self,
        property_id: PropertyId,
        new_name: &str,
    ) -> Result<RenameReport, DomainError> {
        let property = self
            .property(property_id)
            .ok_or_else(|| DomainError::not_found("Property", property_id.to_string()))?;
        if property.is_predefined() {
            return Err(DomainError::invalid(format!(
                "{} is predefined and cannot be renamed.",
                property.name
            )));
        }
        let old = property.name.clone();
        self.validate_property_name(new_name, Some(property_id))?;
        let new = new_name.trim().to_string();
        let mut report = RenameReport::default();
        if old == new {
            return Ok(report);
        }

        // Parse everything before touching anything, so a stored definition
        // that no longer parses leaves the project unchanged.
        let mut formulas = Vec::new();
        for formula_property in self.formula_properties() {
            let Some(definition) = formula_property.formula() else {
                continue;
            };
            let mut expr = FormulaExpr::parse(&definition.formula)?;
            if expr.rename_property(&old, &new) {
                formulas.push((formula_property.id, expr.to_string()));
            }
        }
        let mut conditions = Vec::new();
        for aggregate_property in self.aggregate_properties() {
            let Some(text) = aggregate_property
                .aggregate()
                .and_then(|a| a.condition.as_deref())
            else {
                continue;
            };
            if let Some(renamed) = mql::rename_property_in_condition(text, &old, &new)? {
                conditions.push((aggregate_property.id, renamed));
            }
        }
        let mut views = Vec::new();
        for (index, view) in self.views.iter().enumerate() {
            let mut params = view.params.clone();
            if rename_in_view_params(&mut params, &old, &new)? {
                views.push((index, params));
            }
        }

        for (id, text) in formulas {
            if let Some(formula_property) = self.property_mut(id) {
                if let PropertyKind::Formula(definition) = &mut formula_property.kind {
                    definition.formula = text;
                }
                report.formulas.push(formula_property.name.clone());
            }
        }
        for (id, text) in conditions {
            if let Some(aggregate_property) = self.property_mut(id) {
                if let PropertyKind::Aggregate(definition) = &mut aggregate_property.kind {
                    definition.condition = Some(text);
                }
                report.aggregates.push(aggregate_property.name.clone());
            }
        }
        for (index, params) in views {
            self.views[index].params = params;
            report.views.push(self.views[index].name.clone());
        }
        for transition in &mut self.transitions {
            for assignment in transition
                .prerequisites
                .iter_mut()
                .chain(transition.actions.iter_mut())
            {
                if assignment.property.eq_ignore_ascii_case(&old) {
                    assignment.property = new.clone();
                    push_unique(&mut report.transitions, &transition.name);
                }
            }
        }
        for subscription in &mut self.subscriptions {
            for filters in [&mut subscription.involved, &mut subscription.acquired] {
                let keys: Vec<String> = filters
                    .keys()
                    .filter(|k| k.eq_ignore_ascii_case(&old))
                    .cloned()
                    .collect();
                for key in keys {
                    if let Some(value) = filters.remove(&key) {
                        filters.insert(new.clone(), value);
                        push_unique(&mut report.subscriptions, &subscription.user);
                    }
                }
            }
        }

        if let Some(property) = self.property_mut(property_id) {
            property.name = new.clone();
        }
        info!(
            from = %old,
            to = %new,
            formulas = report.formulas.len(),
            aggregates = report.aggregates.len(),
            views = report.views.len(),
            "Renamed property"
        );
        Ok(report)
    }

    /// Rename a value of a managed list property. Stored card values are
    /// rewritten separately through [`rename_stored_values`]; aggregates
    /// whose condition mentions the value are listed for recomputation.
    pub fn rename_enumeration_value(
        &mut self,
        property_id: PropertyId,
        old: &str,
        new: &str,
    ) -> Result<RenameReport, DomainError> {
        let property = self
            .property(property_id)
            .ok_or_else(|| DomainError::not_found("Property", property_id.to_string()))?;
        let name = property.name.clone();
        let PropertyKind::Enumerated { numeric, values } = &property.kind else {
            return Err(DomainError::invalid(format!(
                "{} is not a managed list property.",
                name
            )));
        };
        let numeric = *numeric;
        let new = new.trim();
        let Some(position) = values
            .iter()
            .position(|v| same_enumeration_value(numeric, &v.value, old))
        else {
            return Err(DomainError::not_found(
                "Enumeration value",
                format!("{} of {}", old.trim(), name),
            ));
        };
        let old = values[position].value.clone();
        let mut errors = Vec::new();
        if new.is_empty() {
            errors.push("Value can't be blank.".to_string());
        } else if numeric && canonical_number(new).is_none() {
            errors.push(format!("Value '{}' is an invalid numeric value.", new));
        }
        if let Some(existing) = values
            .iter()
            .enumerate()
            .find(|(i, v)| *i != position && same_enumeration_value(numeric, &v.value, new))
        {
            errors.push(format!(
                "Value '{}' already exists for {} as '{}'.",
                new, name, existing.1.value
            ));
        }
        if !errors.is_empty() {
            return Err(DomainError::Validation(errors));
        }
        let same = move |a: &str, b: &str| same_enumeration_value(numeric, a, b);

        let mut conditions = Vec::new();
        for aggregate_property in self.aggregate_properties() {
            let Some(text) = aggregate_property
                .aggregate()
                .and_then(|a| a.condition.as_deref())
            else {
                continue;
            };
            let mut condition = mql::parse_condition(text)?;
            if condition.rename_value(&name, &old, new, &same) {
                conditions.push((aggregate_property.id, condition.to_string()));
            }
        }
        let mut views = Vec::new();
        for (index, view) in self.views.iter().enumerate() {
            let mut params = view.params.clone();
            let mut changed = rename_value_in_params(&mut params, &name, &old, new, &same);
            if let Some(statements) = params.get_mut(MQL_PARAM) {
                for statement in statements.iter_mut() {
                    let mut query = mql::parse(statement)?;
                    if query
                        .condition
                        .as_mut()
                        .is_some_and(|c| c.rename_value(&name, &old, new, &same))
                    {
                        *statement = query.to_string();
                        changed = true;
                    }
                }
            }
            if changed {
                views.push((index, params));
            }
        }

        let mut report = RenameReport::default();
        if let Some(PropertyKind::Enumerated { values, .. }) =
            self.property_mut(property_id).map(|p| &mut p.kind)
        {
            values[position].value = new.to_string();
        }
        for (id, text) in conditions {
            if let Some(aggregate_property) = self.property_mut(id) {
                if let PropertyKind::Aggregate(definition) = &mut aggregate_property.kind {
                    definition.condition = Some(text);
                }
                report.aggregates.push(aggregate_property.name.clone());
                report.recompute.push(id);
            }
        }
        for (index, params) in views {
            self.views[index].params = params;
            report.views.push(self.views[index].name.clone());
        }
        for transition in &mut self.transitions {
            for assignment in transition
                .prerequisites
                .iter_mut()
                .chain(transition.actions.iter_mut())
            {
                let matches = assignment.property.eq_ignore_ascii_case(&name)
                    && assignment.value.as_deref().is_some_and(|v| same(v, &old));
                if matches {
                    assignment.value = Some(new.to_string());
                    push_unique(&mut report.transitions, &transition.name);
                }
            }
        }
        for subscription in &mut self.subscriptions {
            for filters in [&mut subscription.involved, &mut subscription.acquired] {
                for (key, value) in filters.iter_mut() {
                    if key.eq_ignore_ascii_case(&name) && same(value, &old) {
                        *value = new.to_string();
                        push_unique(&mut report.subscriptions, &subscription.user);
                    }
                }
            }
        }
        for variable in &mut self.variables {
            let matches = variable.property_ids.contains(&property_id)
                && variable.value.as_deref().is_some_and(|v| same(v, &old));
            if matches {
                variable.value = Some(new.to_string());
                report.variables.push(variable.name.clone());
            }
        }
        info!(property = %name, from = %old, to = %new, "Renamed enumeration value");
        Ok(report)
    }
}

/// Rewrite stored card values of an enumerated property from `old` to
/// `new`, in the cards table and its history. Returns the number of card
/// rows changed.
pub fn rename_stored_values<S: CardStore>(
    store: &S,
    project: &Project,
    property_id: PropertyId,
    old: &str,
    new: &str,
) -> Result<usize> {
    let property = project
        .property(property_id)
        .ok_or_else(|| DomainError::not_found("Property", property_id.to_string()))?;
    let column = Alias::new(&property.column_name);
    let matches_old = if property.is_numeric() {
        Expr::col(column.clone()).eq(canonical_number(old).unwrap_or_else(|| old.trim().to_string()))
    } else {
        Expr::expr(Func::lower(Expr::col(column.clone()))).eq(old.trim().to_lowercase())
    };
    let new = if property.is_numeric() {
        canonical_number(new).unwrap_or_else(|| new.trim().to_string())
    } else {
        new.trim().to_string()
    };

    store.transaction(|| {
        let mut changed = 0;
        for table in [
            project.schema.cards_table(),
            project.schema.versions_table(),
        ] {
            let sql = Query::update()
                .table(Alias::new(&table))
                .values([(column.clone(), new.as_str().into())])
                .and_where(matches_old.clone())
                .to_string(SqliteQueryBuilder);
            debug!(sql = %sql, "Rewriting stored enumeration values");
            let rows = store
                .execute(&sql)
                .with_context(|| format!("Failed to rename values of {}", property.name))?;
            if table == project.schema.cards_table() {
                changed = rows;
            }
        }
        Ok(changed)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateDefinition, AggregateScope};
    use crate::domain::{FavoriteView, HistorySubscription, Transition, TransitionValue};
    use crate::mql::AggregateFunction;
    use crate::properties::enumeration_values;
    use std::collections::BTreeMap;

    fn project() -> (Project, PropertyId, PropertyId) {
        let mut project = Project::new("agile", "Agile");
        for card_type in ["Release", "Story"] {
            project.create_card_type(card_type).unwrap();
        }
        let points = project
            .create_property(
                "Points",
                PropertyKind::Enumerated {
                    numeric: true,
                    values: enumeration_values(&["1", "2", "3"]),
                },
                &["Story"],
            )
            .unwrap();
        let status = project
            .create_property(
                "Status",
                PropertyKind::Enumerated {
                    numeric: false,
                    values: enumeration_values(&["open", "done"]),
                },
                &["Story"],
            )
            .unwrap();
        project.create_tree("Planning", &["Release", "Story"]).unwrap();
        let tree_id = project.tree("Planning").unwrap().id;
        project
            .create_formula("Double", "Points * 2", false, &["Story"])
            .unwrap();
        project
            .create_aggregate(
                "Done Points",
                AggregateDefinition {
                    tree_id,
                    aggregate_card_type: "Release".to_string(),
                    scope: AggregateScope::AllDescendants,
                    function: AggregateFunction::Sum,
                    target_property_id: Some(points),
                    condition: Some("Status = done AND Points > 1".to_string()),
                },
            )
            .unwrap();
        let mut params = Params::new();
        params.insert("filters".to_string(), vec!["[Points][is][3]".to_string()]);
        params.insert("columns".to_string(), vec!["Points".to_string(), "Status".to_string()]);
        params.insert(
            MQL_PARAM.to_string(),
            vec!["SELECT Name WHERE Status = done ORDER BY Points".to_string()],
        );
        project.add_view(FavoriteView {
            name: "Big stories".to_string(),
            params,
        });
        project.add_transition(Transition {
            name: "Finish".to_string(),
            card_type: Some("Story".to_string()),
            prerequisites: vec![TransitionValue {
                property: "Status".to_string(),
                value: Some("open".to_string()),
            }],
            actions: vec![TransitionValue {
                property: "Status".to_string(),
                value: Some("done".to_string()),
            }],
        });
        project.add_subscription(HistorySubscription {
            user: "alice".to_string(),
            involved: BTreeMap::from([("points".to_string(), "3".to_string())]),
            acquired: BTreeMap::new(),
        });
        (project, points, status)
    }

    #[test]
    fn test_rename_property_rewrites_every_reference() {
        let (mut project, points, _) = project();
        let column = project.property(points).unwrap().column_name.clone();

        let report = project.rename_property(points, "Story Points").unwrap();
        assert_eq!(report.formulas, vec!["Double"]);
        assert_eq!(report.aggregates, vec!["Done Points"]);
        assert_eq!(report.views, vec!["Big stories"]);
        assert_eq!(report.subscriptions, vec!["alice"]);
        assert!(report.transitions.is_empty());

        let property = project.find_property("story points").unwrap();
        assert_eq!(property.column_name, column);
        assert_eq!(
            project.find_property("Double").unwrap().formula().unwrap().formula,
            "'Story Points' * 2"
        );
        assert_eq!(
            project
                .find_property("Done Points")
                .unwrap()
                .aggregate()
                .unwrap()
                .condition
                .as_deref(),
            Some("Status = done AND 'Story Points' > 1")
        );
        let params = &project.views[0].params;
        assert_eq!(params["filters"], vec!["[Story Points][is][3]"]);
        assert_eq!(params["columns"], vec!["Story Points", "Status"]);
        assert_eq!(
            params[MQL_PARAM],
            vec!["SELECT Name WHERE Status = done ORDER BY 'Story Points'"]
        );
        assert!(project.subscriptions[0].involved.contains_key("Story Points"));
    }

    #[test]
    fn test_rename_property_rejects_taken_and_predefined_names() {
        let (mut project, points, status) = project();
        assert!(project.rename_property(points, "status").is_err());
        assert!(project.rename_property(crate::domain::NAME_PROPERTY_ID, "Title").is_err());
        let report = project.rename_property(status, "State").unwrap();
        assert_eq!(report.transitions, vec!["Finish"]);
        assert_eq!(project.transitions[0].actions[0].property, "State");
    }

    #[test]
    fn test_rename_enumeration_value_marks_aggregates_for_recompute() {
        let (mut project, _, status) = project();
        let report = project
            .rename_enumeration_value(status, "DONE", "complete")
            .unwrap();
        let aggregate = project.find_property("Done Points").unwrap();
        assert_eq!(report.recompute, vec![aggregate.id]);
        assert_eq!(
            aggregate.aggregate().unwrap().condition.as_deref(),
            Some("Status = complete AND Points > 1")
        );
        assert_eq!(report.transitions, vec!["Finish"]);
        assert_eq!(
            project.transitions[0].actions[0].value.as_deref(),
            Some("complete")
        );
        assert_eq!(
            project.views[0].params[MQL_PARAM],
            vec!["SELECT Name WHERE Status = complete ORDER BY Points"]
        );
        assert_eq!(
            project.find_property("Status").unwrap().enumeration_values()[1].value,
            "complete"
        );
    }

    #[test]
    fn test_rename_enumeration_value_respects_numeric_uniqueness() {
        let (mut project, points, _) = project();
        let err = project
            .rename_enumeration_value(points, "1", "2.0")
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert!(project.rename_enumeration_value(points, "7", "8").is_err());
    }
}
