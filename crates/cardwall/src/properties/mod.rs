//! Property definition management.
//!
//! Project-level operations on card types and property definitions:
//! creation with column binding, card type association, enumeration values
//! with numeric-aware uniqueness, and guarded deletion that enumerates every
//! blocking reason before anything changes.

use tracing::info;

use crate::domain::{
    CardType, EnumerationValue, Project, PropertyDefinition, PropertyId, PropertyKind,
};
use crate::errors::DomainError;
use crate::schema::ColumnType;
use crate::storage::format_number;

pub mod correction;
pub mod rename;

pub use correction::{CorrectionStep, ValuePipeline};
pub use rename::RenameReport;

const MAX_NAME_LENGTH: usize = 40;
const FORBIDDEN_NAME_CHARS: &[char] = &['&', '=', '#', ';', '[', ']'];

/// A finite number, or `None`. `NaN` and the infinities are not numbers a
/// card value can hold.
pub fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Whether two enumeration values collide: numerically for numeric
/// properties, case-insensitively otherwise.
pub fn same_enumeration_value(numeric: bool, a: &str, b: &str) -> bool {
    if numeric {
        match (parse_number(a), parse_number(b)) {
            (Some(x), Some(y)) => return x == y,
            (None, None) => {}
            _ => return false,
        }
    }
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Canonical text of a numeric value (`"1.0"` becomes `"1"`).
pub fn canonical_number(text: &str) -> Option<String> {
    parse_number(text).map(format_number)
}

impl Project {
    /// Validate a proposed property name. `except` skips the property being
    /// renamed.
    pub fn validate_property_name(
        &self,
        name: &str,
        except: Option<PropertyId>,
    ) -> Result<(), DomainError> {
        let trimmed = name.trim();
        let mut errors = Vec::new();
        if trimmed.is_empty() {
            errors.push("Name can't be blank.".to_string());
        }
        if trimmed.chars().count() > MAX_NAME_LENGTH {
            errors.push(format!(
                "Name is too long (maximum is {} characters).",
                MAX_NAME_LENGTH
            ));
        }
        if trimmed.contains(FORBIDDEN_NAME_CHARS) {
            errors.push("Name should not contain '&', '=', '#', ';', '[' and ']'.".to_string());
        }
        if let Some(existing) = self.find_property(trimmed) {
            if Some(existing.id) != except {
                errors.push(format!("Name '{}' has already been taken.", existing.name));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DomainError::Validation(errors))
        }
    }

    pub fn create_card_type(&mut self, name: &str) -> Result<&CardType, DomainError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(DomainError::Validation(vec![
                "Card type name can't be blank.".to_string()
            ]));
        }
        if self.card_type(trimmed).is_some() {
            return Err(DomainError::Validation(vec![format!(
                "Card type '{}' already exists.",
                trimmed
            )]));
        }
        let position = self.card_types.iter().map(|t| t.position).max().unwrap_or(0) + 1;
        self.card_types.push(CardType {
            name: trimmed.to_string(),
            position,
            color: None,
        });
        info!(card_type = trimmed, "Created card type");
        Ok(&self.card_types[self.card_types.len() - 1])
    }

    /// Delete a card type that no card uses. `card_count` comes from storage.
    pub fn delete_card_type(&mut self, name: &str, card_count: usize) -> Result<(), DomainError> {
        let card_type = self
            .card_type(name)
            .ok_or_else(|| DomainError::not_found("Card type", name))?
            .name
            .clone();

        let mut reasons = Vec::new();
        if card_count > 0 {
            reasons.push(format!(
                "Card type '{}' is used by {} card{}.",
                card_type,
                card_count,
                if card_count == 1 { "" } else { "s" }
            ));
        }
        for tree in self.trees.iter().filter(|t| t.contains(&card_type)) {
            reasons.push(format!(
                "Card type '{}' belongs to tree '{}'.",
                card_type, tree.name
            ));
        }
        if self.card_types.len() == 1 {
            reasons.push(format!(
                "Card type '{}' is the only card type and cannot be deleted.",
                card_type
            ));
        }
        if !reasons.is_empty() {
            return Err(DomainError::Validation(reasons));
        }

        self.card_types
            .retain(|t| !t.name.eq_ignore_ascii_case(&card_type));
        for property in &mut self.properties {
            property
                .card_types
                .retain(|t| !t.eq_ignore_ascii_case(&card_type));
        }
        info!(card_type = %card_type, "Deleted card type");
        Ok(())
    }

    /// Create a user-editable property (text, enumeration, date, user or
    /// card relationship) and bind its column.
    pub fn create_property(
        &mut self,
        name: &str,
        kind: PropertyKind,
        card_types: &[&str],
    ) -> Result<PropertyId, DomainError> {
        match &kind {
            PropertyKind::Text { .. }
            | PropertyKind::Date
            | PropertyKind::User
            | PropertyKind::CardRelationship => {}
            PropertyKind::Enumerated { numeric, values } => {
                let mut errors = Vec::new();
                for (i, value) in values.iter().enumerate() {
                    if let Err(err) = validate_enumeration_value(*numeric, &value.value) {
                        errors.push(err);
                    }
                    if values[..i]
                        .iter()
                        .any(|v| same_enumeration_value(*numeric, &v.value, &value.value))
                    {
                        errors.push(format!("Value '{}' is listed twice.", value.value));
                    }
                }
                if !errors.is_empty() {
                    return Err(DomainError::Validation(errors));
                }
            }
            other => {
                return Err(DomainError::invalid(format!(
                    "{:?} properties are created through their own definition.",
                    other
                )))
            }
        }
        self.insert_property(name, kind, card_types)
    }

    /// Shared by every property creator: validates the name and card types,
    /// assigns an id and binds a column.
    pub(crate) fn insert_property(
        &mut self,
        name: &str,
        kind: PropertyKind,
        card_types: &[&str],
    ) -> Result<PropertyId, DomainError> {
        self.validate_property_name(name, None)?;
        let mut resolved = Vec::new();
        for card_type in card_types {
            let found = self
                .card_type(card_type)
                .ok_or_else(|| DomainError::not_found("Card type", *card_type))?;
            resolved.push(found.name.clone());
        }

        let id = self.allocate_id();
        let name = name.trim().to_string();
        let column_name = self
            .schema
            .assign(id, &name, ColumnType::for_kind(&kind));
        info!(property = %name, column = %column_name, "Created property definition");
        self.properties.push(PropertyDefinition {
            id,
            name,
            column_name,
            hidden: false,
            card_types: resolved,
            kind,
        });
        Ok(id)
    }

    pub fn associate_property(
        &mut self,
        property_id: PropertyId,
        card_type: &str,
    ) -> Result<(), DomainError> {
        let card_type = self
            .card_type(card_type)
            .ok_or_else(|| DomainError::not_found("Card type", card_type))?
            .name
            .clone();
        let property = self
            .property_mut(property_id)
            .ok_or_else(|| DomainError::not_found("Property", property_id.to_string()))?;
        if !property.applies_to(&card_type) {
            property.card_types.push(card_type);
        }
        Ok(())
    }

    /// Reasons a property cannot stop applying to a card type.
    pub fn disassociation_blockers(&self, property_id: PropertyId, card_type: &str) -> Vec<String> {
        let Some(property) = self.property(property_id) else {
            return vec![format!("Property {} does not exist.", property_id)];
        };
        let mut reasons = Vec::new();
        if let PropertyKind::TreeRelationship { tree_id, .. } = &property.kind {
            let tree = self
                .tree_by_id(*tree_id)
                .map_or("unknown", |t| t.name.as_str());
            reasons.push(format!(
                "{} is a relationship of tree '{}'; remove '{}' from the tree instead.",
                property.name, tree, card_type
            ));
        }

        for aggregate_property in self.aggregate_properties() {
            let Some(aggregate) = aggregate_property.aggregate() else {
                continue;
            };
            let contributes = aggregate
                .scope_card_types(self)
                .iter()
                .any(|t| t.eq_ignore_ascii_case(card_type));
            if aggregate.target_property_id == Some(property_id) && contributes {
                reasons.push(format!(
                    "{} is used as the target of aggregate property {}.",
                    property.name, aggregate_property.name
                ));
            }
            if contributes
                && aggregate
                    .condition_property_names()
                    .iter()
                    .any(|n| property.name_matches(n))
            {
                reasons.push(format!(
                    "{} is used in the condition of aggregate property {}.",
                    property.name, aggregate_property.name
                ));
            }
        }

        for formula_property in self.formula_properties() {
            if !formula_property.applies_to(card_type) {
                continue;
            }
            let uses = formula_property
                .formula()
                .and_then(|f| crate::formula::FormulaExpr::parse(&f.formula).ok())
                .is_some_and(|expr| {
                    expr.property_names()
                        .iter()
                        .any(|n| property.name_matches(n))
                });
            if uses {
                reasons.push(format!(
                    "{} is used as a component property of formula {}.",
                    property.name, formula_property.name
                ));
            }
        }
        reasons
    }

    pub fn disassociate_property(
        &mut self,
        property_id: PropertyId,
        card_type: &str,
    ) -> Result<(), DomainError> {
        let reasons = self.disassociation_blockers(property_id, card_type);
        if !reasons.is_empty() {
            return Err(DomainError::Validation(reasons));
        }
        if let Some(property) = self.property_mut(property_id) {
            property
                .card_types
                .retain(|t| !t.eq_ignore_ascii_case(card_type));
        }
        Ok(())
    }

    /// Delete a property definition, releasing its column binding.
    pub fn delete_property(&mut self, property_id: PropertyId) -> Result<(), DomainError> {
        let property = self
            .property(property_id)
            .ok_or_else(|| DomainError::not_found("Property", property_id.to_string()))?;
        let mut reasons = Vec::new();
        if property.is_predefined() {
            reasons.push(format!("{} is predefined and cannot be deleted.", property.name));
        }
        if property.is_tree_relationship() {
            reasons.push(format!(
                "{} is a tree relationship; delete the tree instead.",
                property.name
            ));
        }
        for card_type in &property.card_types {
            for reason in self.disassociation_blockers(property_id, card_type) {
                if !reasons.contains(&reason) && !property.is_tree_relationship() {
                    reasons.push(reason);
                }
            }
        }
        if !reasons.is_empty() {
            return Err(DomainError::Validation(reasons));
        }

        let name = property.name.clone();
        self.properties.retain(|p| p.id != property_id);
        self.schema.release(property_id);
        for variable in &mut self.variables {
            variable.property_ids.retain(|id| *id != property_id);
        }
        info!(property = %name, "Deleted property definition");
        Ok(())
    }

    pub fn add_enumeration_value(
        &mut self,
        property_id: PropertyId,
        value: &str,
    ) -> Result<(), DomainError> {
        let property = self
            .property_mut(property_id)
            .ok_or_else(|| DomainError::not_found("Property", property_id.to_string()))?;
        let name = property.name.clone();
        let PropertyKind::Enumerated { numeric, values } = &mut property.kind else {
            return Err(DomainError::invalid(format!(
                "{} is not a managed list property.",
                name
            )));
        };
        validate_enumeration_value(*numeric, value).map_err(|e| DomainError::Validation(vec![e]))?;
        if let Some(existing) = values
            .iter()
            .find(|v| same_enumeration_value(*numeric, &v.value, value))
        {
            return Err(DomainError::Validation(vec![format!(
                "Value '{}' already exists for {} as '{}'.",
                value.trim(),
                name,
                existing.value
            )]));
        }
        let position = values.iter().map(|v| v.position).max().unwrap_or(0) + 1;
        values.push(EnumerationValue {
            value: value.trim().to_string(),
            color: None,
            position,
        });
        Ok(())
    }
}

fn validate_enumeration_value(numeric: bool, value: &str) -> Result<(), String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("Value can't be blank.".to_string());
    }
    if numeric && parse_number(trimmed).is_none() {
        return Err(format!("Value '{}' is an invalid numeric value.", trimmed));
    }
    Ok(())
}

/// Build an ordered list of enumeration values from plain strings.
pub fn enumeration_values<S: AsRef<str>>(values: &[S]) -> Vec<EnumerationValue> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| EnumerationValue {
            value: v.as_ref().trim().to_string(),
            color: None,
            position: i as u32 + 1,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> Project {
        let mut project = Project::new("agile", "Agile");
        project.create_card_type("Story").unwrap();
        project.create_card_type("Release").unwrap();
        project
    }

    #[test]
    fn test_same_enumeration_value() {
        assert!(same_enumeration_value(true, "1", "1.00"));
        assert!(!same_enumeration_value(true, "1", "2"));
        assert!(!same_enumeration_value(false, "1", "1.0"));
        assert!(same_enumeration_value(false, "Open", "OPEN"));
    }

    #[test]
    fn test_numeric_values_must_be_finite() {
        let mut project = project();
        let err = project
            .create_property(
                "Points",
                PropertyKind::Enumerated {
                    numeric: true,
                    values: enumeration_values(&["1", "NaN", "inf", "-infinity"]),
                },
                &["Story"],
            )
            .unwrap_err();
        assert_eq!(
            err.messages(),
            vec![
                "Value 'NaN' is an invalid numeric value.",
                "Value 'inf' is an invalid numeric value.",
                "Value '-infinity' is an invalid numeric value.",
            ]
        );
        assert_eq!(parse_number(" 2.5 "), Some(2.5));
        assert_eq!(parse_number("inf"), None);
        assert_eq!(canonical_number("NaN"), None);
        assert!(!same_enumeration_value(true, "NaN", "1"));
    }

    #[test]
    fn test_create_property_binds_column() {
        let mut project = project();
        let id = project
            .create_property("Status", PropertyKind::Text { numeric: false }, &["story"])
            .unwrap();
        let status = project.property(id).unwrap();
        assert_eq!(status.column_name, "cp_status");
        assert_eq!(status.card_types, vec!["Story"]);
        assert_eq!(project.schema.column_for(id).unwrap().name, "cp_status");
    }

    #[test]
    fn test_property_names_are_unique_case_insensitively() {
        let mut project = project();
        project
            .create_property("Status", PropertyKind::Date, &[])
            .unwrap();
        let err = project
            .create_property("STATUS", PropertyKind::Date, &[])
            .unwrap_err();
        assert!(err.to_string().contains("already been taken"));

        let err = project
            .create_property("a=b", PropertyKind::Date, &[])
            .unwrap_err();
        assert!(err.to_string().contains("should not contain"));
    }

    #[test]
    fn test_numeric_enumeration_uniqueness() {
        let mut project = project();
        let id = project
            .create_property(
                "Points",
                PropertyKind::Enumerated {
                    numeric: true,
                    values: enumeration_values(&["1", "2"]),
                },
                &["Story"],
            )
            .unwrap();
        assert!(project.add_enumeration_value(id, "1.0").is_err());
        assert!(project.add_enumeration_value(id, "abc").is_err());
        project.add_enumeration_value(id, "3").unwrap();
        assert_eq!(project.property(id).unwrap().enumeration_position("3.00"), Some(3));

        let err = project
            .create_property(
                "Size",
                PropertyKind::Enumerated {
                    numeric: true,
                    values: enumeration_values(&["1", "1.00"]),
                },
                &[],
            )
            .unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn test_delete_card_type_lists_every_reason() {
        let mut project = Project::new("agile", "Agile");
        project.create_card_type("Story").unwrap();
        let err = project.delete_card_type("Story", 2).unwrap_err();
        assert_eq!(err.messages().len(), 2);

        let mut project = self::project();
        project.delete_card_type("release", 0).unwrap();
        assert!(project.card_type("Release").is_none());
    }

    #[test]
    fn test_calculated_kinds_rejected_by_create_property() {
        let mut project = project();
        let err = project
            .create_property(
                "Parent",
                PropertyKind::TreeRelationship {
                    tree_id: 1,
                    valid_card_type: "Release".to_string(),
                },
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidQuery(_)));
    }
}
