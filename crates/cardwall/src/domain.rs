//! Core domain types for the card wall.
//!
//! A [`Project`] owns its metadata: card types, property definitions, tree
//! configurations, project variables, transitions, saved views and history
//! subscriptions. Cards themselves live in the storage collaborator and are
//! read back as [`Card`] rows.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::aggregate::AggregateDefinition;
use crate::schema::SchemaRegistry;
use crate::tree::TreeConfiguration;

pub type CardId = i64;
pub type PropertyId = u64;
pub type TreeId = u64;

/// URL-style key/value parameters used by saved views and filters.
pub type Params = BTreeMap<String, Vec<String>>;

pub const NUMBER_PROPERTY_ID: PropertyId = 1;
pub const NAME_PROPERTY_ID: PropertyId = 2;
pub const DESCRIPTION_PROPERTY_ID: PropertyId = 3;
pub const TYPE_PROPERTY_ID: PropertyId = 4;

/// Properties every card has regardless of its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predefined {
    Number,
    Name,
    Description,
    Type,
}

impl Predefined {
    pub fn name(&self) -> &'static str {
        match self {
            Predefined::Number => "Number",
            Predefined::Name => "Name",
            Predefined::Description => "Description",
            Predefined::Type => "Type",
        }
    }

    pub fn column_name(&self) -> &'static str {
        match self {
            Predefined::Number => "number",
            Predefined::Name => "name",
            Predefined::Description => "description",
            Predefined::Type => "card_type_name",
        }
    }
}

/// Kind of value a property (or a formula result) produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Text,
    Number,
    Date,
    User,
    Card,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumerationValue {
    pub value: String,
    pub color: Option<String>,
    pub position: u32,
}

/// Stored definition of a formula property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaDefinition {
    pub formula: String,
    pub null_is_zero: bool,
    /// Result type determined when the formula was bound.
    pub output: ValueType,
}

/// Variant-specific part of a property definition.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    Predefined(Predefined),
    /// Free text, or a free number when `numeric`.
    Text { numeric: bool },
    Enumerated {
        numeric: bool,
        values: Vec<EnumerationValue>,
    },
    Date,
    User,
    CardRelationship,
    TreeRelationship {
        tree_id: TreeId,
        /// Card type of the parent cards this relationship points at.
        valid_card_type: String,
    },
    Formula(FormulaDefinition),
    Aggregate(AggregateDefinition),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDefinition {
    pub id: PropertyId,
    pub name: String,
    /// Physical column; never changes once assigned.
    pub column_name: String,
    pub hidden: bool,
    /// Card types this property is associated with. Ignored for predefined
    /// properties, which apply to every type.
    pub card_types: Vec<String>,
    pub kind: PropertyKind,
}

impl PropertyDefinition {
    pub fn is_predefined(&self) -> bool {
        matches!(self.kind, PropertyKind::Predefined(_))
    }

    pub fn predefined(&self) -> Option<Predefined> {
        match self.kind {
            PropertyKind::Predefined(p) => Some(p),
            _ => None,
        }
    }

    pub fn value_type(&self) -> ValueType {
        match &self.kind {
            PropertyKind::Predefined(Predefined::Number) => ValueType::Number,
            PropertyKind::Predefined(_) => ValueType::Text,
            PropertyKind::Text { numeric } | PropertyKind::Enumerated { numeric, .. } => {
                if *numeric {
                    ValueType::Number
                } else {
                    ValueType::Text
                }
            }
            PropertyKind::Date => ValueType::Date,
            PropertyKind::User => ValueType::User,
            PropertyKind::CardRelationship | PropertyKind::TreeRelationship { .. } => {
                ValueType::Card
            }
            PropertyKind::Formula(formula) => formula.output,
            PropertyKind::Aggregate(_) => ValueType::Number,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.value_type() == ValueType::Number
    }

    pub fn is_date(&self) -> bool {
        self.value_type() == ValueType::Date
    }

    /// Compared case-insensitively as text.
    pub fn is_text(&self) -> bool {
        matches!(self.value_type(), ValueType::Text | ValueType::User)
    }

    /// Values come from a known finite set (enumeration, users, cards, types).
    pub fn is_finite_valued(&self) -> bool {
        matches!(
            self.kind,
            PropertyKind::Enumerated { .. }
                | PropertyKind::User
                | PropertyKind::CardRelationship
                | PropertyKind::TreeRelationship { .. }
                | PropertyKind::Predefined(Predefined::Type)
        )
    }

    pub fn is_groupable(&self) -> bool {
        self.is_finite_valued()
    }

    /// Formula or aggregate; values are derived, never written directly.
    pub fn is_calculated(&self) -> bool {
        matches!(
            self.kind,
            PropertyKind::Formula(_) | PropertyKind::Aggregate(_)
        )
    }

    pub fn is_relationship(&self) -> bool {
        self.value_type() == ValueType::Card
    }

    pub fn is_tree_relationship(&self) -> bool {
        matches!(self.kind, PropertyKind::TreeRelationship { .. })
    }

    pub fn is_enumerated(&self) -> bool {
        matches!(self.kind, PropertyKind::Enumerated { .. })
    }

    pub fn enumeration_values(&self) -> &[EnumerationValue] {
        match &self.kind {
            PropertyKind::Enumerated { values, .. } => values,
            _ => &[],
        }
    }

    /// Position of an enumeration value, matched the same way uniqueness is.
    pub fn enumeration_position(&self, value: &str) -> Option<u32> {
        self.enumeration_values()
            .iter()
            .find(|v| crate::properties::same_enumeration_value(self.is_numeric(), &v.value, value))
            .map(|v| v.position)
    }

    pub fn formula(&self) -> Option<&FormulaDefinition> {
        match &self.kind {
            PropertyKind::Formula(formula) => Some(formula),
            _ => None,
        }
    }

    pub fn aggregate(&self) -> Option<&AggregateDefinition> {
        match &self.kind {
            PropertyKind::Aggregate(aggregate) => Some(aggregate),
            _ => None,
        }
    }

    pub fn applies_to(&self, card_type: &str) -> bool {
        self.is_predefined()
            || self
                .card_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(card_type))
    }

    pub fn name_matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardType {
    pub name: String,
    pub position: u32,
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VariableKind {
    Text,
    Number,
    Date,
    User,
    /// Value holds a card number.
    Card { card_type: Option<String> },
}

/// A project-level variable, referenced in MQL as `(name)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectVariable {
    pub name: String,
    pub kind: VariableKind,
    pub value: Option<String>,
    pub property_ids: Vec<PropertyId>,
}

/// Property assignment used as a transition prerequisite or action.
/// Card-valued properties hold a card number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionValue {
    pub property: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub name: String,
    pub card_type: Option<String>,
    pub prerequisites: Vec<TransitionValue>,
    pub actions: Vec<TransitionValue>,
}

/// A saved view: filter, tree filter, column and sort parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FavoriteView {
    pub name: String,
    pub params: Params,
}

/// History notification subscription filtered by property values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySubscription {
    pub user: String,
    pub involved: BTreeMap<String, String>,
    pub acquired: BTreeMap<String, String>,
}

/// A card row as read from storage. `values` is keyed by physical column.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub id: CardId,
    pub number: i64,
    pub name: String,
    pub description: Option<String>,
    pub card_type_name: String,
    pub version: i64,
    pub values: BTreeMap<String, Option<String>>,
}

impl Card {
    /// Current value of a property as text.
    pub fn value_of(&self, property: &PropertyDefinition) -> Option<String> {
        match property.predefined() {
            Some(Predefined::Number) => Some(self.number.to_string()),
            Some(Predefined::Name) => Some(self.name.clone()),
            Some(Predefined::Description) => self.description.clone(),
            Some(Predefined::Type) => Some(self.card_type_name.clone()),
            None => self
                .values
                .get(&property.column_name)
                .cloned()
                .flatten(),
        }
    }

    /// Value of a relationship column as a card id.
    pub fn related_card_id(&self, property: &PropertyDefinition) -> Option<CardId> {
        self.value_of(property).and_then(|v| v.parse().ok())
    }
}

/// Project metadata. Mutations that touch the physical schema are applied
/// to storage separately through `schema::SchemaService`.
#[derive(Debug, Clone)]
pub struct Project {
    pub identifier: String,
    pub name: String,
    /// Accepted in addition to ISO dates when reading date literals.
    pub date_format: String,
    pub card_types: Vec<CardType>,
    pub properties: Vec<PropertyDefinition>,
    pub trees: Vec<TreeConfiguration>,
    pub variables: Vec<ProjectVariable>,
    pub transitions: Vec<Transition>,
    pub views: Vec<FavoriteView>,
    pub subscriptions: Vec<HistorySubscription>,
    pub schema: SchemaRegistry,
    next_id: u64,
}

impl Project {
    pub fn new(identifier: impl Into<String>, name: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let predefined = [
            (NUMBER_PROPERTY_ID, Predefined::Number),
            (NAME_PROPERTY_ID, Predefined::Name),
            (DESCRIPTION_PROPERTY_ID, Predefined::Description),
            (TYPE_PROPERTY_ID, Predefined::Type),
        ]
        .into_iter()
        .map(|(id, p)| PropertyDefinition {
            id,
            name: p.name().to_string(),
            column_name: p.column_name().to_string(),
            hidden: false,
            card_types: Vec::new(),
            kind: PropertyKind::Predefined(p),
        })
        .collect();

        Project {
            schema: SchemaRegistry::new(&identifier),
            identifier,
            name: name.into(),
            date_format: "%d %b %Y".to_string(),
            card_types: Vec::new(),
            properties: predefined,
            trees: Vec::new(),
            variables: Vec::new(),
            transitions: Vec::new(),
            views: Vec::new(),
            subscriptions: Vec::new(),
            next_id: TYPE_PROPERTY_ID + 1,
        }
    }

    pub(crate) fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn find_property(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.name_matches(name))
    }

    pub fn property(&self, id: PropertyId) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.id == id)
    }

    pub(crate) fn property_mut(&mut self, id: PropertyId) -> Option<&mut PropertyDefinition> {
        self.properties.iter_mut().find(|p| p.id == id)
    }

    pub fn predefined_property(&self, predefined: Predefined) -> &PropertyDefinition {
        let id = match predefined {
            Predefined::Number => NUMBER_PROPERTY_ID,
            Predefined::Name => NAME_PROPERTY_ID,
            Predefined::Description => DESCRIPTION_PROPERTY_ID,
            Predefined::Type => TYPE_PROPERTY_ID,
        };
        // predefined definitions are created in `new` and can't be deleted
        &self.properties[(id - 1) as usize]
    }

    pub fn card_type(&self, name: &str) -> Option<&CardType> {
        self.card_types
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn card_type_position(&self, name: &str) -> Option<u32> {
        self.card_type(name).map(|t| t.position)
    }

    /// Non-predefined properties associated with a card type.
    pub fn properties_for_card_type(&self, card_type: &str) -> Vec<&PropertyDefinition> {
        self.properties
            .iter()
            .filter(|p| !p.is_predefined() && p.applies_to(card_type))
            .collect()
    }

    pub fn tree(&self, name: &str) -> Option<&TreeConfiguration> {
        self.trees
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn tree_by_id(&self, id: TreeId) -> Option<&TreeConfiguration> {
        self.trees.iter().find(|t| t.id == id)
    }

    pub fn variable(&self, name: &str) -> Option<&ProjectVariable> {
        self.variables
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn formula_properties(&self) -> impl Iterator<Item = &PropertyDefinition> {
        self.properties.iter().filter(|p| p.formula().is_some())
    }

    pub fn aggregate_properties(&self) -> impl Iterator<Item = &PropertyDefinition> {
        self.properties.iter().filter(|p| p.aggregate().is_some())
    }

    pub fn cards_table(&self) -> String {
        self.schema.cards_table()
    }

    /// Parse a date literal in ISO form or in the project's date format.
    pub fn parse_date(&self, text: &str) -> Option<NaiveDate> {
        let text = text.trim();
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(text, &self.date_format))
            .ok()
    }

    pub fn add_variable(&mut self, variable: ProjectVariable) {
        self.variables.push(variable);
    }

    pub fn add_transition(&mut self, transition: Transition) {
        self.transitions.push(transition);
    }

    pub fn add_view(&mut self, view: FavoriteView) {
        self.views.push(view);
    }

    pub fn add_subscription(&mut self, subscription: HistorySubscription) {
        self.subscriptions.push(subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_project_has_predefined_properties() {
        let project = Project::new("agile", "Agile");
        let number = project.find_property("number").unwrap();
        assert_eq!(number.id, NUMBER_PROPERTY_ID);
        assert!(number.is_numeric());
        assert!(number.applies_to("Anything"));

        let card_type = project.predefined_property(Predefined::Type);
        assert_eq!(card_type.column_name, "card_type_name");
        assert!(card_type.is_finite_valued());
        assert!(card_type.is_text());
    }

    #[test]
    fn test_capabilities_follow_kind() {
        let points = PropertyDefinition {
            id: 10,
            name: "Points".to_string(),
            column_name: "cp_points".to_string(),
            hidden: false,
            card_types: vec!["Story".to_string()],
            kind: PropertyKind::Enumerated {
                numeric: true,
                values: vec![],
            },
        };
        assert!(points.is_numeric());
        assert!(points.is_finite_valued());
        assert!(!points.is_calculated());
        assert!(points.applies_to("story"));
        assert!(!points.applies_to("Release"));

        let due = PropertyDefinition {
            kind: PropertyKind::Date,
            ..points.clone()
        };
        assert!(due.is_date());
        assert!(!due.is_groupable());

        let formula = PropertyDefinition {
            kind: PropertyKind::Formula(FormulaDefinition {
                formula: "Points * 2".to_string(),
                null_is_zero: false,
                output: ValueType::Number,
            }),
            ..points
        };
        assert!(formula.is_calculated());
        assert!(formula.is_numeric());
    }

    #[test]
    fn test_parse_date_accepts_iso_and_project_format() {
        let project = Project::new("agile", "Agile");
        let expected = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(project.parse_date("2024-03-05"), Some(expected));
        assert_eq!(project.parse_date("05 Mar 2024"), Some(expected));
        assert_eq!(project.parse_date("yesterday"), None);
    }

    #[test]
    fn test_card_value_of_reads_predefined_and_columns() {
        let project = Project::new("agile", "Agile");
        let mut values = BTreeMap::new();
        values.insert("cp_status".to_string(), Some("open".to_string()));
        let card = Card {
            id: 7,
            number: 3,
            name: "Login".to_string(),
            description: None,
            card_type_name: "Story".to_string(),
            version: 1,
            values,
        };

        assert_eq!(
            card.value_of(project.predefined_property(Predefined::Number)),
            Some("3".to_string())
        );
        assert_eq!(
            card.value_of(project.predefined_property(Predefined::Description)),
            None
        );
    }
}
