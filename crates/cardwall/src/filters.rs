//! View filters.
//!
//! A saved view keeps its filters as URL-style parameters of the form
//! `[Property][operator][value]`, e.g. `[Status][is][open]`. Filters on the
//! same property with `is` are alternatives; everything else must hold
//! together. Special values are written in parentheses: `(not set)`,
//! `(current user)`, `(today)` and `(Variable Name)`.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

use crate::domain::{Params, Predefined, Project, PropertyDefinition, PropertyKind};
use crate::errors::DomainError;
use crate::mql::{Condition, Operator, Value};
use crate::properties::parse_number;

pub const FILTERS_PARAM: &str = "filters";

/// `[Property][operator][value]`; the value may be empty.
static FILTER_REGEX: OnceLock<Regex> = OnceLock::new();

fn filter_regex() -> &'static Regex {
    FILTER_REGEX.get_or_init(|| {
        Regex::new(r"^\[(?P<property>[^\]]*[^\]\s][^\]]*)\]\[(?P<operator>[^\]]+)\]\[(?P<value>.*)\]$")
            .expect("Filter regex should compile")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FilterOperator {
    Is,
    IsNot,
    IsLessThan,
    IsGreaterThan,
    IsBefore,
    IsAfter,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Is => "is",
            FilterOperator::IsNot => "is not",
            FilterOperator::IsLessThan => "is less than",
            FilterOperator::IsGreaterThan => "is greater than",
            FilterOperator::IsBefore => "is before",
            FilterOperator::IsAfter => "is after",
        }
    }

    pub fn parse(text: &str) -> Option<FilterOperator> {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        [
            FilterOperator::Is,
            FilterOperator::IsNot,
            FilterOperator::IsLessThan,
            FilterOperator::IsGreaterThan,
            FilterOperator::IsBefore,
            FilterOperator::IsAfter,
        ]
        .into_iter()
        .find(|op| op.as_str().eq_ignore_ascii_case(&normalized))
    }

    fn to_mql(self) -> Operator {
        match self {
            FilterOperator::Is => Operator::Eq,
            FilterOperator::IsNot => Operator::Ne,
            FilterOperator::IsLessThan | FilterOperator::IsBefore => Operator::Lt,
            FilterOperator::IsGreaterThan | FilterOperator::IsAfter => Operator::Gt,
        }
    }

    fn is_date_ordering(&self) -> bool {
        matches!(self, FilterOperator::IsBefore | FilterOperator::IsAfter)
    }

    fn is_numeric_ordering(&self) -> bool {
        matches!(self, FilterOperator::IsLessThan | FilterOperator::IsGreaterThan)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FilterValue {
    NotSet,
    CurrentUser,
    Today,
    Variable(String),
    Literal(String),
}

impl FilterValue {
    pub fn parse(text: &str) -> FilterValue {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("(not set)") {
            return FilterValue::NotSet;
        }
        if trimmed.eq_ignore_ascii_case("(current user)") {
            return FilterValue::CurrentUser;
        }
        if trimmed.eq_ignore_ascii_case("(today)") {
            return FilterValue::Today;
        }
        match trimmed.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
            Some(name) => FilterValue::Variable(name.trim().to_string()),
            None => FilterValue::Literal(trimmed.to_string()),
        }
    }
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::NotSet => write!(f, "(not set)"),
            FilterValue::CurrentUser => write!(f, "(current user)"),
            FilterValue::Today => write!(f, "(today)"),
            FilterValue::Variable(name) => write!(f, "({})", name),
            FilterValue::Literal(text) => write!(f, "{}", text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Filter {
    pub property: String,
    pub operator: FilterOperator,
    pub value: FilterValue,
}

impl Filter {
    pub fn new(property: impl Into<String>, operator: FilterOperator, value: FilterValue) -> Self {
        Filter {
            property: property.into(),
            operator,
            value,
        }
    }

    /// Parse `[Property][operator][value]`.
    pub fn parse(param: &str) -> Result<Filter, DomainError> {
        let captures = filter_regex().captures(param.trim()).ok_or_else(|| {
            DomainError::invalid(format!(
                "Filter '{}' is malformed. Use [Property][operator][value].",
                param
            ))
        })?;
        let operator = &captures["operator"];
        let operator = FilterOperator::parse(operator).ok_or_else(|| {
            DomainError::invalid(format!(
                "Filter '{}' uses unknown operator '{}'.",
                param,
                operator.trim()
            ))
        })?;
        Ok(Filter::new(
            captures["property"].trim(),
            operator,
            FilterValue::parse(&captures["value"]),
        ))
    }

    pub fn to_param(&self) -> String {
        let value = match &self.value {
            FilterValue::NotSet => String::new(),
            other => other.to_string(),
        };
        format!("[{}][{}][{}]", self.property, self.operator.as_str(), value)
    }

    fn validation_errors(&self, project: &Project) -> Vec<String> {
        let Some(property) = project.find_property(&self.property) else {
            return vec![format!("Property {} does not exist.", self.property)];
        };
        let mut errors = Vec::new();
        let orderable = property.is_numeric()
            || property.is_enumerated()
            || property.predefined() == Some(Predefined::Number);
        if (self.operator.is_numeric_ordering() && !orderable)
            || (self.operator.is_date_ordering() && !property.is_date())
        {
            errors.push(format!(
                "Property {} cannot be used with operator '{}'.",
                property.name,
                self.operator.as_str()
            ));
        }
        match &self.value {
            FilterValue::NotSet if self.operator.is_numeric_ordering() || self.operator.is_date_ordering() => {
                errors.push(format!(
                    "(not set) cannot be used with operator '{}'.",
                    self.operator.as_str()
                ));
            }
            FilterValue::NotSet => {}
            FilterValue::Today if !property.is_date() => {
                errors.push(format!(
                    "(today) cannot be used with {} because it is not a date property.",
                    property.name
                ));
            }
            FilterValue::CurrentUser if !matches!(property.kind, PropertyKind::User) => {
                errors.push(format!(
                    "(current user) cannot be used with {} because it is not a user property.",
                    property.name
                ));
            }
            FilterValue::Today | FilterValue::CurrentUser => {}
            FilterValue::Variable(name) => match project.variable(name) {
                None => errors.push(format!("Project variable ({}) does not exist.", name)),
                Some(variable) if !variable.property_ids.contains(&property.id) => {
                    errors.push(format!(
                        "Project variable ({}) is not valid for property {}.",
                        variable.name, property.name
                    ))
                }
                Some(_) => {}
            },
            FilterValue::Literal(text) => {
                if let Some(error) = literal_error(project, property, text) {
                    errors.push(error);
                }
            }
        }
        errors
    }

    fn condition(&self, project: &Project) -> Condition {
        let property = self.property.clone();
        let value = match &self.value {
            FilterValue::NotSet => {
                return Condition::IsNull {
                    property,
                    negated: self.operator == FilterOperator::IsNot,
                }
            }
            FilterValue::CurrentUser => Value::CurrentUser,
            FilterValue::Today => Value::Today,
            FilterValue::Variable(name) => Value::Variable(name.clone()),
            FilterValue::Literal(text) => {
                let relationship = project
                    .find_property(&self.property)
                    .is_some_and(|p| p.is_relationship());
                if relationship {
                    Value::CardNumber(text.trim_start_matches('#').to_string())
                } else {
                    Value::Literal(text.clone())
                }
            }
        };
        Condition::compare(property, self.operator.to_mql(), value)
    }
}

fn literal_error(project: &Project, property: &PropertyDefinition, text: &str) -> Option<String> {
    match &property.kind {
        PropertyKind::Predefined(Predefined::Type) if project.card_type(text).is_none() => {
            Some(format!("Card type {} does not exist.", text))
        }
        PropertyKind::Predefined(Predefined::Number) if text.trim_start_matches('#').parse::<i64>().is_err() => {
            Some(format!("{} is not a card number.", text))
        }
        PropertyKind::Enumerated { numeric: false, .. }
            if property.enumeration_position(text).is_none() =>
        {
            Some(format!("{} is not a valid value for {}.", text, property.name))
        }
        PropertyKind::Date if project.parse_date(text).is_none() => {
            Some(format!("{} is an invalid date for {}.", text, property.name))
        }
        PropertyKind::CardRelationship | PropertyKind::TreeRelationship { .. }
            if text.trim_start_matches('#').parse::<i64>().is_err() =>
        {
            Some(format!("{} is not a card number for {}.", text, property.name))
        }
        _ if property.is_numeric() && parse_number(text).is_none() => Some(format!(
            "{} is an invalid numeric value for {}.",
            text, property.name
        )),
        _ => None,
    }
}

/// An ordered list of view filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Filters {
    filters: Vec<Filter>,
}

impl Filters {
    pub fn new(filters: Vec<Filter>) -> Self {
        Filters { filters }
    }

    /// Parse every filter param, reporting all malformed ones.
    pub fn parse<S: AsRef<str>>(params: &[S]) -> Result<Filters, DomainError> {
        let mut filters = Vec::new();
        let mut errors = Vec::new();
        for param in params {
            match Filter::parse(param.as_ref()) {
                Ok(filter) => filters.push(filter),
                Err(err) => errors.push(err.to_string()),
            }
        }
        if errors.is_empty() {
            Ok(Filters { filters })
        } else {
            Err(DomainError::Validation(errors))
        }
    }

    pub fn from_params(params: &Params) -> Result<Filters, DomainError> {
        match params.get(FILTERS_PARAM) {
            Some(values) => Filters::parse(values),
            None => Ok(Filters::default()),
        }
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.filters.iter().map(Filter::to_param).collect()
    }

    pub fn to_params(&self) -> Params {
        let mut params = Params::new();
        if !self.filters.is_empty() {
            params.insert(FILTERS_PARAM.to_string(), self.to_strings());
        }
        params
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Filter> {
        self.filters.iter()
    }

    pub fn validation_errors(&self, project: &Project) -> Vec<String> {
        let mut errors = Vec::new();
        for filter in &self.filters {
            for error in filter.validation_errors(project) {
                if !errors.contains(&error) {
                    errors.push(error);
                }
            }
        }
        errors
    }

    /// Filters grouped by property and operator, in first-seen order.
    fn groups(&self) -> Vec<Vec<&Filter>> {
        let mut groups: Vec<Vec<&Filter>> = Vec::new();
        for filter in &self.filters {
            match groups.iter_mut().find(|g| {
                g[0].property.eq_ignore_ascii_case(&filter.property) && g[0].operator == filter.operator
            }) {
                Some(group) => group.push(filter),
                None => groups.push(vec![filter]),
            }
        }
        groups
    }

    /// Human-readable summary, e.g. `Type is Story or Bug, Status is not closed`.
    pub fn description(&self) -> String {
        if self.filters.is_empty() {
            return "All cards".to_string();
        }
        self.groups()
            .iter()
            .map(|group| {
                let joiner = if group[0].operator == FilterOperator::Is {
                    " or "
                } else {
                    " and "
                };
                let values = group
                    .iter()
                    .map(|f| f.value.to_string())
                    .collect::<Vec<_>>()
                    .join(joiner);
                format!("{} {} {}", group[0].property, group[0].operator.as_str(), values)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// MQL condition equivalent to these filters; `None` when empty.
    pub fn to_condition(&self, project: &Project) -> Result<Option<Condition>, DomainError> {
        let errors = self.validation_errors(project);
        if !errors.is_empty() {
            return Err(DomainError::Validation(errors));
        }
        let groups = self.groups().into_iter().filter_map(|group| {
            let conditions = group.iter().map(|f| f.condition(project));
            if group[0].operator == FilterOperator::Is {
                Condition::any(conditions)
            } else {
                Condition::all(conditions)
            }
        });
        Ok(Condition::all(groups))
    }

    pub fn rename_property(&mut self, old: &str, new: &str) -> bool {
        let mut changed = false;
        for filter in &mut self.filters {
            if filter.property.eq_ignore_ascii_case(old) {
                filter.property = new.to_string();
                changed = true;
            }
        }
        changed
    }

    pub fn rename_value(
        &mut self,
        property: &str,
        old: &str,
        new: &str,
        same: &dyn Fn(&str, &str) -> bool,
    ) -> bool {
        let mut changed = false;
        for filter in &mut self.filters {
            if !filter.property.eq_ignore_ascii_case(property) {
                continue;
            }
            if let FilterValue::Literal(text) = &mut filter.value {
                if same(text, old) {
                    *text = new.to_string();
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Keys of `params` holding filter lists: view filters and tree filters.
fn filter_keys(params: &Params) -> Vec<String> {
    params
        .keys()
        .filter(|k| *k == FILTERS_PARAM || k.starts_with(crate::tree::filters::TREE_FILTER_PREFIX))
        .cloned()
        .collect()
}

/// Rewrite every filter on `old` to use `new`. Unparseable entries are kept
/// as they are.
pub fn rename_property_in_params(params: &mut Params, old: &str, new: &str) -> bool {
    let mut changed = false;
    for key in filter_keys(params) {
        let Some(values) = params.get_mut(&key) else {
            continue;
        };
        for value in values.iter_mut() {
            if let Ok(mut filter) = Filter::parse(value) {
                if filter.property.eq_ignore_ascii_case(old) {
                    filter.property = new.to_string();
                    *value = filter.to_param();
                    changed = true;
                }
            }
        }
    }
    changed
}

/// Rewrite literal filter values `old` on `property` to `new`.
pub fn rename_value_in_params(
    params: &mut Params,
    property: &str,
    old: &str,
    new: &str,
    same: &dyn Fn(&str, &str) -> bool,
) -> bool {
    let mut changed = false;
    for key in filter_keys(params) {
        let Some(values) = params.get_mut(&key) else {
            continue;
        };
        for value in values.iter_mut() {
            let Ok(filter) = Filter::parse(value) else {
                continue;
            };
            let mut filters = Filters::new(vec![filter]);
            if filters.rename_value(property, old, new, same) {
                *value = filters.filters[0].to_param();
                changed = true;
            }
        }
    }
    changed
}
