//! Formula properties.
//!
//! A formula is arithmetic over other numeric or date properties of the same
//! card. It is parsed into a [`FormulaExpr`], type-checked against the
//! project, and compiled to a SQL expression evaluated set-wise by the
//! recomputation engine.
//!
//! Typing rules:
//!
//! | expression      | result |
//! |-----------------|--------|
//! | number ± number | number |
//! | date ± number   | date   |
//! | number + date   | date   |
//! | date - date     | number (days) |
//! | number - date, date + date, `*` or `/` with a date | invalid |

use std::fmt;
use tracing::info;

use crate::domain::{
    FormulaDefinition, Project, PropertyDefinition, PropertyId, PropertyKind, ValueType,
};
use crate::errors::DomainError;
use crate::graph::check_circular_reference;
use crate::schema::ColumnType;

mod parser;

use parser::FormulaParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormulaOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl FormulaOp {
    fn symbol(&self) -> char {
        match self {
            FormulaOp::Add => '+',
            FormulaOp::Subtract => '-',
            FormulaOp::Multiply => '*',
            FormulaOp::Divide => '/',
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            FormulaOp::Add | FormulaOp::Subtract => 1,
            FormulaOp::Multiply | FormulaOp::Divide => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormulaExpr {
    /// Literal as written.
    Number(String),
    Property(String),
    Negate(Box<FormulaExpr>),
    Binary {
        op: FormulaOp,
        left: Box<FormulaExpr>,
        right: Box<FormulaExpr>,
    },
}

impl FormulaExpr {
    pub fn parse(input: &str) -> Result<FormulaExpr, DomainError> {
        FormulaParser::parse(input)
    }

    pub fn binary(op: FormulaOp, left: FormulaExpr, right: FormulaExpr) -> FormulaExpr {
        FormulaExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            FormulaExpr::Binary { op, .. } => op.precedence(),
            _ => 3,
        }
    }

    /// Referenced property names in first-seen order, without duplicates.
    pub fn property_names(&self) -> Vec<String> {
        fn collect(expr: &FormulaExpr, names: &mut Vec<String>) {
            match expr {
                FormulaExpr::Number(_) => {}
                FormulaExpr::Property(name) => {
                    if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                        names.push(name.clone());
                    }
                }
                FormulaExpr::Negate(inner) => collect(inner, names),
                FormulaExpr::Binary { left, right, .. } => {
                    collect(left, names);
                    collect(right, names);
                }
            }
        }
        let mut names = Vec::new();
        collect(self, &mut names);
        names
    }

    pub fn rename_property(&mut self, old: &str, new: &str) -> bool {
        match self {
            FormulaExpr::Number(_) => false,
            FormulaExpr::Property(name) => {
                if name.eq_ignore_ascii_case(old) {
                    *name = new.to_string();
                    true
                } else {
                    false
                }
            }
            FormulaExpr::Negate(inner) => inner.rename_property(old, new),
            FormulaExpr::Binary { left, right, .. } => {
                let changed = left.rename_property(old, new);
                right.rename_property(old, new) | changed
            }
        }
    }

    /// Result type of the expression, or a message explaining why the
    /// operands cannot be combined.
    pub fn output_type(&self, project: &Project) -> Result<ValueType, DomainError> {
        match self {
            FormulaExpr::Number(_) => Ok(ValueType::Number),
            FormulaExpr::Property(name) => operand_property(project, name).map(|p| p.value_type()),
            FormulaExpr::Negate(inner) => match inner.output_type(project)? {
                ValueType::Number => Ok(ValueType::Number),
                _ => Err(DomainError::invalid(format!(
                    "The expression {} is invalid because a date cannot be negated.",
                    self
                ))),
            },
            FormulaExpr::Binary { op, left, right } => {
                let l = left.output_type(project)?;
                let r = right.output_type(project)?;
                use ValueType::{Date, Number};
                match (op, l, r) {
                    (_, Number, Number) => Ok(Number),
                    (FormulaOp::Add, Date, Number) | (FormulaOp::Add, Number, Date) => Ok(Date),
                    (FormulaOp::Subtract, Date, Number) => Ok(Date),
                    (FormulaOp::Subtract, Date, Date) => Ok(Number),
                    (FormulaOp::Subtract, Number, Date) => Err(DomainError::invalid(format!(
                        "The expression {} is invalid because a date cannot be subtracted from a number.",
                        self
                    ))),
                    (FormulaOp::Add, Date, Date) => Err(DomainError::invalid(format!(
                        "The expression {} is invalid because dates cannot be added together.",
                        self
                    ))),
                    _ => Err(DomainError::invalid(format!(
                        "The expression {} is invalid because dates cannot be multiplied or divided.",
                        self
                    ))),
                }
            }
        }
    }

    /// SQL expression computing the formula for rows of `table`. Numbers are
    /// rounded to two decimals and dates rendered as ISO text.
    pub fn to_sql(
        &self,
        project: &Project,
        table: &str,
        null_is_zero: bool,
    ) -> Result<String, DomainError> {
        let (sql, value_type) = self.compile(project, table, null_is_zero)?;
        Ok(match value_type {
            ValueType::Date => format!("date({})", sql),
            _ => format!("ROUND({}, 2)", sql),
        })
    }

    /// Compiled operand: numbers as numbers, dates as julian day numbers.
    fn compile(
        &self,
        project: &Project,
        table: &str,
        null_is_zero: bool,
    ) -> Result<(String, ValueType), DomainError> {
        match self {
            FormulaExpr::Number(n) => Ok((n.clone(), ValueType::Number)),
            FormulaExpr::Property(name) => {
                let property = operand_property(project, name)?;
                let column = format!(r#""{}"."{}""#, table, property.column_name);
                Ok(match property.value_type() {
                    ValueType::Date => (format!("julianday({})", column), ValueType::Date),
                    _ if null_is_zero => (format!("COALESCE({}, 0)", column), ValueType::Number),
                    _ => (column, ValueType::Number),
                })
            }
            FormulaExpr::Negate(inner) => {
                let (sql, value_type) = inner.compile(project, table, null_is_zero)?;
                Ok((format!("(-{})", sql), value_type))
            }
            FormulaExpr::Binary { op, left, right } => {
                let result_type = self.output_type(project)?;
                let (l, _) = left.compile(project, table, null_is_zero)?;
                let (r, _) = right.compile(project, table, null_is_zero)?;
                let sql = match op {
                    FormulaOp::Divide => format!("(CAST({} AS REAL) / {})", l, r),
                    _ => format!("({} {} {})", l, op.symbol(), r),
                };
                Ok((sql, result_type))
            }
        }
    }
}

fn operand_property<'p>(
    project: &'p Project,
    name: &str,
) -> Result<&'p PropertyDefinition, DomainError> {
    let property = project
        .find_property(name)
        .ok_or_else(|| DomainError::invalid(format!("Property {} does not exist.", name)))?;
    match property.value_type() {
        ValueType::Number | ValueType::Date => Ok(property),
        _ => Err(DomainError::invalid(format!(
            "Property {} is not numeric or date and cannot be used in a formula.",
            property.name
        ))),
    }
}

impl fmt::Display for FormulaExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormulaExpr::Number(n) => write!(f, "{}", n),
            FormulaExpr::Property(name) => {
                let bare = name.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
                    && name.chars().all(|c| c.is_alphanumeric() || c == '_');
                if bare {
                    write!(f, "{}", name)
                } else if name.contains('\'') {
                    write!(f, "\"{}\"", name)
                } else {
                    write!(f, "'{}'", name)
                }
            }
            FormulaExpr::Negate(inner) => {
                if matches!(**inner, FormulaExpr::Binary { .. }) {
                    write!(f, "-({})", inner)
                } else {
                    write!(f, "-{}", inner)
                }
            }
            FormulaExpr::Binary { op, left, right } => {
                if left.precedence() < op.precedence() {
                    write!(f, "({})", left)?;
                } else {
                    write!(f, "{}", left)?;
                }
                write!(f, " {} ", op.symbol())?;
                if right.precedence() <= op.precedence() {
                    write!(f, "({})", right)
                } else {
                    write!(f, "{}", right)
                }
            }
        }
    }
}

impl Project {
    /// Parse and check a formula for a property available to `card_types`.
    fn bind_formula(
        &self,
        property_id: Option<PropertyId>,
        name: &str,
        formula: &str,
        card_types: &[String],
    ) -> Result<(FormulaExpr, ValueType), DomainError> {
        let expr = FormulaExpr::parse(formula)?;
        let mut errors = Vec::new();
        let mut dependencies = Vec::new();
        for used in expr.property_names() {
            let Some(property) = self.find_property(&used) else {
                errors.push(format!("Property {} does not exist.", used));
                continue;
            };
            if Some(property.id) == property_id {
                errors.push(format!("{} cannot use itself in its formula.", name));
                continue;
            }
            if property.is_predefined() {
                errors.push(format!(
                    "Property {} is predefined and cannot be used in a formula.",
                    property.name
                ));
                continue;
            }
            for card_type in card_types {
                if !property.applies_to(card_type) {
                    errors.push(format!(
                        "Component property {} is not available to card type {}.",
                        property.name, card_type
                    ));
                }
            }
            dependencies.push(property.id);
        }
        if !errors.is_empty() {
            return Err(DomainError::Validation(errors));
        }
        let output = expr.output_type(self)?;
        if let Some(id) = property_id {
            check_circular_reference(self, id, name, &dependencies)?;
        }
        Ok((expr, output))
    }

    pub fn create_formula(
        &mut self,
        name: &str,
        formula: &str,
        null_is_zero: bool,
        card_types: &[&str],
    ) -> Result<PropertyId, DomainError> {
        let types: Vec<String> = card_types.iter().map(|t| t.to_string()).collect();
        let (expr, output) = self.bind_formula(None, name, formula, &types)?;
        let kind = PropertyKind::Formula(FormulaDefinition {
            formula: expr.to_string(),
            null_is_zero,
            output,
        });
        self.insert_property(name, kind, card_types)
    }

    /// Change a formula's text or null handling. Returns the previous
    /// definition so the engine can find the cards whose value differs.
    pub fn update_formula(
        &mut self,
        property_id: PropertyId,
        formula: &str,
        null_is_zero: bool,
    ) -> Result<FormulaDefinition, DomainError> {
        let property = self
            .property(property_id)
            .ok_or_else(|| DomainError::not_found("Property", property_id.to_string()))?;
        let previous = property
            .formula()
            .cloned()
            .ok_or_else(|| DomainError::invalid(format!("{} is not a formula property.", property.name)))?;
        let name = property.name.clone();
        let card_types = property.card_types.clone();

        let (expr, output) = self.bind_formula(Some(property_id), &name, formula, &card_types)?;
        let previous_column = ColumnType::for_kind(&PropertyKind::Formula(previous.clone()));
        let next_column = ColumnType::for_kind(&PropertyKind::Formula(FormulaDefinition {
            formula: String::new(),
            null_is_zero,
            output,
        }));
        if previous_column != next_column {
            return Err(DomainError::Validation(vec![format!(
                "{} cannot change its result between a number and a date.",
                name
            )]));
        }

        if let Some(property) = self.property_mut(property_id) {
            property.kind = PropertyKind::Formula(FormulaDefinition {
                formula: expr.to_string(),
                null_is_zero,
                output,
            });
        }
        info!(property = %name, formula = %expr, null_is_zero, "Updated formula");
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::enumeration_values;

    fn project() -> Project {
        let mut project = Project::new("agile", "Agile");
        project.create_card_type("Story").unwrap();
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
        project
            .create_property("Start", PropertyKind::Date, &["Story"])
            .unwrap();
        project
            .create_property("End", PropertyKind::Date, &["Story"])
            .unwrap();
        project
            .create_property("Status", PropertyKind::Text { numeric: false }, &["Story"])
            .unwrap();
        project
    }

    #[test]
    fn test_display_uses_minimal_parentheses() {
        for (input, expected) in [
            ("(a + b) * c", "(a + b) * c"),
            ("a + (b * c)", "a + b * c"),
            ("a - (b - c)", "a - (b - c)"),
            ("(a - b) - c", "a - b - c"),
            ("-(a + 1)", "-(a + 1)"),
            ("'Story Points' / 2", "'Story Points' / 2"),
        ] {
            let expr = FormulaExpr::parse(input).unwrap();
            assert_eq!(expr.to_string(), expected);
            assert_eq!(FormulaExpr::parse(&expr.to_string()).unwrap(), expr);
        }
    }

    #[test]
    fn test_output_types() {
        let project = project();
        let cases = [
            ("Points * 2", Some(ValueType::Number)),
            ("End - Start", Some(ValueType::Number)),
            ("Start + 3", Some(ValueType::Date)),
            ("3 + Start", Some(ValueType::Date)),
            ("3 - Start", None),
            ("Start + End", None),
            ("Start * 2", None),
            ("Status + 1", None),
        ];
        for (formula, expected) in cases {
            let result = FormulaExpr::parse(formula).unwrap().output_type(&project);
            assert_eq!(result.ok(), expected, "{}", formula);
        }
    }

    #[test]
    fn test_sql_for_numbers_and_dates() {
        let project = project();
        let sql = FormulaExpr::parse("Points / 2")
            .unwrap()
            .to_sql(&project, "agile_cards", true)
            .unwrap();
        assert_eq!(
            sql,
            r#"ROUND((CAST(COALESCE("agile_cards"."cp_points", 0) AS REAL) / 2), 2)"#
        );

        let sql = FormulaExpr::parse("Start + 1")
            .unwrap()
            .to_sql(&project, "agile_cards", false)
            .unwrap();
        assert_eq!(sql, r#"date((julianday("agile_cards"."cp_start") + 1))"#);
    }

    #[test]
    fn test_create_formula_validates_components() {
        let mut project = project();
        let id = project
            .create_formula("Double", "points*2", false, &["Story"])
            .unwrap();
        let formula = project.property(id).unwrap().formula().unwrap();
        assert_eq!(formula.formula, "points * 2");
        assert_eq!(formula.output, ValueType::Number);

        let err = project
            .create_formula("Broken", "Missing + 1", false, &["Story"])
            .unwrap_err();
        assert!(err.to_string().contains("Missing does not exist"));

        project.create_card_type("Defect").unwrap();
        let err = project
            .create_formula("Elsewhere", "Points + 1", false, &["Defect"])
            .unwrap_err();
        assert!(err.to_string().contains("not available to card type Defect"));
    }

    #[test]
    fn test_update_formula_rejects_cycles() {
        let mut project = project();
        let double = project
            .create_formula("Double", "Points * 2", false, &["Story"])
            .unwrap();
        project
            .create_formula("Quad", "Double * 2", false, &["Story"])
            .unwrap();

        let err = project.update_formula(double, "Quad + 1", false).unwrap_err();
        assert!(err.to_string().contains("circular reference"));
        assert!(err.to_string().contains("Double uses Quad uses Double"));

        let previous = project.update_formula(double, "Points * 3", true).unwrap();
        assert_eq!(previous.formula, "Points * 2");
        assert!(project.property(double).unwrap().formula().unwrap().null_is_zero);
    }
}
