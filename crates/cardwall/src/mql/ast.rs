//! MQL syntax tree and its canonical serialization.
//!
//! `Display` renders a query back to MQL text that parses to an equal tree:
//! names and values are quoted only when needed, and parentheses are added
//! exactly where precedence or left-associativity would otherwise change the
//! shape of the tree.

use std::fmt;

use super::lexer::{is_keyword, Operator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }

    pub fn parse(name: &str) -> Option<AggregateFunction> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggregateFunction::Count),
            "SUM" => Some(AggregateFunction::Sum),
            "AVG" | "AVERAGE" => Some(AggregateFunction::Avg),
            "MIN" | "MINIMUM" => Some(AggregateFunction::Min),
            "MAX" | "MAXIMUM" => Some(AggregateFunction::Max),
            _ => None,
        }
    }

    /// Column alias used for this function applied to a property.
    pub fn alias(&self, property: Option<&str>) -> String {
        let title = match self {
            AggregateFunction::Count => "Count",
            AggregateFunction::Sum => "Sum",
            AggregateFunction::Avg => "Average",
            AggregateFunction::Min => "Minimum",
            AggregateFunction::Max => "Maximum",
        };
        match property {
            Some(property) => format!("{} {}", title, property),
            None => title.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectColumn {
    Property(String),
    Aggregate {
        function: AggregateFunction,
        property: Option<String>,
    },
}

impl SelectColumn {
    pub fn is_aggregate(&self) -> bool {
        matches!(self, SelectColumn::Aggregate { .. })
    }

    pub fn property_name(&self) -> Option<&str> {
        match self {
            SelectColumn::Property(name) => Some(name),
            SelectColumn::Aggregate { property, .. } => property.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub property: String,
    pub direction: Direction,
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Quoted or bare literal; its type is decided when bound to a property.
    Literal(String),
    /// Project variable `(name)`.
    Variable(String),
    /// `THIS CARD` or `THIS CARD.property`.
    ThisCard(Option<String>),
    Today,
    CurrentUser,
    /// `NUMBER n`
    CardNumber(String),
    /// `PROPERTY name`
    Property(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    Compare {
        property: String,
        operator: Operator,
        value: Value,
    },
    IsNull {
        property: String,
        negated: bool,
    },
    In {
        property: String,
        values: Vec<Value>,
        negated: bool,
    },
    InQuery {
        property: String,
        query: Box<ParsedQuery>,
        negated: bool,
    },
    NumbersIn {
        property: String,
        numbers: Vec<String>,
    },
    TaggedWith(String),
    InPlan(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedQuery {
    pub distinct: bool,
    pub columns: Vec<SelectColumn>,
    pub from_trees: Vec<String>,
    pub condition: Option<Condition>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub as_of: Option<String>,
}

impl Condition {
    pub fn compare(property: impl Into<String>, operator: Operator, value: Value) -> Condition {
        Condition::Compare {
            property: property.into(),
            operator,
            value,
        }
    }

    pub fn and(self, other: Condition) -> Condition {
        Condition::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Condition) -> Condition {
        Condition::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Condition {
        Condition::Not(Box::new(self))
    }

    /// Combine conditions with AND, left to right.
    pub fn all(conditions: impl IntoIterator<Item = Condition>) -> Option<Condition> {
        conditions.into_iter().reduce(Condition::and)
    }

    /// Combine conditions with OR, left to right.
    pub fn any(conditions: impl IntoIterator<Item = Condition>) -> Option<Condition> {
        conditions.into_iter().reduce(Condition::or)
    }

    /// Property names referenced anywhere in this condition, sub-queries
    /// included, in first-seen order.
    pub fn property_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_property_names(&mut names);
        names
    }

    fn collect_property_names(&self, names: &mut Vec<String>) {
        fn push(names: &mut Vec<String>, name: &str) {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                names.push(name.to_string());
            }
        }
        match self {
            Condition::And(l, r) | Condition::Or(l, r) => {
                l.collect_property_names(names);
                r.collect_property_names(names);
            }
            Condition::Not(inner) => inner.collect_property_names(names),
            Condition::Compare {
                property, value, ..
            } => {
                push(names, property);
                if let Value::Property(other) = value {
                    push(names, other);
                }
            }
            Condition::IsNull { property, .. } | Condition::NumbersIn { property, .. } => {
                push(names, property)
            }
            Condition::In {
                property, values, ..
            } => {
                push(names, property);
                for value in values {
                    if let Value::Property(other) = value {
                        push(names, other);
                    }
                }
            }
            Condition::InQuery {
                property, query, ..
            } => {
                push(names, property);
                for name in query.property_names() {
                    push(names, &name);
                }
            }
            Condition::TaggedWith(_) | Condition::InPlan(_) => {}
        }
    }

    pub fn uses_this_card(&self) -> bool {
        match self {
            Condition::And(l, r) | Condition::Or(l, r) => l.uses_this_card() || r.uses_this_card(),
            Condition::Not(inner) => inner.uses_this_card(),
            Condition::Compare { value, .. } => matches!(value, Value::ThisCard(_)),
            Condition::In { values, .. } => values.iter().any(|v| matches!(v, Value::ThisCard(_))),
            Condition::InQuery { query, .. } => query
                .condition
                .as_ref()
                .is_some_and(Condition::uses_this_card),
            _ => false,
        }
    }

    pub fn has_tag_or_plan_condition(&self) -> bool {
        match self {
            Condition::And(l, r) | Condition::Or(l, r) => {
                l.has_tag_or_plan_condition() || r.has_tag_or_plan_condition()
            }
            Condition::Not(inner) => inner.has_tag_or_plan_condition(),
            Condition::TaggedWith(_) | Condition::InPlan(_) => true,
            _ => false,
        }
    }

    /// Rename every reference to `old` (case-insensitive). Returns whether
    /// anything changed.
    pub fn rename_property(&mut self, old: &str, new: &str) -> bool {
        fn rename(name: &mut String, old: &str, new: &str) -> bool {
            if name.eq_ignore_ascii_case(old) {
                *name = new.to_string();
                true
            } else {
                false
            }
        }
        fn rename_value(value: &mut Value, old: &str, new: &str) -> bool {
            match value {
                Value::Property(name) | Value::ThisCard(Some(name)) => rename(name, old, new),
                _ => false,
            }
        }

        match self {
            Condition::And(l, r) | Condition::Or(l, r) => {
                let left = l.rename_property(old, new);
                r.rename_property(old, new) | left
            }
            Condition::Not(inner) => inner.rename_property(old, new),
            Condition::Compare {
                property, value, ..
            } => rename(property, old, new) | rename_value(value, old, new),
            Condition::IsNull { property, .. } | Condition::NumbersIn { property, .. } => {
                rename(property, old, new)
            }
            Condition::In {
                property, values, ..
            } => values
                .iter_mut()
                .fold(rename(property, old, new), |changed, v| {
                    rename_value(v, old, new) | changed
                }),
            Condition::InQuery {
                property, query, ..
            } => rename(property, old, new) | query.rename_property(old, new),
            Condition::TaggedWith(_) | Condition::InPlan(_) => false,
        }
    }

    /// Replace literal `old` with `new` wherever it is compared against
    /// `property`. `same` decides value equality (numeric or
    /// case-insensitive).
    pub fn rename_value(
        &mut self,
        property: &str,
        old: &str,
        new: &str,
        same: &dyn Fn(&str, &str) -> bool,
    ) -> bool {
        let replace = |value: &mut Value| match value {
            Value::Literal(text) if same(text, old) => {
                *text = new.to_string();
                true
            }
            _ => false,
        };
        match self {
            Condition::And(l, r) | Condition::Or(l, r) => {
                let left = l.rename_value(property, old, new, same);
                r.rename_value(property, old, new, same) | left
            }
            Condition::Not(inner) => inner.rename_value(property, old, new, same),
            Condition::Compare {
                property: p, value, ..
            } if p.eq_ignore_ascii_case(property) => replace(value),
            Condition::In {
                property: p,
                values,
                ..
            } if p.eq_ignore_ascii_case(property) => values
                .iter_mut()
                .fold(false, |changed, v| replace(v) | changed),
            Condition::InQuery { query, .. } => query
                .condition
                .as_mut()
                .is_some_and(|c| c.rename_value(property, old, new, same)),
            _ => false,
        }
    }
}

impl ParsedQuery {
    pub fn is_aggregate(&self) -> bool {
        self.columns.iter().any(SelectColumn::is_aggregate)
    }

    pub fn property_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                names.push(name.to_string());
            }
        };
        for column in &self.columns {
            if let Some(name) = column.property_name() {
                push(name);
            }
        }
        if let Some(condition) = &self.condition {
            for name in condition.property_names() {
                push(&name);
            }
        }
        for name in &self.group_by {
            push(name);
        }
        for order in &self.order_by {
            push(&order.property);
        }
        names
    }

    pub fn rename_property(&mut self, old: &str, new: &str) -> bool {
        let mut changed = false;
        let mut rename = |name: &mut String| {
            if name.eq_ignore_ascii_case(old) {
                *name = new.to_string();
                changed = true;
            }
        };
        for column in &mut self.columns {
            match column {
                SelectColumn::Property(name)
                | SelectColumn::Aggregate {
                    property: Some(name),
                    ..
                } => rename(name),
                SelectColumn::Aggregate { property: None, .. } => {}
            }
        }
        self.group_by.iter_mut().for_each(&mut rename);
        for order in &mut self.order_by {
            rename(&mut order.property);
        }
        if let Some(condition) = &mut self.condition {
            changed |= condition.rename_property(old, new);
        }
        changed
    }
}

fn is_bare_word(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' || first == '#' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '#')
}

fn is_number_literal(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let mut parts = digits.splitn(2, '.');
    let whole = parts.next().unwrap_or("");
    let fraction = parts.next();
    !whole.is_empty()
        && whole.chars().all(|c| c.is_ascii_digit())
        && fraction.map_or(true, |f| !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()))
}

/// Quote `text` so the lexer reads it back as one quoted token.
pub fn quote(text: &str) -> String {
    let quote = if !text.contains('\'') {
        '\''
    } else if !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for ch in text.chars() {
        if ch == quote || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push(quote);
    out
}

/// Render a property, tree or variable name, quoting only when needed.
pub fn quote_name(name: &str) -> String {
    if is_bare_word(name) && !is_keyword(name) {
        name.to_string()
    } else {
        quote(name)
    }
}

fn format_literal(text: &str) -> String {
    if is_number_literal(text) {
        text.to_string()
    } else {
        quote_name(text)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Literal(text) => write!(f, "{}", format_literal(text)),
            Value::Variable(name) => write!(f, "({})", quote_name(name)),
            Value::ThisCard(None) => write!(f, "THIS CARD"),
            Value::ThisCard(Some(property)) => write!(f, "THIS CARD.{}", quote_name(property)),
            Value::Today => write!(f, "TODAY"),
            Value::CurrentUser => write!(f, "CURRENT USER"),
            Value::CardNumber(number) => write!(f, "NUMBER {}", number),
            Value::Property(name) => write!(f, "PROPERTY {}", quote_name(name)),
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn operand(
            f: &mut fmt::Formatter<'_>,
            condition: &Condition,
            parenthesize: bool,
        ) -> fmt::Result {
            if parenthesize {
                write!(f, "({})", condition)
            } else {
                write!(f, "{}", condition)
            }
        }
        let is_or = |c: &Condition| matches!(c, Condition::Or(..));
        let is_and = |c: &Condition| matches!(c, Condition::And(..));

        match self {
            Condition::And(l, r) => {
                operand(f, l, is_or(l))?;
                write!(f, " AND ")?;
                operand(f, r, is_or(r) || is_and(r))
            }
            Condition::Or(l, r) => {
                operand(f, l, false)?;
                write!(f, " OR ")?;
                operand(f, r, is_or(r))
            }
            Condition::Not(inner) => {
                write!(f, "NOT ")?;
                operand(f, inner, is_or(inner) || is_and(inner))
            }
            Condition::Compare {
                property,
                operator,
                value,
            } => write!(f, "{} {} {}", quote_name(property), operator.as_str(), value),
            Condition::IsNull { property, negated } => write!(
                f,
                "{} IS {}NULL",
                quote_name(property),
                if *negated { "NOT " } else { "" }
            ),
            Condition::In {
                property,
                values,
                negated,
            } => write!(
                f,
                "{} {}IN ({})",
                quote_name(property),
                if *negated { "NOT " } else { "" },
                join(values)
            ),
            Condition::InQuery {
                property,
                query,
                negated,
            } => write!(
                f,
                "{} {}IN ({})",
                quote_name(property),
                if *negated { "NOT " } else { "" },
                query
            ),
            Condition::NumbersIn { property, numbers } => write!(
                f,
                "{} NUMBERS IN ({})",
                quote_name(property),
                numbers.join(", ")
            ),
            Condition::TaggedWith(tag) => write!(f, "TAGGED WITH {}", format_literal(tag)),
            Condition::InPlan(plan) => write!(f, "IN PLAN {}", format_literal(plan)),
        }
    }
}

impl fmt::Display for SelectColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectColumn::Property(name) => write!(f, "{}", quote_name(name)),
            SelectColumn::Aggregate {
                function,
                property: None,
            } => write!(f, "{}(*)", function.as_str()),
            SelectColumn::Aggregate {
                function,
                property: Some(name),
            } => write!(f, "{}({})", function.as_str(), quote_name(name)),
        }
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote_name(&self.property))?;
        if self.direction == Direction::Desc {
            write!(f, " DESC")?;
        }
        Ok(())
    }
}

impl fmt::Display for ParsedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.columns.is_empty() {
            parts.push(format!(
                "SELECT {}{}",
                if self.distinct { "DISTINCT " } else { "" },
                join(&self.columns)
            ));
        }
        if !self.from_trees.is_empty() {
            let trees: Vec<String> = self.from_trees.iter().map(|t| quote_name(t)).collect();
            parts.push(format!("FROM TREE {}", trees.join(", ")));
        }
        if let Some(condition) = &self.condition {
            parts.push(format!("WHERE {}", condition));
        }
        if !self.group_by.is_empty() {
            let names: Vec<String> = self.group_by.iter().map(|n| quote_name(n)).collect();
            parts.push(format!("GROUP BY {}", names.join(", ")));
        }
        if !self.order_by.is_empty() {
            parts.push(format!("ORDER BY {}", join(&self.order_by)));
        }
        if let Some(as_of) = &self.as_of {
            parts.push(format!("AS OF {}", quote(as_of)));
        }
        write!(f, "{}", parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_name_only_when_needed() {
        assert_eq!(quote_name("Status"), "Status");
        assert_eq!(quote_name("Story Points"), "'Story Points'");
        assert_eq!(quote_name("Order"), "'Order'");
        assert_eq!(quote_name("it's"), "\"it's\"");
        assert_eq!(quote_name("a'b\"c"), r#"'a\'b"c'"#);
    }

    #[test]
    fn test_display_parenthesizes_by_precedence() {
        let a = Condition::compare("a", Operator::Eq, Value::Literal("1".to_string()));
        let b = Condition::compare("b", Operator::Eq, Value::Literal("2".to_string()));
        let c = Condition::compare("c", Operator::Eq, Value::Literal("3".to_string()));

        let left_or = a.clone().or(b.clone()).and(c.clone());
        assert_eq!(left_or.to_string(), "(a = 1 OR b = 2) AND c = 3");

        let right_and = a.clone().and(b.clone().and(c.clone()));
        assert_eq!(right_and.to_string(), "a = 1 AND (b = 2 AND c = 3)");

        let negated = a.and(b).negate();
        assert_eq!(negated.to_string(), "NOT (a = 1 AND b = 2)");
    }

    #[test]
    fn test_display_full_query() {
        let query = ParsedQuery {
            distinct: true,
            columns: vec![
                SelectColumn::Property("Release".to_string()),
                SelectColumn::Aggregate {
                    function: AggregateFunction::Sum,
                    property: Some("Story Points".to_string()),
                },
            ],
            from_trees: vec!["Release Tree".to_string()],
            condition: Some(Condition::IsNull {
                property: "Owner".to_string(),
                negated: true,
            }),
            group_by: vec!["Release".to_string()],
            order_by: vec![OrderBy {
                property: "Release".to_string(),
                direction: Direction::Desc,
            }],
            as_of: None,
        };
        assert_eq!(
            query.to_string(),
            "SELECT DISTINCT Release, SUM('Story Points') FROM TREE 'Release Tree' \
             WHERE Owner IS NOT NULL GROUP BY Release ORDER BY Release DESC"
        );
    }

    #[test]
    fn test_rename_property_everywhere() {
        let mut condition = Condition::compare(
            "Points",
            Operator::Gt,
            Value::Property("points".to_string()),
        )
        .and(Condition::IsNull {
            property: "Status".to_string(),
            negated: false,
        });
        assert!(condition.rename_property("POINTS", "Story Points"));
        assert_eq!(
            condition.to_string(),
            "'Story Points' > PROPERTY 'Story Points' AND Status IS NULL"
        );
        assert!(!condition.rename_property("Missing", "Other"));
    }

    #[test]
    fn test_rename_value_only_for_matching_property() {
        let mut condition = Condition::compare("Status", Operator::Eq, Value::Literal("Open".to_string()))
            .or(Condition::compare("Priority", Operator::Eq, Value::Literal("open".to_string())));
        let same = |a: &str, b: &str| a.eq_ignore_ascii_case(b);
        assert!(condition.rename_value("status", "OPEN", "New", &same));
        assert_eq!(condition.to_string(), "Status = New OR Priority = open");
    }

    #[test]
    fn test_property_names_deduplicated() {
        let condition = Condition::compare("Status", Operator::Eq, Value::Literal("x".to_string()))
            .and(Condition::In {
                property: "status".to_string(),
                values: vec![Value::Property("Owner".to_string())],
                negated: false,
            });
        assert_eq!(condition.property_names(), vec!["Status", "Owner"]);
    }
}
