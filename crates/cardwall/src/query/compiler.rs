//! Condition and column compilation to sea-query expressions.
//!
//! Every reference goes through the table name (or alias) the compiler was
//! created for. Sub-queries read the current cards table under its own
//! name, which shadows the outer reference inside the sub-query.

use sea_query::{
    Alias, Asterisk, Cond, Expr, ExprTrait, Func, Order, Query, SelectStatement, SimpleExpr,
};

use super::CardQuery;
use crate::context::{EvaluationContext, ThisCard};
use crate::domain::{CardId, Predefined, PropertyDefinition, ValueType, VariableKind};
use crate::errors::DomainError;
use crate::mql::{AggregateFunction, Condition, Direction, Operator, SelectColumn, Value};

/// Right-hand side of a comparison after variables, `THIS CARD`, `TODAY`
/// and `CURRENT USER` have been resolved.
#[derive(Debug, Clone)]
enum Operand<'a> {
    Text(String),
    CardNumber(String),
    CardId(CardId),
    Column(&'a PropertyDefinition),
    Null,
}

/// A join required by a selected, grouped or ordered relationship column.
#[derive(Debug, Clone)]
pub(crate) struct JoinPlan {
    pub alias: String,
    pub on: SimpleExpr,
}

pub(crate) struct SqlCompiler<'c, 'a> {
    ctx: &'c EvaluationContext<'a>,
    table: String,
    id_column: &'static str,
}

/// Quote a text value as a SQL string literal.
pub(crate) fn sql_text(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn never() -> SimpleExpr {
    Expr::cust("1 = 0")
}

fn always() -> SimpleExpr {
    Expr::cust("1 = 1")
}

fn compare_exprs(left: SimpleExpr, op: Operator, right: SimpleExpr) -> SimpleExpr {
    let left = Expr::expr(left);
    match op {
        Operator::Eq => left.eq(right),
        Operator::Ne => left.ne(right),
        Operator::Lt => left.lt(right),
        Operator::Le => left.lte(right),
        Operator::Gt => left.gt(right),
        Operator::Ge => left.gte(right),
    }
}

fn negate(expr: SimpleExpr) -> SimpleExpr {
    Cond::all().add(expr).not().into()
}

fn lower(expr: SimpleExpr) -> SimpleExpr {
    Func::lower(expr).into()
}

fn parse_card_number(text: &str) -> Option<i64> {
    text.trim().trim_start_matches('#').parse().ok()
}

impl<'c, 'a> SqlCompiler<'c, 'a> {
    pub(crate) fn new(ctx: &'c EvaluationContext<'a>, table: &str, historical: bool) -> Self {
        SqlCompiler {
            ctx,
            table: table.to_string(),
            id_column: if historical { "card_id" } else { "id" },
        }
    }

    fn cards_table(&self) -> String {
        self.ctx.project.cards_table()
    }

    pub(crate) fn property(&self, name: &str) -> Result<&'a PropertyDefinition, DomainError> {
        self.ctx
            .project
            .find_property(name)
            .ok_or_else(|| DomainError::invalid(format!("Card property '{}' does not exist!", name.trim())))
    }

    pub(crate) fn id(&self) -> SimpleExpr {
        Expr::col((Alias::new(&self.table), Alias::new(self.id_column))).into()
    }

    pub(crate) fn column(&self, property: &PropertyDefinition) -> SimpleExpr {
        Expr::col((Alias::new(&self.table), Alias::new(&property.column_name))).into()
    }

    /// `"alias"."id" IN (SELECT "id" FROM cards WHERE <filter>)` over the
    /// current cards table.
    fn card_ids_where(&self, filter: SimpleExpr) -> SelectStatement {
        Query::select()
            .column(Alias::new("id"))
            .from(Alias::new(self.cards_table()))
            .and_where(filter)
            .to_owned()
    }

    fn cards_with_number(&self, number: i64) -> SelectStatement {
        self.card_ids_where(Expr::col(Alias::new("number")).eq(number))
    }

    fn cards_named(&self, name: &str) -> SelectStatement {
        self.card_ids_where(
            Expr::expr(lower(Expr::col(Alias::new("name")).into())).eq(name.trim().to_lowercase()),
        )
    }

    fn or_null(&self, expr: SimpleExpr, property: &PropertyDefinition) -> SimpleExpr {
        Cond::any()
            .add(expr)
            .add(Expr::expr(self.column(property)).is_null())
            .into()
    }

    pub(crate) fn condition(&self, condition: &Condition) -> Result<SimpleExpr, DomainError> {
        match condition {
            Condition::And(l, r) => Ok(Cond::all()
                .add(self.condition(l)?)
                .add(self.condition(r)?)
                .into()),
            Condition::Or(l, r) => Ok(Cond::any()
                .add(self.condition(l)?)
                .add(self.condition(r)?)
                .into()),
            Condition::Not(inner) => Ok(negate(self.condition(inner)?)),
            Condition::Compare {
                property,
                operator,
                value,
            } => {
                let property = self.property(property)?;
                let operand = self.resolve(property, value)?;
                self.compare(property, *operator, operand)
            }
            Condition::IsNull { property, negated } => {
                let column = Expr::expr(self.column(self.property(property)?));
                Ok(if *negated {
                    column.is_not_null()
                } else {
                    column.is_null()
                })
            }
            Condition::In {
                property,
                values,
                negated,
            } => {
                let property = self.property(property)?;
                if values.is_empty() {
                    return Ok(if *negated { always() } else { never() });
                }
                let mut any = Cond::any();
                for value in values {
                    let operand = self.resolve(property, value)?;
                    any = any.add(self.compare(property, Operator::Eq, operand)?);
                }
                let matched: SimpleExpr = any.into();
                Ok(if *negated {
                    self.or_null(negate(matched), property)
                } else {
                    matched
                })
            }
            Condition::InQuery {
                property,
                query,
                negated,
            } => self.in_query(self.property(property)?, query, *negated),
            Condition::NumbersIn { property, numbers } => {
                let property = self.property(property)?;
                let mut parsed = Vec::with_capacity(numbers.len());
                for number in numbers {
                    parsed.push(parse_card_number(number).ok_or_else(|| {
                        DomainError::invalid(format!("{} is not a valid card number.", number))
                    })?);
                }
                if property.predefined() == Some(Predefined::Number) {
                    Ok(Expr::expr(self.column(property)).is_in(parsed))
                } else if property.is_relationship() {
                    let numbers = self.card_ids_where(Expr::col(Alias::new("number")).is_in(parsed));
                    Ok(Expr::expr(self.column(property)).in_subquery(numbers))
                } else {
                    Err(DomainError::invalid(format!(
                        "NUMBERS IN can only be used with Number or card relationship properties, not {}.",
                        property.name
                    )))
                }
            }
            Condition::TaggedWith(tag) => {
                let taggings = Query::select()
                    .column(Alias::new("card_id"))
                    .from(Alias::new(self.ctx.project.schema.taggings_table()))
                    .and_where(
                        Expr::expr(lower(Expr::col(Alias::new("tag")).into()))
                            .eq(tag.trim().to_lowercase()),
                    )
                    .to_owned();
                Ok(Expr::expr(self.id()).in_subquery(taggings))
            }
            Condition::InPlan(plan) => {
                let works = Query::select()
                    .column(Alias::new("card_id"))
                    .from(Alias::new(self.ctx.project.schema.plan_works_table()))
                    .and_where(
                        Expr::expr(lower(Expr::col(Alias::new("plan_name")).into()))
                            .eq(plan.trim().to_lowercase()),
                    )
                    .to_owned();
                Ok(Expr::expr(self.id()).in_subquery(works))
            }
        }
    }

    fn resolve(
        &self,
        property: &'a PropertyDefinition,
        value: &Value,
    ) -> Result<Operand<'a>, DomainError> {
        let text_or_null = |v: Option<String>| v.map_or(Operand::Null, Operand::Text);
        match value {
            Value::Literal(text) => Ok(Operand::Text(text.clone())),
            Value::Variable(name) => {
                let variable = self.ctx.project.variable(name).ok_or_else(|| {
                    DomainError::invalid(format!("Project variable ({}) does not exist.", name))
                })?;
                if !variable.property_ids.is_empty() && !variable.property_ids.contains(&property.id) {
                    return Err(DomainError::invalid(format!(
                        "Project variable ({}) is not valid for the property {}.",
                        variable.name, property.name
                    )));
                }
                Ok(match (&variable.kind, &variable.value) {
                    (_, None) => Operand::Null,
                    (VariableKind::Card { .. }, Some(number)) => Operand::CardNumber(number.clone()),
                    (_, Some(value)) => Operand::Text(value.clone()),
                })
            }
            Value::ThisCard(None) => {
                if !property.is_relationship() {
                    return Err(DomainError::invalid(format!(
                        "THIS CARD can only be compared with card relationship properties; use THIS CARD.{} instead.",
                        property.name
                    )));
                }
                Ok(match self.ctx.this_card()? {
                    ThisCard::Card(card) => Operand::CardId(card.id),
                    ThisCard::Unavailable => Operand::Null,
                })
            }
            Value::ThisCard(Some(name)) => {
                let other = self.property(name)?;
                Ok(match self.ctx.this_card()? {
                    ThisCard::Card(card) if other.is_relationship() => {
                        card.related_card_id(other).map_or(Operand::Null, Operand::CardId)
                    }
                    ThisCard::Card(card) => text_or_null(card.value_of(other)),
                    ThisCard::Unavailable => Operand::Null,
                })
            }
            Value::Today => {
                if !property.is_date() {
                    return Err(DomainError::invalid(format!(
                        "TODAY can only be compared with date properties, not {}.",
                        property.name
                    )));
                }
                Ok(Operand::Text(self.ctx.today.format("%Y-%m-%d").to_string()))
            }
            Value::CurrentUser => {
                if property.value_type() != ValueType::User {
                    return Err(DomainError::invalid(format!(
                        "CURRENT USER can only be compared with user properties, not {}.",
                        property.name
                    )));
                }
                Ok(Operand::Text(self.ctx.current_user()?.to_string()))
            }
            Value::CardNumber(number) => {
                if !property.is_relationship() {
                    return Err(DomainError::invalid(format!(
                        "NUMBER {} can only be compared with card relationship properties, not {}.",
                        number, property.name
                    )));
                }
                Ok(Operand::CardNumber(number.clone()))
            }
            Value::Property(name) => {
                let other = self.property(name)?;
                let compatible = property.value_type() == other.value_type()
                    || (property.is_text() && other.is_text());
                if !compatible {
                    return Err(DomainError::invalid(format!(
                        "Property {} cannot be compared with PROPERTY {} because their types differ.",
                        property.name, other.name
                    )));
                }
                Ok(Operand::Column(other))
            }
        }
    }

    fn compare(
        &self,
        property: &PropertyDefinition,
        op: Operator,
        operand: Operand<'a>,
    ) -> Result<SimpleExpr, DomainError> {
        let column = self.column(property);
        if let Operand::Null = operand {
            let column = Expr::expr(column);
            return Ok(match op {
                Operator::Ne => column.is_not_null(),
                _ => column.is_null(),
            });
        }
        if let Operand::Column(other) = &operand {
            let right = self.column(other);
            let matched = if property.is_text() {
                compare_exprs(lower(column), op, lower(right))
            } else {
                compare_exprs(column, op, right)
            };
            return Ok(if op == Operator::Ne {
                self.or_null(matched, property)
            } else {
                matched
            });
        }

        let matched = match property.value_type() {
            ValueType::Card => return self.compare_relationship(property, op, operand),
            ValueType::Number => {
                let Operand::Text(text) = &operand else {
                    return Err(self.mismatch(property, &operand));
                };
                let trimmed = if property.predefined() == Some(Predefined::Number) {
                    text.trim().trim_start_matches('#')
                } else {
                    text.trim()
                };
                let number: f64 = trimmed.parse().map_err(|_| {
                    DomainError::invalid(format!(
                        "{} is not a valid numeric value for {}.",
                        text, property.name
                    ))
                })?;
                compare_exprs(column, op, Expr::val(number).into())
            }
            ValueType::Date => {
                let Operand::Text(text) = &operand else {
                    return Err(self.mismatch(property, &operand));
                };
                let date = self.ctx.project.parse_date(text).ok_or_else(|| {
                    DomainError::invalid(format!(
                        "{} is not a valid date. Enter dates in YYYY-MM-DD or '{}' format.",
                        text, self.ctx.project.date_format
                    ))
                })?;
                compare_exprs(column, op, Expr::val(date.format("%Y-%m-%d").to_string()).into())
            }
            ValueType::Text | ValueType::User => {
                let Operand::Text(text) = &operand else {
                    return Err(self.mismatch(property, &operand));
                };
                if op.is_ordering() && self.is_ordered_set(property) {
                    self.compare_by_position(property, op, text)?
                } else {
                    compare_exprs(lower(column), op, Expr::val(text.trim().to_lowercase()).into())
                }
            }
        };
        Ok(if op == Operator::Ne {
            self.or_null(matched, property)
        } else {
            matched
        })
    }

    fn mismatch(&self, property: &PropertyDefinition, operand: &Operand<'_>) -> DomainError {
        let shown = match operand {
            Operand::CardNumber(n) => format!("NUMBER {}", n),
            Operand::CardId(id) => format!("card {}", id),
            _ => "this value".to_string(),
        };
        DomainError::invalid(format!(
            "{} cannot be compared with property {}.",
            shown, property.name
        ))
    }

    fn compare_relationship(
        &self,
        property: &PropertyDefinition,
        op: Operator,
        operand: Operand<'a>,
    ) -> Result<SimpleExpr, DomainError> {
        if op.is_ordering() {
            return Err(DomainError::invalid(format!(
                "Property {} is a card relationship and only supports = and !=.",
                property.name
            )));
        }
        let column = Expr::expr(self.column(property));
        let matched = match operand {
            Operand::CardId(id) => column.eq(id),
            Operand::CardNumber(number) => {
                let number = parse_card_number(&number).ok_or_else(|| {
                    DomainError::invalid(format!("{} is not a valid card number.", number))
                })?;
                column.in_subquery(self.cards_with_number(number))
            }
            Operand::Text(text) => match text.trim().strip_prefix('#').and_then(|n| n.parse().ok()) {
                Some(number) => column.in_subquery(self.cards_with_number(number)),
                None => column.in_subquery(self.cards_named(&text)),
            },
            Operand::Column(_) | Operand::Null => return Err(self.mismatch(property, &operand)),
        };
        Ok(if op == Operator::Ne {
            self.or_null(negate(matched), property)
        } else {
            matched
        })
    }

    /// Properties whose ordering follows a managed list rather than text.
    fn is_ordered_set(&self, property: &PropertyDefinition) -> bool {
        property.is_enumerated() || property.predefined() == Some(Predefined::Type)
    }

    /// Values of an ordered set with their positions.
    fn ordered_values(&self, property: &PropertyDefinition) -> Vec<(String, u32)> {
        if property.predefined() == Some(Predefined::Type) {
            self.ctx
                .project
                .card_types
                .iter()
                .map(|t| (t.name.clone(), t.position))
                .collect()
        } else {
            property
                .enumeration_values()
                .iter()
                .map(|v| (v.value.clone(), v.position))
                .collect()
        }
    }

    fn compare_by_position(
        &self,
        property: &PropertyDefinition,
        op: Operator,
        text: &str,
    ) -> Result<SimpleExpr, DomainError> {
        let values = self.ordered_values(property);
        let position = values
            .iter()
            .find(|(v, _)| v.eq_ignore_ascii_case(text.trim()))
            .map(|(_, p)| *p)
            .ok_or_else(|| {
                let allowed: Vec<&str> = values.iter().map(|(v, _)| v.as_str()).collect();
                DomainError::invalid(format!(
                    "{} is not a valid value for {}, which is restricted to {}.",
                    text,
                    property.name,
                    allowed.join(", ")
                ))
            })?;
        let matching: Vec<String> = values
            .iter()
            .filter(|(_, p)| match op {
                Operator::Lt => *p < position,
                Operator::Le => *p <= position,
                Operator::Gt => *p > position,
                Operator::Ge => *p >= position,
                Operator::Eq | Operator::Ne => *p == position,
            })
            .map(|(v, _)| v.to_lowercase())
            .collect();
        if matching.is_empty() {
            return Ok(never());
        }
        Ok(Expr::expr(lower(self.column(property))).is_in(matching))
    }

    fn in_query(
        &self,
        property: &'a PropertyDefinition,
        query: &crate::mql::ParsedQuery,
        negated: bool,
    ) -> Result<SimpleExpr, DomainError> {
        let inner = CardQuery::nested(self.ctx, query.clone())?;
        let selected = inner.nested_column()?;
        let column = Expr::expr(self.column(property));

        let matched = if property.is_relationship() {
            match selected.predefined() {
                Some(Predefined::Number) => column.in_subquery(inner.card_id_statement()),
                Some(Predefined::Name) => {
                    let names = inner.value_statement(lower(inner.compiler().column(selected)));
                    column.in_subquery(self.card_ids_where(
                        Expr::expr(lower(Expr::col(Alias::new("name")).into())).in_subquery(names),
                    ))
                }
                _ => {
                    return Err(DomainError::invalid(format!(
                        "Nested IN clauses compared with relationship property {} may only select Number or Name.",
                        property.name
                    )))
                }
            }
        } else if selected.is_relationship() {
            return Err(DomainError::invalid(format!(
                "Nested IN clause selects relationship property {}, which cannot be compared with {}.",
                selected.name, property.name
            )));
        } else if property.is_text() {
            let values = inner.value_statement(lower(inner.compiler().column(selected)));
            Expr::expr(lower(self.column(property))).in_subquery(values)
        } else {
            column.in_subquery(inner.value_statement(inner.compiler().column(selected)))
        };
        Ok(if negated {
            self.or_null(negate(matched), property)
        } else {
            matched
        })
    }

    fn join_alias(property: &PropertyDefinition) -> String {
        format!("{}_card", property.column_name)
    }

    /// Join to the referenced card of a relationship column, deduplicated by
    /// column.
    fn require_join(&self, property: &PropertyDefinition, joins: &mut Vec<JoinPlan>) -> String {
        let alias = Self::join_alias(property);
        if !joins.iter().any(|j| j.alias == alias) {
            joins.push(JoinPlan {
                alias: alias.clone(),
                on: Expr::col((Alias::new(&alias), Alias::new("id")))
                    .equals((Alias::new(&self.table), Alias::new(&property.column_name))),
            });
        }
        alias
    }

    /// Displayed value of a property column.
    pub(crate) fn value_expr(
        &self,
        property: &PropertyDefinition,
        joins: &mut Vec<JoinPlan>,
    ) -> SimpleExpr {
        if property.is_relationship() {
            let alias = self.require_join(property, joins);
            Expr::cust(format!(
                r#"CASE WHEN "{a}"."id" IS NULL THEN NULL ELSE '#' || "{a}"."number" || ' ' || "{a}"."name" END"#,
                a = alias
            ))
        } else {
            self.column(property)
        }
    }

    /// Expression ordering a property: list position for managed lists,
    /// card number for relationships, case-insensitive text otherwise.
    pub(crate) fn order_expr(
        &self,
        property: &PropertyDefinition,
        joins: &mut Vec<JoinPlan>,
    ) -> SimpleExpr {
        if property.is_relationship() {
            let alias = self.require_join(property, joins);
            return Expr::col((Alias::new(alias), Alias::new("number"))).into();
        }
        if self.is_ordered_set(property) && !property.is_numeric() {
            let mut sql = format!(
                r#"CASE LOWER("{}"."{}")"#,
                self.table, property.column_name
            );
            for (value, position) in self.ordered_values(property) {
                sql.push_str(&format!(" WHEN {} THEN {}", sql_text(&value.to_lowercase()), position));
            }
            sql.push_str(" END");
            return Expr::cust(sql);
        }
        if property.is_text() {
            return lower(self.column(property));
        }
        self.column(property)
    }

    /// Selected expression and alias of one column.
    pub(crate) fn select_column(
        &self,
        column: &SelectColumn,
        joins: &mut Vec<JoinPlan>,
    ) -> Result<(SimpleExpr, String), DomainError> {
        match column {
            SelectColumn::Property(name) => {
                let property = self.property(name)?;
                Ok((self.value_expr(property, joins), property.name.clone()))
            }
            SelectColumn::Aggregate {
                function: AggregateFunction::Count,
                property: None,
            } => Ok((
                Expr::col(Asterisk).count(),
                AggregateFunction::Count.alias(None),
            )),
            SelectColumn::Aggregate {
                function: _,
                property: None,
            } => Err(DomainError::invalid(
                "Only COUNT can be applied to *.",
            )),
            SelectColumn::Aggregate {
                function,
                property: Some(name),
            } => {
                let property = self.property(name)?;
                let alias = function.alias(Some(&property.name));
                let column = self.column(property);
                if *function == AggregateFunction::Count {
                    return Ok((Func::count(column).into(), alias));
                }
                if !property.is_numeric() {
                    return Err(DomainError::invalid(format!(
                        "Property {} is not numeric, only numeric properties can be aggregated with {}.",
                        property.name,
                        function.as_str()
                    )));
                }
                let expr: SimpleExpr = match function {
                    AggregateFunction::Sum => Func::sum(column).into(),
                    AggregateFunction::Avg => Func::avg(column).into(),
                    AggregateFunction::Min => Func::min(column).into(),
                    AggregateFunction::Max => Func::max(column).into(),
                    AggregateFunction::Count => Func::count(column).into(),
                };
                Ok((expr, alias))
            }
        }
    }
}

pub(crate) fn order(direction: Direction) -> Order {
    match direction {
        Direction::Asc => Order::Asc,
        Direction::Desc => Order::Desc,
    }
}
