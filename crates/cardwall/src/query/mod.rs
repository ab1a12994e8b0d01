//! Compiled card queries.
//!
//! A [`CardQuery`] binds a parsed MQL statement to a project, applies the
//! grouping and ordering defaults, rejects illegal clause combinations and
//! compiles everything up front. The four SQL forms it produces share one
//! filter and differ only in their projection.

mod compiler;

use anyhow::Result;
use chrono::NaiveDate;
use sea_query::{
    Alias, Expr, ExprTrait, JoinType, Order, Query, SelectStatement, SimpleExpr,
    SqliteQueryBuilder,
};
use tracing::debug;

pub(crate) use compiler::sql_text;
use compiler::{order, JoinPlan, SqlCompiler};

use crate::context::EvaluationContext;
use crate::domain::{CardId, PropertyDefinition};
use crate::errors::DomainError;
use crate::mql::{self, Condition, Direction, OrderBy, ParsedQuery, SelectColumn, Value};
use crate::mql::Operator;
use crate::storage::{CardStore, Row};
use crate::tree::TreeConfiguration;

#[derive(Debug, Clone, Default)]
struct SelectPlan {
    columns: Vec<(SimpleExpr, String)>,
    group_by: Vec<SimpleExpr>,
    order_by: Vec<(SimpleExpr, Order)>,
    joins: Vec<JoinPlan>,
}

#[derive(Debug, Clone)]
pub struct CardQuery<'a> {
    ctx: EvaluationContext<'a>,
    /// As written, before defaults.
    parsed: ParsedQuery,
    /// With grouping and ordering defaults applied.
    effective: ParsedQuery,
    tree: Option<&'a TreeConfiguration>,
    as_of: Option<NaiveDate>,
    filter: Option<SimpleExpr>,
    plan: SelectPlan,
}

impl<'a> CardQuery<'a> {
    pub fn new(ctx: &EvaluationContext<'a>, parsed: ParsedQuery) -> Result<Self, DomainError> {
        Self::build(ctx, parsed, false)
    }

    pub fn parse(ctx: &EvaluationContext<'a>, mql: &str) -> Result<Self, DomainError> {
        Self::new(ctx, mql::parse(mql)?)
    }

    /// Query selecting every card matching `condition`, or every card.
    pub fn from_condition(
        ctx: &EvaluationContext<'a>,
        condition: Option<Condition>,
    ) -> Result<Self, DomainError> {
        Self::new(
            ctx,
            ParsedQuery {
                condition,
                ..ParsedQuery::default()
            },
        )
    }

    /// Sub-query of an `IN (SELECT ...)` condition.
    pub(crate) fn nested(
        ctx: &EvaluationContext<'a>,
        parsed: ParsedQuery,
    ) -> Result<Self, DomainError> {
        Self::build(ctx, parsed, true)
    }

    /// Same query with `condition` ANDed onto its filter.
    pub fn restrict_with(&self, condition: Condition) -> Result<Self, DomainError> {
        let mut parsed = self.parsed.clone();
        parsed.condition = Some(match parsed.condition.take() {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        Self::new(&self.ctx, parsed)
    }

    fn build(
        ctx: &EvaluationContext<'a>,
        parsed: ParsedQuery,
        nested: bool,
    ) -> Result<Self, DomainError> {
        let project = ctx.project;
        if nested {
            check_nested(&parsed)?;
        }
        if parsed.from_trees.len() > 1 {
            return Err(DomainError::invalid(format!(
                "FROM TREE can only reference one tree, found {}.",
                parsed.from_trees.join(", ")
            )));
        }
        if parsed.as_of.is_some() {
            if !parsed.from_trees.is_empty() {
                return Err(DomainError::invalid("AS OF cannot be used with FROM TREE."));
            }
            if parsed
                .condition
                .as_ref()
                .is_some_and(Condition::has_tag_or_plan_condition)
            {
                return Err(DomainError::invalid(
                    "AS OF cannot be used with TAGGED WITH or IN PLAN.",
                ));
            }
        }

        let tree = match parsed.from_trees.first() {
            Some(name) => Some(
                project
                    .tree(name)
                    .ok_or_else(|| DomainError::not_found("Tree", name.as_str()))?,
            ),
            None => None,
        };
        let as_of = match &parsed.as_of {
            Some(text) => Some(project.parse_date(text).ok_or_else(|| {
                DomainError::invalid(format!(
                    "AS OF {} is not a valid date. Enter dates in YYYY-MM-DD or '{}' format.",
                    text, project.date_format
                ))
            })?),
            None => None,
        };

        let table = project.cards_table();
        let compiler = SqlCompiler::new(ctx, &table, as_of.is_some());
        let effective = with_defaults(&parsed, &compiler, nested)?;
        check_grouping(&effective, &compiler)?;
        let filter = effective
            .condition
            .as_ref()
            .map(|c| compiler.condition(c))
            .transpose()?;
        let plan = plan_select(&effective, &compiler)?;

        Ok(CardQuery {
            ctx: ctx.clone(),
            parsed,
            effective,
            tree,
            as_of,
            filter,
            plan,
        })
    }

    pub fn context(&self) -> &EvaluationContext<'a> {
        &self.ctx
    }

    pub fn parsed(&self) -> &ParsedQuery {
        &self.parsed
    }

    pub fn condition(&self) -> Option<&Condition> {
        self.parsed.condition.as_ref()
    }

    pub fn tree(&self) -> Option<&'a TreeConfiguration> {
        self.tree
    }

    pub fn as_of(&self) -> Option<NaiveDate> {
        self.as_of
    }

    /// Canonical MQL text of the query as written.
    pub fn to_mql(&self) -> String {
        self.parsed.to_string()
    }

    /// Effective grouping after defaults.
    pub fn group_by(&self) -> &[String] {
        &self.effective.group_by
    }

    /// Effective ordering after defaults.
    pub fn order_by(&self) -> &[OrderBy] {
        &self.effective.order_by
    }

    /// Result column names in select order, injected order columns included.
    pub fn column_names(&self) -> Vec<String> {
        self.plan.columns.iter().map(|(_, alias)| alias.clone()).collect()
    }

    fn compiler(&self) -> SqlCompiler<'_, 'a> {
        SqlCompiler::new(&self.ctx, &self.ctx.project.cards_table(), self.as_of.is_some())
    }

    fn where_clauses(&self) -> Vec<SimpleExpr> {
        let project = self.ctx.project;
        let table = project.cards_table();
        let mut clauses: Vec<SimpleExpr> = self.filter.iter().cloned().collect();
        if let Some(tree) = self.tree {
            let members = Query::select()
                .column(Alias::new("card_id"))
                .from(Alias::new(project.schema.tree_belongings_table()))
                .and_where(Expr::col(Alias::new("tree_configuration_id")).eq(tree.id))
                .to_owned();
            clauses.push(Expr::col((Alias::new(&table), Alias::new("id"))).in_subquery(members));
        }
        if let Some(date) = self.as_of {
            let day_after = date.succ_opt().unwrap_or(date);
            clauses.push(Expr::cust(format!(
                r#""{table}"."id" IN (SELECT MAX("id") FROM "{versions}" WHERE "updated_at" < '{day}' GROUP BY "card_id")"#,
                table = table,
                versions = project.schema.versions_table(),
                day = day_after.format("%Y-%m-%d"),
            )));
        }
        clauses
    }

    fn base_statement(&self) -> SelectStatement {
        let project = self.ctx.project;
        let mut select = Query::select();
        if self.as_of.is_some() {
            select.from_as(
                Alias::new(project.schema.versions_table()),
                Alias::new(project.cards_table()),
            );
        } else {
            select.from(Alias::new(project.cards_table()));
        }
        for clause in self.where_clauses() {
            select.and_where(clause);
        }
        select
    }

    pub(crate) fn card_id_statement(&self) -> SelectStatement {
        let mut select = self.base_statement();
        select.expr_as(self.compiler().id(), Alias::new("id"));
        select
    }

    pub(crate) fn value_statement(&self, expr: SimpleExpr) -> SelectStatement {
        let mut select = self.base_statement();
        select.expr_as(expr, Alias::new("value"));
        select
    }

    /// The single property a sub-query selects.
    pub(crate) fn nested_column(&self) -> Result<&'a PropertyDefinition, DomainError> {
        match self.parsed.columns.as_slice() {
            [SelectColumn::Property(name)] => self.compiler().property(name),
            _ => Err(DomainError::invalid(
                "Nested IN clauses must select exactly one property.",
            )),
        }
    }

    /// Rows with the selected (or default) columns.
    pub fn to_sql(&self) -> String {
        let mut select = self.base_statement();
        if self.effective.distinct {
            select.distinct();
        }
        for (expr, alias) in &self.plan.columns {
            select.expr_as(expr.clone(), Alias::new(alias));
        }
        let cards = self.ctx.project.cards_table();
        for join in &self.plan.joins {
            select.join_as(
                JoinType::LeftJoin,
                Alias::new(&cards),
                Alias::new(&join.alias),
                join.on.clone(),
            );
        }
        select.add_group_by(self.plan.group_by.clone());
        for (expr, direction) in &self.plan.order_by {
            select.order_by_expr(expr.clone(), direction.clone());
        }
        select.to_string(SqliteQueryBuilder)
    }

    /// Ids of the matching cards.
    pub fn to_card_id_sql(&self) -> String {
        self.card_id_statement().to_string(SqliteQueryBuilder)
    }

    pub fn to_count_sql(&self) -> String {
        let mut select = self.base_statement();
        select.expr_as(Expr::cust("COUNT(*)"), Alias::new("count"));
        select.to_string(SqliteQueryBuilder)
    }

    /// Numbers of the matching cards in ascending order.
    pub fn to_card_number_sql(&self) -> String {
        let number = self
            .compiler()
            .column(self.ctx.project.predefined_property(crate::domain::Predefined::Number));
        let mut select = self.base_statement();
        select
            .expr_as(number.clone(), Alias::new("number"))
            .order_by_expr(number, Order::Asc);
        select.to_string(SqliteQueryBuilder)
    }

    pub fn values<S: CardStore>(&self, store: &S) -> Result<Vec<Row>> {
        let sql = self.to_sql();
        debug!(mql = %self.to_mql(), %sql, "Running card query");
        store.query_rows(&sql)
    }

    pub fn card_ids<S: CardStore>(&self, store: &S) -> Result<Vec<CardId>> {
        store.query_ids(&self.to_card_id_sql())
    }

    pub fn count<S: CardStore>(&self, store: &S) -> Result<usize> {
        let value = store.query_scalar(&self.to_count_sql())?;
        Ok(value.map(|v| v.parse::<usize>()).transpose()?.unwrap_or(0))
    }

    pub fn card_numbers<S: CardStore>(&self, store: &S) -> Result<Vec<i64>> {
        store.query_ids(&self.to_card_number_sql())
    }

    /// First column of the first row, as used by value macros.
    pub fn single_value<S: CardStore>(&self, store: &S) -> Result<Option<String>> {
        store.query_scalar(&self.to_sql())
    }
}

fn check_nested(parsed: &ParsedQuery) -> Result<(), DomainError> {
    let mut clauses = Vec::new();
    if parsed.as_of.is_some() {
        clauses.push("AS OF");
    }
    if !parsed.group_by.is_empty() {
        clauses.push("GROUP BY");
    }
    if !parsed.order_by.is_empty() {
        clauses.push("ORDER BY");
    }
    if !clauses.is_empty() {
        return Err(DomainError::invalid(format!(
            "Nested IN clauses cannot use {}.",
            clauses.join(" or ")
        )));
    }
    match parsed.columns.as_slice() {
        [SelectColumn::Property(_)] => Ok(()),
        [SelectColumn::Aggregate { .. }] => Err(DomainError::invalid(
            "Nested IN clauses cannot select aggregate functions.",
        )),
        _ => Err(DomainError::invalid(
            "Nested IN clauses must select exactly one property.",
        )),
    }
}

fn with_defaults(
    parsed: &ParsedQuery,
    compiler: &SqlCompiler<'_, '_>,
    nested: bool,
) -> Result<ParsedQuery, DomainError> {
    let mut effective = parsed.clone();
    for column in &effective.columns {
        if let Some(name) = column.property_name() {
            compiler.property(name)?;
        }
    }
    for name in effective
        .group_by
        .iter()
        .chain(effective.order_by.iter().map(|o| &o.property))
    {
        compiler.property(name)?;
    }
    if nested {
        return Ok(effective);
    }

    if effective.is_aggregate() && effective.group_by.is_empty() {
        effective.group_by = effective
            .columns
            .iter()
            .filter_map(|c| match c {
                SelectColumn::Property(name) => Some(name.clone()),
                SelectColumn::Aggregate { .. } => None,
            })
            .collect();
    }
    if effective.order_by.is_empty() {
        let single_numeric = match effective.columns.as_slice() {
            [SelectColumn::Property(name)] => compiler.property(name)?.is_numeric(),
            _ => false,
        };
        let order_on = |names: Vec<String>| -> Vec<OrderBy> {
            names
                .into_iter()
                .map(|property| OrderBy {
                    property,
                    direction: Direction::Asc,
                })
                .collect()
        };
        if !effective.group_by.is_empty() {
            effective.order_by = order_on(effective.group_by.clone());
        } else if single_numeric {
            effective.order_by = order_on(
                effective
                    .columns
                    .iter()
                    .filter_map(|c| c.property_name().map(str::to_string))
                    .collect(),
            );
        } else if !effective.distinct && !effective.is_aggregate() {
            effective.order_by = order_on(vec!["Number".to_string()]);
        }
    }
    Ok(effective)
}

/// Whether a top-level conjunct pins `property` to one value.
fn constrained_to_single_value(condition: &Condition, property: &str) -> bool {
    match condition {
        Condition::And(l, r) => {
            constrained_to_single_value(l, property) || constrained_to_single_value(r, property)
        }
        Condition::Compare {
            property: p,
            operator: Operator::Eq,
            value,
        } => p.eq_ignore_ascii_case(property) && !matches!(value, Value::Property(_)),
        Condition::IsNull {
            property: p,
            negated: false,
        } => p.eq_ignore_ascii_case(property),
        Condition::In {
            property: p,
            values,
            negated: false,
        } => p.eq_ignore_ascii_case(property) && values.len() == 1,
        _ => false,
    }
}

fn check_grouping(effective: &ParsedQuery, compiler: &SqlCompiler<'_, '_>) -> Result<(), DomainError> {
    if effective.group_by.is_empty() {
        return Ok(());
    }
    let grouped = |name: &str| -> Result<bool, DomainError> {
        let property = compiler.property(name)?;
        Ok(effective
            .group_by
            .iter()
            .any(|g| property.name_matches(g))
            || effective
                .condition
                .as_ref()
                .is_some_and(|c| constrained_to_single_value(c, name)))
    };
    let mut errors = Vec::new();
    for column in &effective.columns {
        if let SelectColumn::Property(name) = column {
            if !grouped(name)? {
                errors.push(format!(
                    "SELECT property {} must be included in GROUP BY or restricted to a single value.",
                    name
                ));
            }
        }
    }
    for order in &effective.order_by {
        if !grouped(&order.property)? {
            errors.push(format!(
                "ORDER BY property {} must be included in GROUP BY or restricted to a single value.",
                order.property
            ));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(DomainError::Validation(errors))
    }
}

fn plan_select(
    effective: &ParsedQuery,
    compiler: &SqlCompiler<'_, '_>,
) -> Result<SelectPlan, DomainError> {
    let mut plan = SelectPlan::default();
    let selected = if effective.columns.is_empty() {
        vec![
            SelectColumn::Property("Number".to_string()),
            SelectColumn::Property("Name".to_string()),
        ]
    } else {
        effective.columns.clone()
    };

    // order-only columns go first so user aliases win on lookup
    if effective.distinct {
        for order_by in &effective.order_by {
            let property = compiler.property(&order_by.property)?;
            let is_selected = selected.iter().any(|c| match c {
                SelectColumn::Property(name) => property.name_matches(name),
                SelectColumn::Aggregate { .. } => false,
            });
            if !is_selected {
                let expr = compiler.order_expr(property, &mut plan.joins);
                plan.columns.push((expr, property.name.clone()));
            }
        }
    }
    for column in &selected {
        let compiled = compiler.select_column(column, &mut plan.joins)?;
        plan.columns.push(compiled);
    }
    for name in &effective.group_by {
        let property = compiler.property(name)?;
        plan.group_by.push(compiler.value_expr(property, &mut plan.joins));
    }
    for order_by in &effective.order_by {
        let property = compiler.property(&order_by.property)?;
        plan.order_by.push((
            compiler.order_expr(property, &mut plan.joins),
            order(order_by.direction),
        ));
    }
    Ok(plan)
}
