//! Card wall query engine
//!
//! Command-line front end: compiles MQL against a project configuration,
//! validates configurations and describes saved view filters.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use cardwall::cli::{Cli, Commands};
use cardwall::config::ProjectConfig;
use cardwall::context::EvaluationContext;
use cardwall::domain::{Params, Project};
use cardwall::errors::DomainError;
use cardwall::filters::{Filters, FILTERS_PARAM};
use cardwall::graph::{property_nodes, DependencyGraph, PropertyNode};
use cardwall::output::{ExitCode, JsonError, JsonOutput, OutputContext};
use cardwall::properties::rename::MQL_PARAM;
use cardwall::query::CardQuery;
use cardwall::schema::SchemaService;
use cardwall::storage::SqliteCardStore;
use cardwall::tree::filters::{EXCLUDED_PARAM, TREE_FILTER_PREFIX};
use cardwall::tree::TreeFilters;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let output = OutputContext::new(cli.quiet, cli.json);
    let command = command_name(&cli.command);

    let exit_code = match run(&cli, &output) {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            let json_error = JsonError::from_error(&e, command);
            if output.is_json() {
                if let Ok(text) = json_error.to_json_string() {
                    println!("{}", text);
                }
            } else {
                let _ = output.print_error(error_text(&e));
            }
            json_error.exit_code()
        }
    };

    if exit_code != ExitCode::Success {
        std::process::exit(exit_code.code());
    }
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Compile { .. } => "compile",
        Commands::Validate => "validate",
        Commands::DescribeFilter { .. } => "describe-filter",
    }
}

/// Domain errors print every validation message plus the remedy.
fn error_text(error: &anyhow::Error) -> String {
    match error.downcast_ref::<DomainError>() {
        Some(DomainError::Validation(messages)) => {
            let mut text = String::from("Validation failed");
            for message in messages {
                text.push_str(&format!("\n  - {}", message));
            }
            text
        }
        Some(domain) => {
            let actionable = domain.to_actionable();
            match actionable.remedies().first() {
                Some(remedy) => format!("{}\n  Hint: {}", domain, remedy),
                None => domain.to_string(),
            }
        }
        None => format!("{:#}", error),
    }
}

fn load_project(cli: &Cli) -> Result<Project> {
    let config = ProjectConfig::load(&cli.config)?;
    let project = config.build_project()?;
    debug!(
        project = %project.identifier,
        properties = project.properties.len(),
        "Loaded project configuration"
    );
    Ok(project)
}

fn run(cli: &Cli, output: &OutputContext) -> Result<()> {
    match &cli.command {
        Commands::Compile { mql, user, today } => {
            let project = load_project(cli)?;
            let mut ctx = EvaluationContext::new(&project);
            if let Some(login) = user {
                ctx = ctx.with_user(login.clone());
            }
            if let Some(today) = today {
                let date = NaiveDate::parse_from_str(today, "%Y-%m-%d").map_err(|_| {
                    DomainError::invalid(format!("'{}' is not a date. Use YYYY-MM-DD.", today))
                })?;
                ctx = ctx.with_today(date);
            }
            let query = CardQuery::parse(&ctx, mql)?;
            let compiled = CompiledQuery {
                mql: query.to_mql(),
                columns: query.column_names(),
                values_sql: query.to_sql(),
                card_id_sql: query.to_card_id_sql(),
                count_sql: query.to_count_sql(),
                card_number_sql: query.to_card_number_sql(),
            };
            output.print_json(&JsonOutput::success(&compiled, "compile"))?;
            output.print_info(format!("MQL: {}", compiled.mql))?;
            output.print_info(format!("Columns: {}\n", compiled.columns.join(", ")))?;
            for (label, sql) in [
                ("values", &compiled.values_sql),
                ("card ids", &compiled.card_id_sql),
                ("count", &compiled.count_sql),
                ("card numbers", &compiled.card_number_sql),
            ] {
                output.print_info(format!("-- {}", label))?;
                output.print_data(format!("{};", sql))?;
            }
            Ok(())
        }
        Commands::Validate => {
            let project = load_project(cli)?;
            let report = validate(&project)?;
            output.print_json(&JsonOutput::success(&report, "validate"))?;
            output.print_data(format!("Project {} is valid.", report.project))?;
            output.print_info(format!(
                "  {} card types, {} properties, {} trees, {} formulas, {} aggregates, {} views",
                report.card_types,
                report.properties,
                report.trees,
                report.formulas,
                report.aggregates,
                report.views
            ))?;
            if !report.recompute_order.is_empty() {
                output.print_info(format!(
                    "  Recompute order: {}",
                    report.recompute_order.join(" -> ")
                ))?;
            }
            Ok(())
        }
        Commands::DescribeFilter {
            filters,
            tree,
            levels,
            exclude,
        } => {
            let project = load_project(cli)?;
            let params = filter_params(filters, levels, exclude)?;
            let description = describe_filter(&project, tree.as_deref(), &params)?;
            output.print_json(&JsonOutput::success(&description, "describe-filter"))?;
            output.print_data(&description.description)?;
            match &description.mql {
                Some(mql) => output.print_data(format!("MQL: {}", mql))?,
                None => output.print_info("MQL: (all cards)")?,
            }
            Ok(())
        }
    }
}

#[derive(Debug, Serialize)]
struct CompiledQuery {
    mql: String,
    columns: Vec<String>,
    values_sql: String,
    card_id_sql: String,
    count_sql: String,
    card_number_sql: String,
}

#[derive(Debug, Serialize)]
struct ValidationReport {
    project: String,
    card_types: usize,
    properties: usize,
    trees: usize,
    formulas: usize,
    aggregates: usize,
    views: usize,
    /// Derived properties, each after everything it reads.
    recompute_order: Vec<String>,
}

/// Checks beyond what building the project already enforces: the derived
/// property graph is acyclic, and every saved view compiles to SQL that
/// runs against freshly installed tables.
fn validate(project: &Project) -> Result<ValidationReport> {
    let nodes: Vec<PropertyNode> = property_nodes(project);
    let refs: Vec<&PropertyNode> = nodes.iter().collect();
    let order = DependencyGraph::new(&refs)
        .topological_order()
        .map_err(|e| DomainError::Validation(vec![e.to_string()]))?;
    let recompute_order = order
        .iter()
        .filter_map(|id| id.parse().ok())
        .filter_map(|id| project.property(id))
        .filter(|p| p.is_calculated())
        .map(|p| p.name.clone())
        .collect();

    let store = SqliteCardStore::open_in_memory()?;
    SchemaService::new(&store)
        .install(&project.schema)
        .context("Failed to install project tables")?;
    let ctx = EvaluationContext::new(project);
    let mut errors = Vec::new();
    for view in &project.views {
        if let Err(e) = check_view(&ctx, &store, &view.params) {
            errors.push(format!("View {}: {}", view.name, error_line(&e)));
        }
    }
    if !errors.is_empty() {
        return Err(DomainError::Validation(errors).into());
    }

    Ok(ValidationReport {
        project: project.name.clone(),
        card_types: project.card_types.len(),
        properties: project.properties.iter().filter(|p| !p.is_predefined()).count(),
        trees: project.trees.len(),
        formulas: project.formula_properties().count(),
        aggregates: project.aggregate_properties().count(),
        views: project.views.len(),
        recompute_order,
    })
}

fn error_line(error: &anyhow::Error) -> String {
    match error.downcast_ref::<DomainError>() {
        Some(domain) => domain.messages().join(" "),
        None => format!("{:#}", error),
    }
}

fn check_view(ctx: &EvaluationContext<'_>, store: &SqliteCardStore, params: &Params) -> Result<()> {
    let condition = Filters::from_params(params)?.to_condition(ctx.project)?;
    CardQuery::from_condition(ctx, condition)?.count(store)?;
    if let Some(statements) = params.get(MQL_PARAM) {
        for mql in statements {
            CardQuery::parse(ctx, mql)?.count(store)?;
        }
    }
    Ok(())
}

/// Params in saved-view form from the command-line arguments.
fn filter_params(filters: &[String], levels: &[String], exclude: &[String]) -> Result<Params> {
    let mut params = Params::new();
    if !filters.is_empty() {
        params.insert(FILTERS_PARAM.to_string(), filters.to_vec());
    }
    for level in levels {
        let (card_type, filter) = level.split_once('=').ok_or_else(|| {
            DomainError::invalid(format!(
                "Level filter '{}' is malformed. Use <Card Type>=[Property][operator][value].",
                level
            ))
        })?;
        params
            .entry(format!("{}{}", TREE_FILTER_PREFIX, card_type.trim()))
            .or_default()
            .push(filter.trim().to_string());
    }
    if !exclude.is_empty() {
        params.insert(EXCLUDED_PARAM.to_string(), exclude.to_vec());
    }
    Ok(params)
}

#[derive(Debug, Serialize)]
struct FilterDescription {
    description: String,
    mql: Option<String>,
}

fn describe_filter(project: &Project, tree: Option<&str>, params: &Params) -> Result<FilterDescription> {
    let view_filters = Filters::from_params(params)?;
    let mut errors = view_filters.validation_errors(project);
    let mut description = view_filters.description();
    let mut condition = None;

    if let Some(tree_name) = tree {
        let tree = project
            .tree(tree_name)
            .ok_or_else(|| DomainError::not_found("Tree", tree_name))?;
        let tree_filters = TreeFilters::from_params(tree, params)?;
        errors.extend(tree_filters.validation_errors(project));
        if errors.is_empty() {
            condition = tree_filters.to_condition(project)?;
            if view_filters.is_empty() {
                description = tree_filters.description();
            } else {
                description = format!("{}; {}", description, tree_filters.description());
            }
        }
    }
    if !errors.is_empty() {
        return Err(DomainError::Validation(errors).into());
    }
    if let Some(own) = view_filters.to_condition(project)? {
        condition = Some(match condition {
            Some(tree_condition) => own.and(tree_condition),
            None => own,
        });
    }
    Ok(FilterDescription {
        description,
        mql: condition.map(|c| c.to_string()),
    })
}
