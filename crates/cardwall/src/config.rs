//! Project configuration file loading.
//!
//! A project is described in `cardwall.toml`: card types, properties, trees,
//! aggregates, formulas, variables, saved views and transitions. Every
//! section is optional. [`ProjectConfig::build_project`] turns the file
//! into a validated [`Project`], reporting every problem at once.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::aggregate::{AggregateDefinition, AggregateScope, EngineSettings};
use crate::domain::{
    FavoriteView, HistorySubscription, Params, Project, ProjectVariable, PropertyKind,
    Transition, VariableKind,
};
use crate::errors::DomainError;
use crate::filters::Filters;
use crate::mql::AggregateFunction;
use crate::properties::enumeration_values;
use crate::tree::TreeFilters;

/// Default configuration file name.
pub const CONFIG_FILE: &str = "cardwall.toml";

/// Root configuration structure loaded from `cardwall.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    /// Project identity (optional).
    pub project: Option<ProjectSection>,
    /// Recomputation tuning (optional).
    pub engine: Option<EngineConfig>,
    #[serde(default)]
    pub card_types: Vec<CardTypeConfig>,
    #[serde(default)]
    pub properties: Vec<PropertyConfig>,
    #[serde(default)]
    pub trees: Vec<TreeConfig>,
    #[serde(default)]
    pub aggregates: Vec<AggregateConfig>,
    #[serde(default)]
    pub formulas: Vec<FormulaConfig>,
    #[serde(default)]
    pub variables: Vec<VariableConfig>,
    #[serde(default)]
    pub views: Vec<FavoriteView>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub subscriptions: Vec<HistorySubscription>,
}

/// Project identity.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectSection {
    /// Table prefix (default: "cardwall").
    pub identifier: Option<String>,
    /// Display name (default: the identifier).
    pub name: Option<String>,
    /// chrono format accepted for dates in addition to ISO (default: "%d %b %Y").
    pub date_format: Option<String>,
}

impl ProjectSection {
    pub fn identifier(&self) -> String {
        self.identifier
            .clone()
            .unwrap_or_else(|| "cardwall".to_string())
    }

    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.identifier())
    }
}

/// Recomputation tuning.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Ids per IN-clause slice (default: 1000).
    pub batch_size: Option<usize>,
    /// Above this many cards a new aggregate is computed in the background (default: 50).
    pub inline_recompute_limit: Option<usize>,
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        let defaults = EngineSettings::default();
        EngineSettings {
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            inline_recompute_limit: self
                .inline_recompute_limit
                .unwrap_or(defaults.inline_recompute_limit),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardTypeConfig {
    pub name: String,
    /// Properties available on this card type.
    #[serde(default)]
    pub properties: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKindConfig {
    Text,
    Enum,
    Date,
    User,
    Card,
    Formula,
    Aggregate,
    TreeRelationship,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropertyConfig {
    pub name: String,
    pub kind: PropertyKindConfig,
    /// Numeric text or managed number list (default: false).
    #[serde(default)]
    pub numeric: bool,
    /// Managed list values, in order.
    #[serde(default)]
    pub values: Vec<String>,
    /// Card types the property applies to, in addition to those listing it.
    #[serde(default)]
    pub card_types: Vec<String>,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeConfig {
    pub name: String,
    /// Card types from the top level down.
    pub levels: Vec<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregateConfig {
    pub name: String,
    pub tree: String,
    /// Card type the aggregate is shown on.
    pub card_type: String,
    /// count, sum, avg, min or max.
    pub function: String,
    /// "all" (default) or a card type name.
    pub scope: Option<String>,
    /// Required for every function except count.
    pub target: Option<String>,
    /// MQL condition restricting contributing cards.
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormulaConfig {
    pub name: String,
    pub formula: String,
    #[serde(default)]
    pub null_is_zero: bool,
    pub card_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariableConfig {
    pub name: String,
    /// text, number, date, user or card.
    pub kind: String,
    /// Card type of card variables (optional).
    pub card_type: Option<String>,
    pub value: Option<String>,
    /// Properties the variable may be used with.
    #[serde(default)]
    pub properties: Vec<String>,
}

impl VariableConfig {
    fn variable_kind(&self) -> Result<VariableKind, String> {
        match self.kind.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(VariableKind::Text),
            "number" => Ok(VariableKind::Number),
            "date" => Ok(VariableKind::Date),
            "user" => Ok(VariableKind::User),
            "card" => Ok(VariableKind::Card {
                card_type: self.card_type.clone(),
            }),
            other => Err(format!(
                "Variable ({}) has unknown kind '{}'. Use text, number, date, user or card.",
                self.name, other
            )),
        }
    }
}

impl ProjectConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        self.engine.clone().unwrap_or_default().settings()
    }

    /// Build the project described by the file. Later sections are still
    /// checked when earlier ones fail, so every problem is reported.
    pub fn build_project(&self) -> Result<Project, DomainError> {
        let section = self.project.clone().unwrap_or_default();
        let mut project = Project::new(section.identifier(), section.name());
        if let Some(format) = &section.date_format {
            project.date_format = format.clone();
        }
        let mut errors = Vec::new();

        for card_type in &self.card_types {
            if let Err(err) = project.create_card_type(&card_type.name) {
                errors.extend(err.messages());
            }
        }

        for property in &self.properties {
            match property.kind {
                PropertyKindConfig::Formula | PropertyKindConfig::Aggregate => {
                    errors.push(format!(
                        "Property {} must be declared in the [[formulas]] or [[aggregates]] section.",
                        property.name
                    ));
                    continue;
                }
                PropertyKindConfig::TreeRelationship => {
                    errors.push(format!(
                        "Property {} is a tree relationship; declare the tree instead.",
                        property.name
                    ));
                    continue;
                }
                _ => {}
            }
            let mut card_types: Vec<&str> = property.card_types.iter().map(String::as_str).collect();
            for card_type in &self.card_types {
                let listed = card_type
                    .properties
                    .iter()
                    .any(|p| p.trim().eq_ignore_ascii_case(property.name.trim()));
                if listed && !card_types.iter().any(|t| t.eq_ignore_ascii_case(&card_type.name)) {
                    card_types.push(&card_type.name);
                }
            }
            let created = project.create_property(&property.name, property_kind(property), &card_types);
            match created {
                Ok(id) if property.hidden => {
                    if let Some(definition) = project.property_mut(id) {
                        definition.hidden = true;
                    }
                }
                Ok(_) => {}
                Err(err) => errors.extend(err.messages()),
            }
        }
        for card_type in &self.card_types {
            for name in &card_type.properties {
                let declared = self.properties.iter().any(|p| p.name.eq_ignore_ascii_case(name.trim()))
                    || self.formulas.iter().any(|f| f.name.eq_ignore_ascii_case(name.trim()));
                if !declared {
                    errors.push(format!(
                        "Card type {} lists unknown property {}.",
                        card_type.name, name
                    ));
                }
            }
        }

        for tree in &self.trees {
            let levels: Vec<&str> = tree.levels.iter().map(String::as_str).collect();
            match project.create_tree(&tree.name, &levels) {
                Ok(_) => {
                    if let Some(description) = &tree.description {
                        if let Some(created) = project.trees.last_mut() {
                            created.description = Some(description.clone());
                        }
                    }
                }
                Err(err) => errors.extend(err.messages()),
            }
        }

        // Formulas may use aggregates and aggregates may total formulas, so
        // keep creating whatever has its inputs until nothing changes.
        let mut formulas: Vec<&FormulaConfig> = self.formulas.iter().collect();
        let mut aggregates: Vec<&AggregateConfig> = self.aggregates.iter().collect();
        loop {
            let mut progressed = false;
            let mut failed_formulas = Vec::new();
            for formula in formulas {
                let types: Vec<&str> = formula.card_types.iter().map(String::as_str).collect();
                match project.create_formula(&formula.name, &formula.formula, formula.null_is_zero, &types) {
                    Ok(_) => progressed = true,
                    Err(err) => failed_formulas.push((formula, err)),
                }
            }
            let mut failed_aggregates = Vec::new();
            for aggregate in aggregates {
                match aggregate_definition(&project, aggregate)
                    .and_then(|definition| project.create_aggregate(&aggregate.name, definition))
                {
                    Ok(_) => progressed = true,
                    Err(err) => failed_aggregates.push((aggregate, err)),
                }
            }
            if !progressed || (failed_formulas.is_empty() && failed_aggregates.is_empty()) {
                for err in failed_formulas
                    .iter()
                    .map(|(_, e)| e)
                    .chain(failed_aggregates.iter().map(|(_, e)| e))
                {
                    errors.extend(err.messages());
                }
                break;
            }
            formulas = failed_formulas.into_iter().map(|(f, _)| f).collect();
            aggregates = failed_aggregates.into_iter().map(|(a, _)| a).collect();
        }

        for variable in &self.variables {
            match project_variable(&project, variable) {
                Ok(created) => project.add_variable(created),
                Err(messages) => errors.extend(messages),
            }
        }
        for view in &self.views {
            errors.extend(view_errors(&project, &view.name, &view.params));
            project.add_view(view.clone());
        }
        for transition in &self.transitions {
            for assignment in transition.prerequisites.iter().chain(&transition.actions) {
                if project.find_property(&assignment.property).is_none() {
                    errors.push(format!(
                        "Transition {} uses unknown property {}.",
                        transition.name, assignment.property
                    ));
                }
            }
            project.add_transition(transition.clone());
        }
        for subscription in &self.subscriptions {
            project.add_subscription(subscription.clone());
        }

        if errors.is_empty() {
            Ok(project)
        } else {
            Err(DomainError::Validation(errors))
        }
    }
}

fn property_kind(property: &PropertyConfig) -> PropertyKind {
    match property.kind {
        PropertyKindConfig::Enum => PropertyKind::Enumerated {
            numeric: property.numeric,
            values: enumeration_values(&property.values),
        },
        PropertyKindConfig::Date => PropertyKind::Date,
        PropertyKindConfig::User => PropertyKind::User,
        PropertyKindConfig::Card => PropertyKind::CardRelationship,
        _ => PropertyKind::Text {
            numeric: property.numeric,
        },
    }
}

fn aggregate_definition(
    project: &Project,
    config: &AggregateConfig,
) -> Result<AggregateDefinition, DomainError> {
    let mut errors = Vec::new();
    let tree = project.tree(&config.tree);
    if tree.is_none() {
        errors.push(format!(
            "Aggregate {} uses unknown tree {}.",
            config.name, config.tree
        ));
    }
    let function = AggregateFunction::parse(config.function.trim());
    if function.is_none() {
        errors.push(format!(
            "Aggregate {} has unknown function '{}'. Use count, sum, avg, min or max.",
            config.name, config.function
        ));
    }
    let target_property_id = match &config.target {
        Some(name) => match project.find_property(name) {
            Some(property) => Some(property.id),
            None => {
                errors.push(format!(
                    "Aggregate {} targets unknown property {}.",
                    config.name, name
                ));
                None
            }
        },
        None => None,
    };
    let scope = match config.scope.as_deref().map(str::trim) {
        None | Some("") => AggregateScope::AllDescendants,
        Some(all) if all.eq_ignore_ascii_case("all") => AggregateScope::AllDescendants,
        Some(card_type) => AggregateScope::CardType(card_type.to_string()),
    };
    match (tree, function) {
        (Some(tree), Some(function)) if errors.is_empty() => Ok(AggregateDefinition {
            tree_id: tree.id,
            aggregate_card_type: config.card_type.clone(),
            scope,
            function,
            target_property_id,
            condition: config.condition.clone(),
        }),
        _ => Err(DomainError::Validation(errors)),
    }
}

fn project_variable(project: &Project, config: &VariableConfig) -> Result<ProjectVariable, Vec<String>> {
    let mut errors = Vec::new();
    let kind = config.variable_kind().map_err(|e| errors.push(e)).ok();
    let mut property_ids = Vec::new();
    for name in &config.properties {
        match project.find_property(name) {
            Some(property) => property_ids.push(property.id),
            None => errors.push(format!(
                "Variable ({}) is associated with unknown property {}.",
                config.name, name
            )),
        }
    }
    if let Some(VariableKind::Card {
        card_type: Some(card_type),
    }) = &kind
    {
        if project.card_type(card_type).is_none() {
            errors.push(format!(
                "Variable ({}) uses unknown card type {}.",
                config.name, card_type
            ));
        }
    }
    match kind {
        Some(kind) if errors.is_empty() => Ok(ProjectVariable {
            name: config.name.trim().to_string(),
            kind,
            value: config.value.clone(),
            property_ids,
        }),
        _ => Err(errors),
    }
}

/// Problems with a saved view's filters and tree filters.
fn view_errors(project: &Project, name: &str, params: &Params) -> Vec<String> {
    let prefix = |e: String| format!("View {}: {}", name, e);
    let mut errors = Vec::new();
    match Filters::from_params(params) {
        Ok(filters) => errors.extend(filters.validation_errors(project).into_iter().map(prefix)),
        Err(err) => errors.extend(err.messages().into_iter().map(prefix)),
    }
    if let Some(tree_name) = params.get("tree_name").and_then(|v| v.first()) {
        match project.tree(tree_name) {
            Some(tree) => match TreeFilters::from_params(tree, params) {
                Ok(filters) => {
                    errors.extend(filters.validation_errors(project).into_iter().map(prefix))
                }
                Err(err) => errors.extend(err.messages().into_iter().map(prefix)),
            },
            None => errors.push(prefix(format!("Tree {} does not exist.", tree_name))),
        }
    }
    errors
}
