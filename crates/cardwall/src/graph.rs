//! Dependency graph operations and validation.
//!
//! Provides cycle detection and dependency ordering.
//!
//! The graph module provides a generic `DependencyGraph<T>` that works with any
//! type implementing the `GraphNode` trait. Derived properties use it through
//! [`PropertyNode`]: one node per property definition, with an edge for every
//! property a formula uses and for every property an aggregate targets or
//! mentions in its condition. Both edge kinds live in the same graph, so a
//! cycle that alternates between formulas and aggregates is found by the same
//! traversal.

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::domain::{Project, PropertyId, PropertyKind};
use crate::errors::DomainError;
use crate::formula::FormulaExpr;

/// Trait for types that can participate in a dependency graph
pub trait GraphNode {
    /// Unique identifier for this node
    fn id(&self) -> &str;

    /// IDs of nodes this node depends on
    fn dependencies(&self) -> &[String];
}

/// Errors that can occur during graph operations
#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    /// A cycle was detected; `path` starts and ends at the same node.
    #[error("Cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
}

/// Generic dependency graph with cycle detection and traversal.
///
/// All methods are pure functions that do not modify the graph structure.
/// Iteration follows node id order, so results are deterministic.
pub struct DependencyGraph<'a, T: GraphNode> {
    nodes: BTreeMap<String, &'a T>,
}

impl<'a, T: GraphNode> DependencyGraph<'a, T> {
    pub fn new(nodes: &[&'a T]) -> Self {
        let nodes_map = nodes
            .iter()
            .map(|node| (node.id().to_string(), *node))
            .collect();

        Self { nodes: nodes_map }
    }

    /// Shortest dependency path from `start` to `target`, both included.
    fn path_between(&self, start: &str, target: &str) -> Option<Vec<String>> {
        let mut previous: BTreeMap<&str, &str> = BTreeMap::new();
        let mut visited = BTreeSet::from([start]);
        let mut queue = std::collections::VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            if current == target {
                let mut path = vec![current.to_string()];
                let mut cursor = current;
                while let Some(prev) = previous.get(cursor) {
                    path.push(prev.to_string());
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            if let Some(node) = self.nodes.get(current) {
                for dep in node.dependencies() {
                    if visited.insert(dep.as_str()) {
                        previous.insert(dep.as_str(), current);
                        queue.push_back(dep.as_str());
                    }
                }
            }
        }
        None
    }

    /// Cycle through `start`, if any: `[start, .., start]`.
    pub fn find_cycle_path(&self, start: &str) -> Option<Vec<String>> {
        let node = self.nodes.get(start)?;
        node.dependencies()
            .iter()
            .filter_map(|dep| self.path_between(dep, start))
            .min_by_key(Vec::len)
            .map(|mut path| {
                path.insert(0, start.to_string());
                path
            })
    }

    /// Node ids ordered so that every node comes after its dependencies.
    /// Dependencies on ids outside the graph are ignored.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut done = BTreeSet::new();
        let mut in_progress = Vec::new();

        for id in self.nodes.keys() {
            self.visit(id, &mut done, &mut in_progress, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        id: &str,
        done: &mut BTreeSet<String>,
        in_progress: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<(), GraphError> {
        if done.contains(id) {
            return Ok(());
        }
        if let Some(position) = in_progress.iter().position(|p| p == id) {
            let mut path = in_progress[position..].to_vec();
            path.push(id.to_string());
            return Err(GraphError::CycleDetected { path });
        }
        let Some(node) = self.nodes.get(id) else {
            return Ok(());
        };
        in_progress.push(id.to_string());
        for dep in node.dependencies() {
            self.visit(dep, done, in_progress, order)?;
        }
        in_progress.pop();
        done.insert(id.to_string());
        order.push(id.to_string());
        Ok(())
    }
}

/// A property definition as a graph node.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyNode {
    pub property_id: PropertyId,
    pub name: String,
    id: String,
    dependencies: Vec<String>,
}

impl PropertyNode {
    pub fn new(property_id: PropertyId, name: &str, dependencies: &[PropertyId]) -> Self {
        PropertyNode {
            property_id,
            name: name.to_string(),
            id: property_id.to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        }
    }
}

impl GraphNode for PropertyNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

/// Properties a derived property reads. Names that no longer resolve are
/// skipped; validation reports them separately.
pub fn property_dependencies(project: &Project, kind: &PropertyKind) -> Vec<PropertyId> {
    let names = match kind {
        PropertyKind::Formula(formula) => FormulaExpr::parse(&formula.formula)
            .map(|expr| expr.property_names())
            .unwrap_or_default(),
        PropertyKind::Aggregate(aggregate) => {
            let mut names = aggregate.condition_property_names();
            if let Some(target) = aggregate
                .target_property_id
                .and_then(|id| project.property(id))
            {
                names.insert(0, target.name.clone());
            }
            names
        }
        _ => Vec::new(),
    };
    let mut ids: Vec<PropertyId> = Vec::new();
    for name in names {
        if let Some(property) = project.find_property(&name) {
            if !ids.contains(&property.id) {
                ids.push(property.id);
            }
        }
    }
    ids
}

/// One node per property definition of the project.
pub fn property_nodes(project: &Project) -> Vec<PropertyNode> {
    project
        .properties
        .iter()
        .map(|p| PropertyNode::new(p.id, &p.name, &property_dependencies(project, &p.kind)))
        .collect()
}

/// Reject a derived property whose dependencies would make it depend on
/// itself, naming the property and the path.
pub fn check_circular_reference(
    project: &Project,
    property_id: PropertyId,
    name: &str,
    dependencies: &[PropertyId],
) -> Result<(), DomainError> {
    let mut nodes = property_nodes(project);
    let candidate = PropertyNode::new(property_id, name, dependencies);
    match nodes.iter_mut().find(|n| n.property_id == property_id) {
        Some(existing) => *existing = candidate,
        None => nodes.push(candidate),
    }
    let refs: Vec<&PropertyNode> = nodes.iter().collect();
    let graph = DependencyGraph::new(&refs);

    let Some(path) = graph.find_cycle_path(&property_id.to_string()) else {
        return Ok(());
    };
    let names: Vec<String> = path
        .iter()
        .map(|id| {
            nodes
                .iter()
                .find(|n| n.id() == id)
                .map_or_else(|| id.clone(), |n| n.name.clone())
        })
        .collect();
    Err(DomainError::Validation(vec![format!(
        "{} cannot be saved because it creates a circular reference: {}.",
        name,
        names.join(" uses ")
    )]))
}
