//! Tree configurations: ordered card type levels joined by relationship
//! properties.

use tracing::info;

use super::RelationshipsMap;
use crate::domain::{Project, PropertyId, PropertyKind, TreeId};
use crate::errors::DomainError;

/// An ordered hierarchy of card types.
///
/// `levels[0]` is the root level. `relationship_ids[i]` is the relationship
/// property that stores, on cards below level `i`, the id of their ancestor
/// at level `i`. The leaf level has no relationship of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeConfiguration {
    pub id: TreeId,
    pub name: String,
    pub description: Option<String>,
    levels: Vec<String>,
    relationship_ids: Vec<PropertyId>,
}

impl TreeConfiguration {
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn relationship_ids(&self) -> &[PropertyId] {
        &self.relationship_ids
    }

    pub fn contains(&self, card_type: &str) -> bool {
        self.level_of(card_type).is_some()
    }

    pub fn level_of(&self, card_type: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|l| l.eq_ignore_ascii_case(card_type.trim()))
    }

    /// Whether cards of `child` may sit (at any depth) below cards of
    /// `parent`.
    pub fn type_contains(&self, parent: &str, child: &str) -> bool {
        match (self.level_of(parent), self.level_of(child)) {
            (Some(p), Some(c)) => p < c,
            _ => false,
        }
    }

    /// Whether a card of `parent` may be the direct parent of a card of
    /// `child`: the parent level sits right above the child level.
    pub fn is_parent_level(&self, parent: &str, child: &str) -> bool {
        match (self.level_of(parent), self.level_of(child)) {
            (Some(p), Some(c)) => p + 1 == c,
            _ => false,
        }
    }

    /// Card types strictly below `card_type`, top to bottom.
    pub fn types_below(&self, card_type: &str) -> Vec<String> {
        match self.level_of(card_type) {
            Some(level) => self.levels[level + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Relationship storing ancestors of the given type.
    pub fn relationship_id_for(&self, card_type: &str) -> Option<PropertyId> {
        self.level_of(card_type)
            .and_then(|level| self.relationship_ids.get(level).copied())
    }

    pub fn relationships<'p>(&'p self, project: &'p Project) -> RelationshipsMap<'p> {
        RelationshipsMap::new(project, self)
    }

    /// Structural problems with this configuration against the project.
    pub fn validate(&self, project: &Project) -> Vec<String> {
        let mut errors = Vec::new();
        if self.levels.len() < 2 {
            errors.push(format!(
                "Tree {} must have at least two card types.",
                self.name
            ));
        }
        for (i, level) in self.levels.iter().enumerate() {
            if project.card_type(level).is_none() {
                errors.push(format!("Tree {} uses unknown card type {}.", self.name, level));
            }
            if self.levels[..i].iter().any(|l| l.eq_ignore_ascii_case(level)) {
                errors.push(format!(
                    "Card type {} appears more than once in tree {}.",
                    level, self.name
                ));
            }
        }
        if self.relationship_ids.len() + 1 != self.levels.len() {
            errors.push(format!(
                "Tree {} must have one relationship property per non-leaf level.",
                self.name
            ));
        }
        for (i, id) in self.relationship_ids.iter().enumerate() {
            match project.property(*id).map(|p| (&p.name, &p.kind)) {
                Some((_, PropertyKind::TreeRelationship { tree_id, valid_card_type }))
                    if *tree_id == self.id
                        && self
                            .levels
                            .get(i)
                            .is_some_and(|l| l.eq_ignore_ascii_case(valid_card_type)) => {}
                Some((name, _)) => errors.push(format!(
                    "Relationship {} does not point at level {} of tree {}.",
                    name,
                    i + 1,
                    self.name
                )),
                None => errors.push(format!(
                    "Tree {} is missing the relationship for level {}.",
                    self.name,
                    i + 1
                )),
            }
        }
        errors
    }
}

/// Name given to the relationship property of a tree level.
pub fn relationship_name(tree: &str, card_type: &str) -> String {
    format!("{} - {}", tree, card_type)
}

impl Project {
    /// Create a tree over `levels` (root first) together with its
    /// relationship properties.
    pub fn create_tree(&mut self, name: &str, levels: &[&str]) -> Result<TreeId, DomainError> {
        let name = name.trim();
        let mut errors = Vec::new();
        if name.is_empty() {
            errors.push("Tree name can't be blank.".to_string());
        }
        if self.tree(name).is_some() {
            errors.push(format!("Tree {} already exists.", name));
        }
        if levels.len() < 2 {
            errors.push("A tree must have at least two card types.".to_string());
        }
        let mut resolved: Vec<String> = Vec::new();
        for level in levels {
            match self.card_type(level) {
                Some(card_type) if resolved.contains(&card_type.name) => errors.push(format!(
                    "Card type {} appears more than once in the tree.",
                    card_type.name
                )),
                Some(card_type) => resolved.push(card_type.name.clone()),
                None => errors.push(format!("Card type {} does not exist.", level)),
            }
        }
        if !errors.is_empty() {
            return Err(DomainError::Validation(errors));
        }

        let tree_id = self.allocate_id();
        let mut relationship_ids = Vec::new();
        for (i, level) in resolved[..resolved.len() - 1].iter().enumerate() {
            let below: Vec<&str> = resolved[i + 1..].iter().map(String::as_str).collect();
            let id = self.insert_property(
                &relationship_name(name, level),
                PropertyKind::TreeRelationship {
                    tree_id,
                    valid_card_type: level.clone(),
                },
                &below,
            )?;
            relationship_ids.push(id);
        }
        self.trees.push(TreeConfiguration {
            id: tree_id,
            name: name.to_string(),
            description: None,
            levels: resolved,
            relationship_ids,
        });
        info!(tree = name, "Created tree configuration");
        Ok(tree_id)
    }
}
