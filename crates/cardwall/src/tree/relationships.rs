//! Per-tree view over relationship properties.

use crate::domain::{Card, CardId, Project, PropertyDefinition, PropertyKind};

use super::TreeConfiguration;

/// The ordered relationship properties of one tree, root level first.
#[derive(Debug, Clone)]
pub struct RelationshipsMap<'p> {
    tree: &'p TreeConfiguration,
    relationships: Vec<&'p PropertyDefinition>,
}

impl<'p> RelationshipsMap<'p> {
    pub fn new(project: &'p Project, tree: &'p TreeConfiguration) -> Self {
        let relationships = tree
            .relationship_ids()
            .iter()
            .filter_map(|id| project.property(*id))
            .collect();
        RelationshipsMap {
            tree,
            relationships,
        }
    }

    pub fn tree(&self) -> &'p TreeConfiguration {
        self.tree
    }

    pub fn all(&self) -> &[&'p PropertyDefinition] {
        &self.relationships
    }

    /// Relationship whose values point at cards of `card_type`.
    pub fn relationship_for(&self, card_type: &str) -> Option<&'p PropertyDefinition> {
        self.relationships.iter().copied().find(|r| match &r.kind {
            PropertyKind::TreeRelationship {
                valid_card_type, ..
            } => valid_card_type.eq_ignore_ascii_case(card_type),
            _ => false,
        })
    }

    /// Relationship linking cards of `card_type` to the level directly above.
    pub fn relationship_before(&self, card_type: &str) -> Option<&'p PropertyDefinition> {
        let level = self.tree.level_of(card_type)?;
        level
            .checked_sub(1)
            .and_then(|above| self.relationships.get(above).copied())
    }

    /// Relationship linking the level directly below `card_type` to it.
    pub fn relationship_after(&self, card_type: &str) -> Option<&'p PropertyDefinition> {
        self.relationship_for(card_type)
    }

    /// Relationships a card of `card_type` may carry, root level first.
    pub fn relationships_above(&self, card_type: &str) -> Vec<&'p PropertyDefinition> {
        match self.tree.level_of(card_type) {
            Some(level) => self.relationships[..level.min(self.relationships.len())].to_vec(),
            None => Vec::new(),
        }
    }

    /// Ancestor ids of a card, nearest first.
    pub fn parent_card_ids_of(&self, card: &Card) -> Vec<CardId> {
        self.relationships_above(&card.card_type_name)
            .iter()
            .rev()
            .filter_map(|r| card.related_card_id(r))
            .collect()
    }

    /// Nearest ancestor of a card, if any.
    pub fn parent_of(&self, card: &Card) -> Option<CardId> {
        self.parent_card_ids_of(card).into_iter().next()
    }

    /// Check that a card's relationship values form one consistent chain:
    /// every referenced ancestor has the expected type and carries the same
    /// higher-level values as the card itself.
    pub fn validate_chain<F>(&self, card: &Card, load: F) -> Vec<String>
    where
        F: Fn(CardId) -> Option<Card>,
    {
        let mut errors = Vec::new();
        let above = self.relationships_above(&card.card_type_name);
        for (level, relationship) in above.iter().enumerate() {
            let Some(parent_id) = card.related_card_id(relationship) else {
                continue;
            };
            let Some(parent) = load(parent_id) else {
                errors.push(format!(
                    "{} points at card {} which does not exist.",
                    relationship.name, parent_id
                ));
                continue;
            };
            if self.tree.level_of(&parent.card_type_name) != Some(level) {
                errors.push(format!(
                    "{} of card #{} points at #{} of type {}.",
                    relationship.name, card.number, parent.number, parent.card_type_name
                ));
                continue;
            }
            for higher in &above[..level] {
                if card.related_card_id(higher) != parent.related_card_id(higher) {
                    errors.push(format!(
                        "Card #{} and its parent #{} disagree on {}.",
                        card.number, parent.number, higher.name
                    ));
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn setup() -> Project {
        let mut project = Project::new("agile", "Agile");
        for t in ["Release", "Iteration", "Story"] {
            project.create_card_type(t).unwrap();
        }
        project
            .create_tree("Planning", &["Release", "Iteration", "Story"])
            .unwrap();
        project
    }

    fn card(id: CardId, card_type: &str, values: &[(&str, CardId)]) -> Card {
        Card {
            id,
            number: id,
            name: format!("Card {}", id),
            description: None,
            card_type_name: card_type.to_string(),
            version: 1,
            values: values
                .iter()
                .map(|(c, v)| (c.to_string(), Some(v.to_string())))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_relationship_lookup() {
        let project = setup();
        let map = project.tree("Planning").unwrap().relationships(&project);
        assert_eq!(
            map.relationship_for("Release").unwrap().name,
            "Planning - Release"
        );
        assert_eq!(
            map.relationship_before("Story").unwrap().name,
            "Planning - Iteration"
        );
        assert!(map.relationship_before("Release").is_none());
        assert!(map.relationship_after("Story").is_none());
        assert_eq!(map.relationships_above("Story").len(), 2);
    }

    #[test]
    fn test_parent_card_ids_nearest_first() {
        let project = setup();
        let map = project.tree("Planning").unwrap().relationships(&project);
        let story = card(
            3,
            "Story",
            &[
                ("cp_planning_release", 1),
                ("cp_planning_iteration", 2),
            ],
        );
        assert_eq!(map.parent_card_ids_of(&story), vec![2, 1]);
        assert_eq!(map.parent_of(&story), Some(2));

        let skipped = card(4, "Story", &[("cp_planning_release", 1)]);
        assert_eq!(map.parent_card_ids_of(&skipped), vec![1]);
    }

    #[test]
    fn test_validate_chain_detects_disagreement() {
        let project = setup();
        let map = project.tree("Planning").unwrap().relationships(&project);
        let cards: BTreeMap<CardId, Card> = [
            card(1, "Release", &[]),
            card(5, "Release", &[]),
            card(2, "Iteration", &[("cp_planning_release", 1)]),
        ]
        .into_iter()
        .map(|c| (c.id, c))
        .collect();

        let good = card(3, "Story", &[("cp_planning_release", 1), ("cp_planning_iteration", 2)]);
        assert!(map.validate_chain(&good, |id| cards.get(&id).cloned()).is_empty());

        let bad = card(4, "Story", &[("cp_planning_release", 5), ("cp_planning_iteration", 2)]);
        let errors = map.validate_chain(&bad, |id| cards.get(&id).cloned());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("disagree on Planning - Release"));
    }
}
