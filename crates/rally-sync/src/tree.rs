//! Parent/child reconciliation for threaded replies.
//!
//! Nodes live in an id-keyed arena and refer to each other by id. A full
//! [`build`](ReplyTree::build) tolerates any delivery order; incremental
//! [`insert`](ReplyTree::insert) only attaches nodes whose parent is already
//! known and otherwise asks the caller to refetch and rebuild.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::Entity;

#[derive(Debug, Clone)]
struct TreeNode {
    entity: Entity,
    parent_id: Option<String>,
    children: Vec<String>,
}

/// Rendered subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyNode {
    pub entity: Entity,
    pub children: Vec<ReplyNode>,
}

impl ReplyNode {
    /// Number of nodes in this subtree, itself included.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(ReplyNode::size).sum::<usize>()
    }
}

/// Result of [`ReplyTree::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Attached { parent_id: String },
    Root,
    /// Parent not in the tree. Nothing was inserted.
    NeedsRebuild { parent_id: String },
    /// Known id; payload replaced in place.
    Replaced,
}

#[derive(Debug, Clone, Default)]
pub struct ReplyTree {
    nodes: HashMap<String, TreeNode>,
    roots: Vec<String>,
}

impl ReplyTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a flat list. Nodes whose parent is absent (or that sit on a
    /// parent cycle) become roots. Children keep the list's relative order.
    pub fn build(flat: impl IntoIterator<Item = Entity>) -> Self {
        let mut tree = Self::new();
        let mut order = Vec::new();

        for entity in flat {
            let id = entity.id().to_string();
            let parent_id = entity.parent_id();
            if tree.nodes.contains_key(&id) {
                // Duplicate id: keep the first position, latest payload.
                if let Some(node) = tree.nodes.get_mut(&id) {
                    node.entity = entity;
                }
                continue;
            }
            order.push(id.clone());
            tree.nodes.insert(
                id,
                TreeNode {
                    entity,
                    parent_id,
                    children: Vec::new(),
                },
            );
        }

        for id in &order {
            let parent = tree.nodes.get(id).and_then(|n| n.parent_id.clone());
            match parent {
                Some(parent_id)
                    if tree.nodes.contains_key(&parent_id) && !tree.on_cycle(id) =>
                {
                    if let Some(parent) = tree.nodes.get_mut(&parent_id) {
                        parent.children.push(id.clone());
                    }
                }
                Some(parent_id) => {
                    trace!(id = %id, parent_id = %parent_id, "orphan reply becomes root");
                    tree.roots.push(id.clone());
                }
                None => tree.roots.push(id.clone()),
            }
        }

        debug!(nodes = tree.nodes.len(), roots = tree.roots.len(), "reply tree built");
        tree
    }

    /// Whether following parent links from `id` leads back to `id`. A walk
    /// that enters a cycle not containing `id` is not one.
    fn on_cycle(&self, id: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = self.nodes.get(id).and_then(|n| n.parent_id.as_deref());
        while let Some(parent) = current {
            if parent == id {
                return true;
            }
            if !seen.insert(parent) {
                return false;
            }
            current = self.nodes.get(parent).and_then(|n| n.parent_id.as_deref());
        }
        false
    }

    /// Attach a newly arrived node.
    pub fn insert(&mut self, entity: Entity) -> InsertOutcome {
        self.attach(entity, None)
    }

    /// Attach a node at `index` among its siblings, or last if `index` is
    /// past the end.
    pub fn insert_at(&mut self, entity: Entity, index: usize) -> InsertOutcome {
        self.attach(entity, Some(index))
    }

    fn attach(&mut self, entity: Entity, index: Option<usize>) -> InsertOutcome {
        let id = entity.id().to_string();
        if let Some(node) = self.nodes.get_mut(&id) {
            node.entity = entity;
            return InsertOutcome::Replaced;
        }

        let parent_id = entity.parent_id();
        let outcome = match &parent_id {
            None => {
                place(&mut self.roots, id.clone(), index);
                InsertOutcome::Root
            }
            Some(parent_id) => match self.nodes.get_mut(parent_id) {
                Some(parent) => {
                    place(&mut parent.children, id.clone(), index);
                    InsertOutcome::Attached {
                        parent_id: parent_id.clone(),
                    }
                }
                None => {
                    debug!(id = %id, parent_id = %parent_id, "reply parent unknown, rebuild needed");
                    return InsertOutcome::NeedsRebuild {
                        parent_id: parent_id.clone(),
                    };
                }
            },
        };

        self.nodes.insert(
            id,
            TreeNode {
                entity,
                parent_id,
                children: Vec::new(),
            },
        );
        outcome
    }

    /// Remove a node and all of its descendants. Returns the removed ids,
    /// the node itself first. Unknown ids remove nothing.
    pub fn remove(&mut self, id: &str) -> Vec<String> {
        let Some(node) = self.nodes.get(id) else {
            return Vec::new();
        };

        let parent_id = node.parent_id.clone();
        if let Some(parent) = parent_id.as_deref().and_then(|p| self.nodes.get_mut(p)) {
            parent.children.retain(|child| child != id);
        }
        self.roots.retain(|root| root != id);

        let mut removed = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children.into_iter().rev());
                removed.push(current);
            }
        }
        debug!(id = %id, removed = removed.len(), "reply subtree removed");
        removed
    }

    /// Move the node at `old_id` to `entity`'s id, keeping its position and
    /// children. Returns false if `old_id` is unknown.
    pub fn replace(&mut self, old_id: &str, entity: Entity) -> bool {
        let new_id = entity.id().to_string();
        if old_id == new_id {
            return self.insert(entity) == InsertOutcome::Replaced;
        }
        let Some(mut node) = self.nodes.remove(old_id) else {
            return false;
        };
        // The confirmed row may already have arrived through the change feed.
        if self.nodes.contains_key(&new_id) {
            self.nodes.insert(old_id.to_string(), node);
            self.remove(old_id);
            self.insert(entity);
            return true;
        }

        node.entity = entity;
        for child in &node.children {
            if let Some(child) = self.nodes.get_mut(child) {
                child.parent_id = Some(new_id.clone());
            }
        }
        let siblings = match node.parent_id.as_deref().and_then(|p| self.nodes.get_mut(p)) {
            Some(parent) => &mut parent.children,
            None => &mut self.roots,
        };
        for sibling in siblings.iter_mut() {
            if sibling == old_id {
                *sibling = new_id.clone();
            }
        }
        self.nodes.insert(new_id, node);
        true
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.nodes.get(id).map(|n| &n.entity)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root_ids(&self) -> &[String] {
        &self.roots
    }

    /// Position of `id` among its parent's children, or among the roots.
    pub fn sibling_index(&self, id: &str) -> Option<usize> {
        let node = self.nodes.get(id)?;
        let siblings = match node.parent_id.as_deref().and_then(|p| self.nodes.get(p)) {
            Some(parent) => &parent.children,
            None => &self.roots,
        };
        siblings.iter().position(|sibling| sibling == id)
    }

    pub fn children_of(&self, id: &str) -> &[String] {
        self.nodes.get(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Render the whole tree, roots and children in insertion order.
    pub fn nested(&self) -> Vec<ReplyNode> {
        self.roots.iter().filter_map(|id| self.render(id)).collect()
    }

    fn render(&self, id: &str) -> Option<ReplyNode> {
        let node = self.nodes.get(id)?;
        Some(ReplyNode {
            entity: node.entity.clone(),
            children: node.children.iter().filter_map(|c| self.render(c)).collect(),
        })
    }
}

fn place(siblings: &mut Vec<String>, id: String, index: Option<usize>) {
    match index {
        Some(index) if index < siblings.len() => siblings.insert(index, id),
        _ => siblings.push(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn reply(id: &str, parent: Option<&str>) -> Entity {
        Entity::from_row(row(json!({"id": id, "parent_id": parent, "content": id}))).unwrap()
    }

    /// `id(child, child)` rendering for compact assertions.
    fn shape(nodes: &[ReplyNode]) -> String {
        nodes
            .iter()
            .map(|n| {
                if n.children.is_empty() {
                    n.entity.id().to_string()
                } else {
                    format!("{}({})", n.entity.id(), shape(&n.children))
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    #[test]
    fn test_build_in_delivery_order() {
        let tree = ReplyTree::build(vec![
            reply("A", None),
            reply("B", Some("A")),
            reply("C", Some("B")),
        ]);
        assert_eq!(shape(&tree.nested()), "A(B(C))");
    }

    #[test]
    fn test_build_in_reverse_order() {
        let tree = ReplyTree::build(vec![
            reply("C", Some("B")),
            reply("B", Some("A")),
            reply("A", None),
        ]);
        assert_eq!(shape(&tree.nested()), "A(B(C))");
    }

    #[test]
    fn test_incremental_insert_in_reverse_order_needs_rebuild() {
        let mut tree = ReplyTree::new();
        assert_eq!(
            tree.insert(reply("C", Some("B"))),
            InsertOutcome::NeedsRebuild {
                parent_id: "B".into()
            }
        );
        assert_eq!(
            tree.insert(reply("B", Some("A"))),
            InsertOutcome::NeedsRebuild {
                parent_id: "A".into()
            }
        );
        assert_eq!(tree.insert(reply("A", None)), InsertOutcome::Root);
        assert_eq!(tree.len(), 1);

        let rebuilt = ReplyTree::build(vec![
            reply("C", Some("B")),
            reply("B", Some("A")),
            reply("A", None),
        ]);
        assert_eq!(shape(&rebuilt.nested()), "A(B(C))");
    }

    #[test]
    fn test_incremental_insert_in_order() {
        let mut tree = ReplyTree::new();
        assert_eq!(tree.insert(reply("A", None)), InsertOutcome::Root);
        assert_eq!(
            tree.insert(reply("B", Some("A"))),
            InsertOutcome::Attached {
                parent_id: "A".into()
            }
        );
        assert_eq!(
            tree.insert(reply("C", Some("A"))),
            InsertOutcome::Attached {
                parent_id: "A".into()
            }
        );
        assert_eq!(tree.insert(reply("B", Some("A"))), InsertOutcome::Replaced);
        assert_eq!(shape(&tree.nested()), "A(B, C)");
    }

    #[test]
    fn test_orphans_become_roots() {
        let tree = ReplyTree::build(vec![
            reply("A", None),
            reply("X", Some("missing")),
            reply("Y", Some("X")),
        ]);
        assert_eq!(shape(&tree.nested()), "A, X(Y)");
    }

    #[test]
    fn test_parent_cycle_does_not_lose_nodes() {
        let tree = ReplyTree::build(vec![reply("P", Some("Q")), reply("Q", Some("P"))]);
        let nested = tree.nested();
        assert_eq!(nested.iter().map(ReplyNode::size).sum::<usize>(), 2);
    }

    #[test]
    fn test_node_under_a_cycle_attaches_to_its_parent() {
        let tree = ReplyTree::build(vec![
            reply("P", Some("Q")),
            reply("Q", Some("P")),
            reply("R", Some("P")),
        ]);
        assert_eq!(shape(&tree.nested()), "P(R), Q");
        assert_eq!(tree.root_ids(), ["P", "Q"]);
    }

    #[test]
    fn test_insert_at_restores_sibling_position() {
        let mut tree = ReplyTree::build(vec![
            reply("A", None),
            reply("B", Some("A")),
            reply("C", Some("B")),
            reply("D", Some("A")),
            reply("E", None),
        ]);
        assert_eq!(tree.sibling_index("B"), Some(0));
        assert_eq!(tree.sibling_index("D"), Some(1));
        assert_eq!(tree.sibling_index("E"), Some(1));
        assert_eq!(tree.sibling_index("missing"), None);

        tree.remove("B");
        assert_eq!(
            tree.insert_at(reply("B", Some("A")), 0),
            InsertOutcome::Attached {
                parent_id: "A".into()
            }
        );
        tree.insert(reply("C", Some("B")));
        assert_eq!(shape(&tree.nested()), "A(B(C), D), E");

        tree.remove("A");
        assert_eq!(tree.insert_at(reply("A", None), 9), InsertOutcome::Root);
        assert_eq!(shape(&tree.nested()), "E, A");
    }

    #[test]
    fn test_remove_cascades() {
        let mut tree = ReplyTree::build(vec![
            reply("A", None),
            reply("B", Some("A")),
            reply("C", Some("B")),
            reply("D", Some("A")),
            reply("E", None),
        ]);

        let mut removed = tree.remove("B");
        removed.sort();
        assert_eq!(removed, ["B", "C"]);
        assert_eq!(shape(&tree.nested()), "A(D), E");
        assert!(tree.remove("B").is_empty());

        assert_eq!(tree.remove("A"), ["A", "D"]);
        assert_eq!(shape(&tree.nested()), "E");
    }

    #[test]
    fn test_replace_moves_id_and_keeps_children() {
        let mut tree = ReplyTree::new();
        tree.insert(reply("A", None));
        tree.insert(reply("temp-1", Some("A")));
        tree.insert(reply("Z", Some("A")));
        tree.insert(reply("child", Some("temp-1")));

        assert!(tree.replace("temp-1", reply("B", Some("A"))));
        assert_eq!(shape(&tree.nested()), "A(B(child), Z)");
        assert!(!tree.contains("temp-1"));
        assert!(!tree.replace("temp-1", reply("B", Some("A"))));

        tree.remove("B");
        assert_eq!(shape(&tree.nested()), "A(Z)");
    }
}
