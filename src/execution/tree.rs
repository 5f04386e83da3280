//! Execution tree for one process instance
//!
//! Nodes live in an arena keyed by [`ExecutionId`]. Each node stores its
//! parent's id and an ordered list of child ids; removing a node detaches it
//! from its parent's child index and drops its whole subtree. The tree is
//! persisted as a single versioned document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::errors::{EngineError, Result};

/// Stable identifier of a node within one execution tree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec-{}", self.0)
    }
}

/// A compact variable value. Only what the loop bookkeeping and simple
/// mappings need; expression values are out of scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

/// One position of control flow in a process instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub id: ExecutionId,
    pub parent: Option<ExecutionId>,
    pub children: Vec<ExecutionId>,
    /// Activity the node is positioned at
    pub activity_id: Option<String>,
    /// Correlates the node with a user-visible activity instance
    pub activity_instance_id: Option<String>,
    pub is_active: bool,
    /// Fan-out branch node
    pub is_concurrent: bool,
    /// Owns its own variable scope
    pub is_scope: bool,
    pub variables: BTreeMap<String, Value>,
    pub event_subscriptions: Vec<String>,
}

/// A node removed from the tree inside the current command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemovedExecution {
    pub id: ExecutionId,
    pub reason: String,
}

/// Outgoing flows taken by a join, waiting to be consumed by the engine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    /// Scope node that continues after the join
    pub scope: ExecutionId,
    pub activity_id: String,
    pub transitions: Vec<String>,
    /// Branch nodes consumed by the join
    pub joined: Vec<ExecutionId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionTree {
    process_instance_id: String,
    root: ExecutionId,
    nodes: BTreeMap<ExecutionId, ExecutionNode>,
    next_id: u64,
    continuations: Vec<Continuation>,
    /// Storage version; assigned by the storage layer on commit
    pub(crate) version: u64,
    #[serde(skip)]
    removed: Vec<RemovedExecution>,
    #[serde(skip)]
    modified: bool,
}

impl ExecutionTree {
    /// Create a tree holding only the process instance's root node
    pub fn new(process_instance_id: impl Into<String>) -> Self {
        let process_instance_id = process_instance_id.into();
        let root = ExecutionId(0);
        let mut nodes = BTreeMap::new();
        nodes.insert(
            root,
            ExecutionNode {
                id: root,
                parent: None,
                children: Vec::new(),
                activity_id: None,
                activity_instance_id: Some(process_instance_id.clone()),
                is_active: true,
                is_concurrent: false,
                is_scope: true,
                variables: BTreeMap::new(),
                event_subscriptions: Vec::new(),
            },
        );
        Self {
            process_instance_id,
            root,
            nodes,
            next_id: 1,
            continuations: Vec::new(),
            version: 0,
            removed: Vec::new(),
            modified: true,
        }
    }

    pub fn process_instance_id(&self) -> &str {
        &self.process_instance_id
    }

    pub fn root(&self) -> ExecutionId {
        self.root
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: ExecutionId) -> Option<&ExecutionNode> {
        self.nodes.get(&id)
    }

    pub fn node(&self, id: ExecutionId) -> Result<&ExecutionNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| EngineError::execution_not_found(id))
    }

    pub fn node_mut(&mut self, id: ExecutionId) -> Result<&mut ExecutionNode> {
        self.modified = true;
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| EngineError::execution_not_found(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ExecutionNode> {
        self.nodes.values()
    }

    pub fn parent(&self, id: ExecutionId) -> Option<ExecutionId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: ExecutionId) -> &[ExecutionId] {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// True when the node exists and is active
    pub fn is_active(&self, id: ExecutionId) -> bool {
        self.nodes.get(&id).map(|n| n.is_active).unwrap_or(false)
    }

    /// Create a child under `parent`.
    ///
    /// The child starts active, non-concurrent and non-scope, positioned at the
    /// parent's activity and sharing the parent's activity instance id until it
    /// enters the activity on its own.
    pub fn create_child(&mut self, parent: ExecutionId) -> Result<ExecutionId> {
        let (activity_id, activity_instance_id) = {
            let p = self.node(parent)?;
            (p.activity_id.clone(), p.activity_instance_id.clone())
        };
        let id = ExecutionId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            ExecutionNode {
                id,
                parent: Some(parent),
                children: Vec::new(),
                activity_id,
                activity_instance_id,
                is_active: true,
                is_concurrent: false,
                is_scope: false,
                variables: BTreeMap::new(),
                event_subscriptions: Vec::new(),
            },
        );
        self.node_mut(parent)?.children.push(id);
        Ok(id)
    }

    /// Activity instance id of the node's parent; the process instance id for the root.
    pub fn parent_activity_instance_id(&self, id: ExecutionId) -> Result<Option<String>> {
        match self.node(id)?.parent {
            Some(parent) => Ok(self.node(parent)?.activity_instance_id.clone()),
            None => Ok(Some(self.process_instance_id.clone())),
        }
    }

    pub fn set_variable_local(
        &mut self,
        id: ExecutionId,
        name: impl Into<String>,
        value: Value,
    ) -> Result<()> {
        self.node_mut(id)?.variables.insert(name.into(), value);
        Ok(())
    }

    pub fn variable_local(&self, id: ExecutionId, name: &str) -> Option<&Value> {
        self.nodes.get(&id).and_then(|n| n.variables.get(name))
    }

    /// Look the variable up on the node, then on each ancestor in turn.
    pub fn variable(&self, id: ExecutionId, name: &str) -> Option<&Value> {
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.nodes.get(&node_id)?;
            if let Some(value) = node.variables.get(name) {
                return Some(value);
            }
            current = node.parent;
        }
        None
    }

    pub fn inactivate(&mut self, id: ExecutionId) -> Result<()> {
        self.node_mut(id)?.is_active = false;
        Ok(())
    }

    /// Mark the tree for re-persisting even if no node field changed.
    pub fn force_update(&mut self, id: ExecutionId) -> Result<()> {
        self.node(id)?;
        self.modified = true;
        Ok(())
    }

    pub fn remove_event_subscriptions(&mut self, id: ExecutionId) -> Result<Vec<String>> {
        Ok(std::mem::take(&mut self.node_mut(id)?.event_subscriptions))
    }

    /// Remove a node together with its subtree.
    pub fn remove(&mut self, id: ExecutionId) -> Result<()> {
        self.remove_subtree(id, "removed")
    }

    /// Remove a node together with its subtree, recording why.
    pub fn delete_cascade(&mut self, id: ExecutionId, reason: &str) -> Result<()> {
        self.remove_subtree(id, reason)
    }

    fn remove_subtree(&mut self, id: ExecutionId, reason: &str) -> Result<()> {
        if id == self.root {
            return Err(EngineError::structure(
                "the process instance root cannot be removed",
            ));
        }
        let parent = self.node(id)?.parent;
        if let Some(parent) = parent {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.retain(|c| *c != id);
            }
        }

        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children.iter().copied());
                self.removed.push(RemovedExecution {
                    id: current,
                    reason: reason.to_string(),
                });
            }
        }
        self.modified = true;
        Ok(())
    }

    /// Inactive concurrent siblings of `id` (including itself) positioned at `activity_id`.
    pub fn inactive_concurrent_siblings(
        &self,
        id: ExecutionId,
        activity_id: &str,
    ) -> Result<Vec<ExecutionId>> {
        let node = self.node(id)?;
        if !node.is_concurrent {
            return Ok(if node.is_active { Vec::new() } else { vec![id] });
        }
        let parent = node
            .parent
            .ok_or_else(|| EngineError::structure(format!("concurrent {id} has no parent")))?;
        Ok(self
            .children(parent)
            .iter()
            .filter_map(|child| self.nodes.get(child))
            .filter(|child| {
                child.is_concurrent
                    && !child.is_active
                    && child.activity_id.as_deref() == Some(activity_id)
            })
            .map(|child| child.id)
            .collect())
    }

    pub fn push_continuation(&mut self, continuation: Continuation) {
        self.modified = true;
        self.continuations.push(continuation);
    }

    /// Joins that have fired and not yet been consumed
    pub fn continuations(&self) -> &[Continuation] {
        &self.continuations
    }

    pub fn take_continuations(&mut self) -> Vec<Continuation> {
        if !self.continuations.is_empty() {
            self.modified = true;
        }
        std::mem::take(&mut self.continuations)
    }

    pub fn removed(&self) -> &[RemovedExecution] {
        &self.removed
    }

    pub(crate) fn drain_removed(&mut self) -> Vec<RemovedExecution> {
        std::mem::take(&mut self.removed)
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn mark_clean(&mut self) {
        self.modified = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_child_inherits_position() {
        let mut tree = ExecutionTree::new("pi-1");
        let root = tree.root();
        tree.node_mut(root).unwrap().activity_id = Some("task".to_string());

        let child = tree.create_child(root).unwrap();
        let node = tree.node(child).unwrap();
        assert_eq!(node.parent, Some(root));
        assert_eq!(node.activity_id.as_deref(), Some("task"));
        assert_eq!(node.activity_instance_id.as_deref(), Some("pi-1"));
        assert!(node.is_active);
        assert_eq!(tree.children(root), &[child]);
    }

    #[test]
    fn test_variable_lookup_walks_up() {
        let mut tree = ExecutionTree::new("pi-1");
        let root = tree.root();
        let child = tree.create_child(root).unwrap();
        let grandchild = tree.create_child(child).unwrap();

        tree.set_variable_local(root, "numberOfInstances", Value::Int(3))
            .unwrap();
        tree.set_variable_local(grandchild, "loopCounter", Value::Int(1))
            .unwrap();

        assert_eq!(
            tree.variable(grandchild, "numberOfInstances"),
            Some(&Value::Int(3))
        );
        assert_eq!(tree.variable(child, "loopCounter"), None);
        assert_eq!(tree.variable_local(grandchild, "numberOfInstances"), None);
    }

    #[test]
    fn test_delete_cascade_detaches_subtree() {
        let mut tree = ExecutionTree::new("pi-1");
        let root = tree.root();
        let a = tree.create_child(root).unwrap();
        let b = tree.create_child(root).unwrap();
        let nested = tree.create_child(a).unwrap();

        tree.delete_cascade(a, "multi-instance completed").unwrap();

        assert!(!tree.contains(a));
        assert!(!tree.contains(nested));
        assert_eq!(tree.children(root), &[b]);
        let removed: Vec<_> = tree.removed().iter().map(|r| r.id).collect();
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&a) && removed.contains(&nested));
        assert!(tree
            .removed()
            .iter()
            .all(|r| r.reason == "multi-instance completed"));
    }

    #[test]
    fn test_root_cannot_be_removed() {
        let mut tree = ExecutionTree::new("pi-1");
        let root = tree.root();
        assert!(matches!(
            tree.remove(root),
            Err(EngineError::Structure { .. })
        ));
    }

    #[test]
    fn test_inactive_concurrent_siblings() {
        let mut tree = ExecutionTree::new("pi-1");
        let root = tree.root();
        tree.node_mut(root).unwrap().activity_id = Some("task".to_string());
        let mut branches = Vec::new();
        for _ in 0..3 {
            let id = tree.create_child(root).unwrap();
            tree.node_mut(id).unwrap().is_concurrent = true;
            branches.push(id);
        }
        tree.inactivate(branches[0]).unwrap();
        tree.inactivate(branches[2]).unwrap();

        let joined = tree.inactive_concurrent_siblings(branches[2], "task").unwrap();
        assert_eq!(joined, vec![branches[0], branches[2]]);
        assert!(tree
            .inactive_concurrent_siblings(branches[2], "other")
            .unwrap()
            .is_empty());
    }
}
