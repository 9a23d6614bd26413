use std::collections::{HashMap, HashSet, VecDeque};

use arbor_storage::{ConversationId, NodeId, NodeRecord, creation_order};

use crate::error::{CoreResult, CorruptTreeSnafu, NotFoundSnafu};

/// Structural defect found by [`TreeIndex::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeViolation {
    MultipleRoots {
        root_ids: Vec<NodeId>,
    },
    DanglingParent {
        node_id: NodeId,
        parent_id: NodeId,
    },
    /// Node cannot reach any root by following parents.
    Cycle {
        node_id: NodeId,
    },
    DepthMismatch {
        node_id: NodeId,
        expected: u32,
        actual: u32,
    },
    RootIdMismatch {
        node_id: NodeId,
        expected: NodeId,
        actual: NodeId,
    },
    ForeignScope {
        node_id: NodeId,
        conversation_id: ConversationId,
    },
}

/// In-memory view of one conversation's nodes.
///
/// Children lists are keyed by parent id even when that parent is missing, so dangling
/// references stay discoverable. Every list is kept in `(created_at_ms, id)` order.
#[derive(Debug, Clone)]
pub struct TreeIndex {
    scope: ConversationId,
    nodes: HashMap<NodeId, NodeRecord>,
    children: HashMap<NodeId, Vec<NodeId>>,
    roots: Vec<NodeId>,
}

impl TreeIndex {
    pub fn empty(scope: ConversationId) -> Self {
        Self {
            scope,
            nodes: HashMap::new(),
            children: HashMap::new(),
            roots: Vec::new(),
        }
    }

    pub fn from_nodes(scope: ConversationId, nodes: impl IntoIterator<Item = NodeRecord>) -> Self {
        let mut index = Self::empty(scope);
        for node in nodes {
            index.upsert(node);
        }
        index
    }

    pub fn scope(&self) -> ConversationId {
        self.scope
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    pub fn get(&self, node_id: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(&node_id)
    }

    pub fn require(&self, node_id: NodeId, stage: &'static str) -> CoreResult<&NodeRecord> {
        self.nodes.get(&node_id).ok_or_else(|| {
            NotFoundSnafu {
                stage,
                entity: "node",
                id: node_id.to_string(),
            }
            .build()
        })
    }

    /// All nodes in creation order.
    pub fn nodes(&self) -> Vec<&NodeRecord> {
        let mut nodes = self.nodes.values().collect::<Vec<_>>();
        nodes.sort_by(|left, right| creation_order(left, right));
        nodes
    }

    pub fn roots(&self) -> Vec<&NodeRecord> {
        self.resolve(&self.roots)
    }

    /// Earliest rootless node of the scope.
    pub fn root(&self) -> Option<&NodeRecord> {
        self.roots.first().and_then(|root_id| self.nodes.get(root_id))
    }

    pub fn is_root(&self, node_id: NodeId) -> bool {
        self.nodes.get(&node_id).is_some_and(NodeRecord::is_root)
    }

    pub fn parent_of(&self, node_id: NodeId) -> Option<&NodeRecord> {
        self.nodes
            .get(&node_id)
            .and_then(|node| node.parent_id)
            .and_then(|parent_id| self.nodes.get(&parent_id))
    }

    pub fn children_of(&self, node_id: NodeId) -> Vec<&NodeRecord> {
        self.children
            .get(&node_id)
            .map(|children| self.resolve(children))
            .unwrap_or_default()
    }

    /// Nodes sharing `node_id`'s parent, itself included.
    pub fn siblings_of(&self, node_id: NodeId) -> CoreResult<Vec<&NodeRecord>> {
        let node = self.require(node_id, "tree-siblings-lookup")?;
        Ok(match node.parent_id {
            Some(parent_id) => self.children_of(parent_id),
            None => self.roots(),
        })
    }

    /// Descendants of `node_id` in breadth-first order, excluding the node itself.
    pub fn descendants_ordered(&self, node_id: NodeId) -> CoreResult<Vec<NodeId>> {
        self.require(node_id, "tree-descendants-lookup")?;

        let mut visited = HashSet::from([node_id]);
        let mut ordered = Vec::new();
        let mut pending = VecDeque::from([node_id]);

        while let Some(current) = pending.pop_front() {
            for child in self.children.get(&current).into_iter().flatten() {
                if !visited.insert(*child) {
                    return CorruptTreeSnafu {
                        stage: "tree-descendants-revisit",
                        node_id: *child,
                        details: format!("node reached twice while walking below '{node_id}'"),
                    }
                    .fail();
                }
                ordered.push(*child);
                pending.push_back(*child);
            }
        }

        Ok(ordered)
    }

    pub fn descendants(&self, node_id: NodeId) -> CoreResult<HashSet<NodeId>> {
        Ok(self.descendants_ordered(node_id)?.into_iter().collect())
    }

    /// Follows the earliest child until reaching a leaf.
    pub fn first_leaf(&self, node_id: NodeId) -> CoreResult<&NodeRecord> {
        let mut current = self.require(node_id, "tree-first-leaf-lookup")?;
        let mut visited = HashSet::from([node_id]);

        while let Some(child_id) = self
            .children
            .get(&current.id)
            .and_then(|children| children.first())
        {
            if !visited.insert(*child_id) {
                return CorruptTreeSnafu {
                    stage: "tree-first-leaf-cycle",
                    node_id: *child_id,
                    details: "first-child chain loops".to_string(),
                }
                .fail();
            }
            current = self.require(*child_id, "tree-first-leaf-child")?;
        }

        Ok(current)
    }

    /// Inserts or replaces a node, moving it between children lists when its parent changed.
    pub fn upsert(&mut self, node: NodeRecord) {
        if let Some(previous) = self.nodes.remove(&node.id) {
            self.detach(&previous);
        }

        let sort_key = (node.created_at_ms, node.id);
        let siblings = match node.parent_id {
            Some(parent_id) => self.children.entry(parent_id).or_default(),
            None => &mut self.roots,
        };
        let nodes = &self.nodes;
        let position = siblings.partition_point(|sibling_id| {
            nodes
                .get(sibling_id)
                .map(|sibling| (sibling.created_at_ms, sibling.id))
                .is_some_and(|key| key < sort_key)
        });
        siblings.insert(position, node.id);
        self.nodes.insert(node.id, node);
    }

    pub fn remove(&mut self, node_ids: &[NodeId]) {
        for node_id in node_ids {
            if let Some(previous) = self.nodes.remove(node_id) {
                self.detach(&previous);
            }
        }
        for node_id in node_ids {
            if self
                .children
                .get(node_id)
                .is_some_and(|children| children.is_empty())
            {
                self.children.remove(node_id);
            }
        }
    }

    fn detach(&mut self, node: &NodeRecord) {
        match node.parent_id {
            Some(parent_id) => {
                if let Some(siblings) = self.children.get_mut(&parent_id) {
                    siblings.retain(|sibling_id| *sibling_id != node.id);
                    if siblings.is_empty() {
                        self.children.remove(&parent_id);
                    }
                }
            }
            None => self.roots.retain(|root_id| *root_id != node.id),
        }
    }

    fn resolve(&self, ids: &[NodeId]) -> Vec<&NodeRecord> {
        ids.iter().filter_map(|id| self.nodes.get(id)).collect()
    }

    /// Checks single root, acyclicity, depth and root-id consistency, and scope membership.
    pub fn validate(&self) -> Vec<TreeViolation> {
        let mut violations = Vec::new();

        if self.roots.len() > 1 {
            violations.push(TreeViolation::MultipleRoots {
                root_ids: self.roots.clone(),
            });
        }

        let mut reached = HashSet::new();
        let mut pending = VecDeque::new();
        for root_id in &self.roots {
            reached.insert(*root_id);
            pending.push_back((*root_id, Some(*root_id)));
        }

        for node in self.nodes() {
            if node.conversation_id != self.scope {
                violations.push(TreeViolation::ForeignScope {
                    node_id: node.id,
                    conversation_id: node.conversation_id,
                });
            }
            if let Some(parent_id) = node.parent_id
                && !self.nodes.contains_key(&parent_id)
            {
                violations.push(TreeViolation::DanglingParent {
                    node_id: node.id,
                    parent_id,
                });
                // Orphans are walked too, but their root id cannot be checked.
                reached.insert(node.id);
                pending.push_back((node.id, None));
            }
        }

        while let Some((current_id, root_id)) = pending.pop_front() {
            let Some(current) = self.nodes.get(&current_id) else {
                continue;
            };

            match current.parent_id.and_then(|parent_id| self.nodes.get(&parent_id)) {
                Some(parent) if current.depth != parent.depth.saturating_add(1) => {
                    violations.push(TreeViolation::DepthMismatch {
                        node_id: current.id,
                        expected: parent.depth.saturating_add(1),
                        actual: current.depth,
                    });
                }
                None if current.parent_id.is_none() && current.depth != 0 => {
                    violations.push(TreeViolation::DepthMismatch {
                        node_id: current.id,
                        expected: 0,
                        actual: current.depth,
                    });
                }
                _ => {}
            }

            if let Some(expected) = root_id
                && current.root_id != expected
            {
                violations.push(TreeViolation::RootIdMismatch {
                    node_id: current.id,
                    expected,
                    actual: current.root_id,
                });
            }

            for child_id in self.children.get(&current_id).into_iter().flatten() {
                if reached.insert(*child_id) {
                    pending.push_back((*child_id, root_id));
                }
            }
        }

        for node in self.nodes() {
            if !reached.contains(&node.id) {
                violations.push(TreeViolation::Cycle { node_id: node.id });
            }
        }

        violations
    }
}
