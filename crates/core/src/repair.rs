use std::collections::{HashMap, HashSet, VecDeque};

use arbor_storage::{ConversationId, NodeId, NodeRecord};

use crate::tree::TreeIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub conversation_id: ConversationId,
    pub kept_root: Option<NodeId>,
    /// Nodes whose parent was rewritten to the kept root.
    pub reparented: Vec<NodeId>,
    /// Every node that had to be persisted again, reparented ones included.
    pub rewritten: Vec<NodeId>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.rewritten.is_empty()
    }
}

/// Computes the node updates that restore a single acyclic tree with consistent depths.
///
/// The earliest root is kept. Other roots, orphans and cycle members hang under it, in
/// creation order, and `depth`/`root_id` are recomputed breadth-first from there.
pub fn plan_repair(index: &TreeIndex, now_ms: u64) -> (Vec<NodeRecord>, RepairReport) {
    let ordered = index.nodes();
    let mut report = RepairReport {
        conversation_id: index.scope(),
        kept_root: None,
        reparented: Vec::new(),
        rewritten: Vec::new(),
    };

    let Some(kept_root) = index
        .root()
        .or_else(|| ordered.first().copied())
        .map(|node| node.id)
    else {
        return (Vec::new(), report);
    };
    report.kept_root = Some(kept_root);

    let mut parents = ordered
        .iter()
        .map(|node| (node.id, node.parent_id))
        .collect::<HashMap<_, _>>();
    parents.insert(kept_root, None);

    let mut reached = HashSet::from([kept_root]);
    mark_reachable(index, kept_root, &mut reached);

    for node in &ordered {
        if reached.contains(&node.id) {
            continue;
        }
        parents.insert(node.id, Some(kept_root));
        report.reparented.push(node.id);
        reached.insert(node.id);
        mark_reachable(index, node.id, &mut reached);
    }

    let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for node in &ordered {
        if let Some(Some(parent_id)) = parents.get(&node.id) {
            children.entry(*parent_id).or_default().push(node.id);
        }
    }

    let mut updates = Vec::new();
    let mut pending = VecDeque::from([(kept_root, 0_u32)]);
    let mut placed = HashSet::from([kept_root]);
    while let Some((node_id, depth)) = pending.pop_front() {
        let Some(original) = index.get(node_id) else {
            continue;
        };
        let parent_id = parents.get(&node_id).copied().flatten();

        if original.parent_id != parent_id
            || original.depth != depth
            || original.root_id != kept_root
        {
            let mut fixed = original.clone();
            fixed.parent_id = parent_id;
            fixed.depth = depth;
            fixed.root_id = kept_root;
            fixed.touch(now_ms);
            report.rewritten.push(node_id);
            updates.push(fixed);
        }

        for child_id in children.get(&node_id).into_iter().flatten() {
            if placed.insert(*child_id) {
                pending.push_back((*child_id, depth.saturating_add(1)));
            }
        }
    }

    (updates, report)
}

fn mark_reachable(index: &TreeIndex, start: NodeId, reached: &mut HashSet<NodeId>) {
    let mut pending = vec![start];
    while let Some(current) = pending.pop() {
        for child in index.children_of(current) {
            if reached.insert(child.id) {
                pending.push(child.id);
            }
        }
    }
}
