use arbor_storage::NodeId;

use crate::error::CoreResult;
use crate::tree::TreeIndex;

/// Node ids to remove in one batch, deepest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionPlan {
    pub target: NodeId,
    pub doomed: Vec<NodeId>,
    /// Set when the target is the scope's only root, so the conversation goes with it.
    pub removes_scope: bool,
}

impl DeletionPlan {
    pub fn is_empty(&self) -> bool {
        self.doomed.is_empty()
    }
}

/// `node_id` together with every descendant.
pub fn plan_delete_subtree(index: &TreeIndex, node_id: NodeId) -> CoreResult<DeletionPlan> {
    let mut doomed = vec![node_id];
    doomed.extend(index.descendants_ordered(node_id)?);
    doomed.reverse();

    Ok(DeletionPlan {
        target: node_id,
        doomed,
        removes_scope: index.is_root(node_id) && index.roots().len() == 1,
    })
}

/// Every descendant of `node_id`; the node itself stays.
pub fn plan_clear_children(index: &TreeIndex, node_id: NodeId) -> CoreResult<DeletionPlan> {
    let mut doomed = index.descendants_ordered(node_id)?;
    doomed.reverse();

    Ok(DeletionPlan {
        target: node_id,
        doomed,
        removes_scope: false,
    })
}
