use std::collections::HashSet;

use arbor_llm::ProviderMessage;
use arbor_storage::{NodeId, NodeRecord};

use crate::error::{CoreResult, CorruptTreeSnafu};
use crate::tree::TreeIndex;

/// Root-to-node path, inclusive.
///
/// A parent id that the index cannot resolve ends the walk there: the caller gets the
/// chain from the break down to `node_id`. Cycles are reported as `CorruptTree`.
pub fn lineage(index: &TreeIndex, node_id: NodeId) -> CoreResult<Vec<NodeRecord>> {
    let mut current = index.require(node_id, "lineage-start")?;
    let mut visited = HashSet::from([node_id]);
    let mut chain = vec![current.clone()];

    while let Some(parent_id) = current.parent_id {
        let Some(parent) = index.get(parent_id) else {
            tracing::warn!(
                conversation_id = %index.scope(),
                node_id = %current.id,
                missing_parent_id = %parent_id,
                "lineage truncated at dangling parent reference"
            );
            break;
        };

        if !visited.insert(parent_id) {
            return CorruptTreeSnafu {
                stage: "lineage-cycle",
                node_id: parent_id,
                details: format!("parent chain of '{node_id}' loops"),
            }
            .fail();
        }

        chain.push(parent.clone());
        current = parent;
    }

    chain.reverse();
    Ok(chain)
}

/// Flattens a lineage into provider messages and appends `prompt` as the final user turn.
///
/// Only turns with both a prompt and a response contribute history.
pub fn context_messages(lineage: &[NodeRecord], prompt: &str) -> Vec<ProviderMessage> {
    let mut messages = Vec::with_capacity(lineage.len() * 2 + 1);
    for node in lineage {
        if let (Some(user), Some(assistant)) = (&node.prompt, &node.response) {
            messages.push(ProviderMessage::user(user.clone()));
            messages.push(ProviderMessage::assistant(assistant.clone()));
        }
    }
    messages.push(ProviderMessage::user(prompt));
    messages
}
