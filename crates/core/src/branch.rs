use arbor_llm::ProviderMessage;
use arbor_storage::{NodeId, NodeRecord, NodeStatus};
use snafu::ensure;

use crate::error::{CoreResult, CrossScopeParentSnafu, EmptyPromptSnafu, RootAlreadyExistsSnafu};
use crate::lifecycle::{StatusTransition, apply_transition};
use crate::lineage::{context_messages, lineage};
use crate::summaries::{ROOT_TITLE, fork_title, summarize, title_for_prompt};
use crate::tree::TreeIndex;

/// A node ready to persist, plus the context to send when it awaits a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub node: NodeRecord,
    pub context: Option<Vec<ProviderMessage>>,
}

impl Draft {
    fn idle(node: NodeRecord) -> Self {
        Self {
            node,
            context: None,
        }
    }

    fn generating(node: NodeRecord, context: Vec<ProviderMessage>) -> Self {
        Self {
            node,
            context: Some(context),
        }
    }

    pub fn needs_generation(&self) -> bool {
        self.context.is_some()
    }
}

pub fn normalize_prompt(raw: &str) -> CoreResult<String> {
    let prompt = raw.trim();
    ensure!(
        !prompt.is_empty(),
        EmptyPromptSnafu {
            stage: "normalize-prompt",
        }
    );
    Ok(prompt.to_string())
}

fn new_node(
    index: &TreeIndex,
    parent: Option<&NodeRecord>,
    prompt: Option<String>,
    model_id: &str,
    status: NodeStatus,
    now_ms: u64,
) -> NodeRecord {
    let id = NodeId::new_v7();
    let title = match (&prompt, parent) {
        (None, None) => ROOT_TITLE.to_string(),
        (prompt, _) => title_for_prompt(prompt.as_deref()),
    };

    NodeRecord {
        id,
        conversation_id: index.scope(),
        parent_id: parent.map(|parent| parent.id),
        root_id: parent.map_or(id, |parent| parent.root_id),
        depth: parent.map_or(0, |parent| parent.depth.saturating_add(1)),
        title,
        summary: summarize(prompt.as_deref()),
        prompt,
        response: None,
        model_id: model_id.to_string(),
        status,
        error: None,
        created_at_ms: now_ms,
        updated_at_ms: now_ms,
    }
}

fn ensure_no_root(index: &TreeIndex, stage: &'static str) -> CoreResult<()> {
    ensure!(
        index.root().is_none(),
        RootAlreadyExistsSnafu {
            stage,
            conversation_id: index.scope(),
        }
    );
    Ok(())
}

/// First node of an empty scope: idle `"Root"` without a prompt, a draft with one.
pub fn plan_root(
    index: &TreeIndex,
    prompt: Option<&str>,
    model_id: &str,
    now_ms: u64,
) -> CoreResult<Draft> {
    ensure_no_root(index, "plan-root")?;

    match prompt {
        None => Ok(Draft::idle(new_node(
            index,
            None,
            None,
            model_id,
            NodeStatus::Idle,
            now_ms,
        ))),
        Some(raw) => {
            let prompt = normalize_prompt(raw)?;
            let context = context_messages(&[], &prompt);
            let node = new_node(
                index,
                None,
                Some(prompt),
                model_id,
                NodeStatus::Processing,
                now_ms,
            );
            Ok(Draft::generating(node, context))
        }
    }
}

/// Child of `parent_id` continuing its lineage with a new prompt.
pub fn plan_branch(
    index: &TreeIndex,
    parent_id: NodeId,
    prompt: &str,
    model_id: &str,
    now_ms: u64,
) -> CoreResult<Draft> {
    let parent = index.require(parent_id, "plan-branch-parent")?;
    ensure!(
        parent.conversation_id == index.scope(),
        CrossScopeParentSnafu {
            stage: "plan-branch-scope",
            parent_id,
            expected: index.scope(),
            actual: parent.conversation_id,
        }
    );

    let prompt = normalize_prompt(prompt)?;
    let context = context_messages(&lineage(index, parent_id)?, &prompt);
    let node = new_node(
        index,
        Some(parent),
        Some(prompt),
        model_id,
        NodeStatus::Processing,
        now_ms,
    );
    Ok(Draft::generating(node, context))
}

/// Idle sibling copy of `node_id` without its response.
pub fn plan_clone(index: &TreeIndex, node_id: NodeId, now_ms: u64) -> CoreResult<NodeRecord> {
    let source = index.require(node_id, "plan-clone-source")?;
    ensure!(
        !source.is_root(),
        RootAlreadyExistsSnafu {
            stage: "plan-clone-root",
            conversation_id: index.scope(),
        }
    );

    let parent = index.parent_of(node_id);
    let mut node = new_node(
        index,
        parent,
        source.prompt.clone(),
        &source.model_id,
        NodeStatus::Idle,
        now_ms,
    );
    // Orphans keep their dangling parent reference rather than becoming a second root.
    node.parent_id = source.parent_id;
    node.root_id = source.root_id;
    node.depth = source.depth;
    node.title = fork_title(&source.title);
    node.summary = source.summary.clone();
    Ok(node)
}

/// Sibling of `node_id` whose context stops at the shared parent.
fn plan_sibling_draft(
    index: &TreeIndex,
    node_id: NodeId,
    prompt: String,
    model_id: Option<&str>,
    now_ms: u64,
    stage: &'static str,
) -> CoreResult<Draft> {
    let source = index.require(node_id, stage)?;
    ensure!(
        !source.is_root(),
        RootAlreadyExistsSnafu {
            stage,
            conversation_id: index.scope(),
        }
    );

    let history = match source.parent_id {
        Some(parent_id) if index.contains(parent_id) => lineage(index, parent_id)?,
        _ => Vec::new(),
    };
    let context = context_messages(&history, &prompt);
    let model_id = model_id
        .map(str::trim)
        .filter(|model_id| !model_id.is_empty())
        .unwrap_or(source.model_id.as_str());

    let mut node = new_node(
        index,
        index.parent_of(node_id),
        Some(prompt),
        model_id,
        NodeStatus::Processing,
        now_ms,
    );
    node.parent_id = source.parent_id;
    node.root_id = source.root_id;
    node.depth = source.depth;
    Ok(Draft::generating(node, context))
}

/// Recomputes `node_id`'s response as a new sibling; the original stays as history.
pub fn plan_regenerate(
    index: &TreeIndex,
    node_id: NodeId,
    model_id: Option<&str>,
    now_ms: u64,
) -> CoreResult<Draft> {
    let source = index.require(node_id, "plan-regenerate-source")?;
    let prompt = normalize_prompt(source.prompt.as_deref().unwrap_or_default())?;
    plan_sibling_draft(
        index,
        node_id,
        prompt,
        model_id,
        now_ms,
        "plan-regenerate-sibling",
    )
}

/// Like regenerate, with a replacement prompt.
pub fn plan_edit_as_branch(
    index: &TreeIndex,
    node_id: NodeId,
    prompt: &str,
    model_id: Option<&str>,
    now_ms: u64,
) -> CoreResult<Draft> {
    let prompt = normalize_prompt(prompt)?;
    plan_sibling_draft(
        index,
        node_id,
        prompt,
        model_id,
        now_ms,
        "plan-edit-as-branch-sibling",
    )
}

/// Moves an idle node to processing; context is its parent's lineage plus its prompt.
pub fn plan_submit(index: &TreeIndex, node_id: NodeId, now_ms: u64) -> CoreResult<Draft> {
    let source = index.require(node_id, "plan-submit-source")?;
    let prompt = normalize_prompt(source.prompt.as_deref().unwrap_or_default())?;

    let mut node = source.clone();
    apply_transition(&mut node, StatusTransition::Submit, now_ms).map_err(|rejection| {
        crate::error::CoreError::InvalidTransition {
            stage: "plan-submit-transition",
            node_id,
            from: rejection.from_status(),
            attempted: StatusTransition::Submit.name(),
        }
    })?;

    let history = match source.parent_id {
        Some(parent_id) if index.contains(parent_id) => lineage(index, parent_id)?,
        _ => Vec::new(),
    };
    Ok(Draft::generating(node, context_messages(&history, &prompt)))
}

/// In-place prompt edit; title, summary and timestamp follow.
pub fn plan_edit_prompt(
    index: &TreeIndex,
    node_id: NodeId,
    prompt: &str,
    now_ms: u64,
) -> CoreResult<NodeRecord> {
    let prompt = normalize_prompt(prompt)?;
    let mut node = index.require(node_id, "plan-edit-prompt-source")?.clone();
    node.title = title_for_prompt(Some(&prompt));
    node.summary = summarize(Some(&prompt));
    node.prompt = Some(prompt);
    node.touch(now_ms);
    Ok(node)
}
