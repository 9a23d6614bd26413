use arbor_llm::ProviderError;
use arbor_storage::{ConversationId, NodeId, NodeStatus, StorageError};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoreError {
    #[snafu(display("{entity} '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("conversation '{conversation_id}' already has a root node"))]
    RootAlreadyExists {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display(
        "parent '{parent_id}' belongs to conversation '{actual}', not '{expected}'"
    ))]
    CrossScopeParent {
        stage: &'static str,
        parent_id: NodeId,
        expected: ConversationId,
        actual: ConversationId,
    },
    #[snafu(display("node store unavailable at {stage}: {source}"))]
    StoreUnavailable {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("generation for node '{node_id}' failed: {source}"))]
    Provider {
        stage: &'static str,
        node_id: NodeId,
        source: ProviderError,
    },
    #[snafu(display("corrupt tree at node '{node_id}': {details}"))]
    CorruptTree {
        stage: &'static str,
        node_id: NodeId,
        details: String,
    },
    #[snafu(display("node '{node_id}' cannot go from {from} via {attempted}"))]
    InvalidTransition {
        stage: &'static str,
        node_id: NodeId,
        from: NodeStatus,
        attempted: &'static str,
    },
    #[snafu(display("prompt is empty"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("generation task failed: {source}"))]
    GenerationTask {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Maps a failed store write. Structural rejections keep their meaning; anything else is
/// an unavailable store.
pub(crate) fn store_write_failure(stage: &'static str) -> impl FnOnce(StorageError) -> CoreError {
    move |source| match source {
        StorageError::NotFound { entity, id, .. } => CoreError::NotFound { stage, entity, id },
        source => CoreError::StoreUnavailable { stage, source },
    }
}
