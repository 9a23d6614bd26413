use arbor_storage::{NodeRecord, NodeStatus};

/// Status change requested for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusTransition {
    /// `idle -> processing`, once, when an idle node is sent to the model.
    Submit,
    Complete { response: String },
    Fail { message: String },
}

impl StatusTransition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejection {
    NotIdle { from: NodeStatus },
    NotProcessing { from: NodeStatus },
}

impl TransitionRejection {
    pub fn from_status(&self) -> NodeStatus {
        match self {
            Self::NotIdle { from } | Self::NotProcessing { from } => *from,
        }
    }
}

/// Applies one transition in place; the node is left untouched when rejected.
pub fn apply_transition(
    node: &mut NodeRecord,
    transition: StatusTransition,
    now_ms: u64,
) -> Result<(), TransitionRejection> {
    match (node.status, transition) {
        (NodeStatus::Idle, StatusTransition::Submit) => {
            node.status = NodeStatus::Processing;
            node.response = None;
            node.error = None;
        }
        (from, StatusTransition::Submit) => return Err(TransitionRejection::NotIdle { from }),
        (NodeStatus::Processing, StatusTransition::Complete { response }) => {
            node.status = NodeStatus::Completed;
            node.response = Some(response);
            node.error = None;
        }
        (NodeStatus::Processing, StatusTransition::Fail { message }) => {
            node.status = NodeStatus::Error;
            node.response = None;
            node.error = Some(message);
        }
        (from, StatusTransition::Complete { .. } | StatusTransition::Fail { .. }) => {
            return Err(TransitionRejection::NotProcessing { from });
        }
    }

    node.touch(now_ms);
    Ok(())
}
