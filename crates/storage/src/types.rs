use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{InvariantViolationSnafu, StorageResult};
use super::ids::{ConversationId, NodeId};

/// Default conversation title used when callers supply an empty one.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Generation lifecycle of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Idle,
    Processing,
    Completed,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        match raw {
            "idle" => Ok(Self::Idle),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => InvariantViolationSnafu {
                stage: "node-status-parse",
                details: format!("unknown node status '{raw}'"),
            }
            .fail(),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One prompt/response turn in a conversation tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub conversation_id: ConversationId,
    pub parent_id: Option<NodeId>,
    /// Root ancestor of this node's tree; a root points at itself.
    pub root_id: NodeId,
    pub depth: u32,
    pub title: String,
    pub summary: String,
    pub prompt: Option<String>,
    pub response: Option<String>,
    pub model_id: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl NodeRecord {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Bumps `updated_at_ms` without ever moving it backwards.
    pub fn touch(&mut self, now_ms: u64) {
        self.updated_at_ms = self.updated_at_ms.max(now_ms).max(self.created_at_ms);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewConversation {
    /// Explicit id for callers that pre-allocate one; a v7 id is minted otherwise.
    pub id: Option<ConversationId>,
    pub title: String,
}

impl NewConversation {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
        }
    }

    pub(crate) fn into_record(self, now_ms: u64) -> ConversationRecord {
        let title = if self.title.trim().is_empty() {
            DEFAULT_CONVERSATION_TITLE.to_string()
        } else {
            self.title.trim().to_string()
        };

        ConversationRecord {
            id: self.id.unwrap_or_else(ConversationId::new_v7),
            title,
            created_at_ms: now_ms,
        }
    }
}

/// Creation order used by every backend: oldest first, ties broken by id.
pub fn creation_order(left: &NodeRecord, right: &NodeRecord) -> std::cmp::Ordering {
    left.created_at_ms
        .cmp(&right.created_at_ms)
        .then_with(|| left.id.cmp(&right.id))
}

pub fn unix_timestamp_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
