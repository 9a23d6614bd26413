use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::sync::RwLock;

use super::error::{
    CreateLocalDirectorySnafu, NotFoundSnafu, ParseLocalStoreSnafu, ReadLocalStoreSnafu,
    SerializeLocalStoreSnafu, StorageResult, WriteLocalStoreSnafu,
};
use super::ids::{ConversationId, NodeId};
use super::types::{
    ConversationRecord, NewConversation, NodeRecord, creation_order, unix_timestamp_millis,
};
use super::{BoxFuture, ConversationStore, NodeStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LocalSnapshot {
    #[serde(default)]
    conversations: Vec<ConversationRecord>,
    #[serde(default)]
    nodes: Vec<NodeRecord>,
}

/// Process-local fallback store.
///
/// The backing collections are owned here alone; every mutation is applied to a copy,
/// written to disk synchronously, and only then swapped in, so a failed write leaves
/// the previous state intact. Single-process use only: there is no cross-process lock.
#[derive(Debug)]
pub struct LocalStore {
    path: Option<PathBuf>,
    state: RwLock<LocalSnapshot>,
}

impl LocalStore {
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let snapshot = read_snapshot(&path)?;
        tracing::debug!(
            path = %path.display(),
            conversations = snapshot.conversations.len(),
            nodes = snapshot.nodes.len(),
            "loaded local node store"
        );

        Ok(Self {
            path: Some(path),
            state: RwLock::new(snapshot),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(LocalSnapshot::default()),
        }
    }

    async fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut LocalSnapshot) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let output = apply(&mut next)?;
        next.nodes.sort_by(creation_order);

        if let Some(path) = &self.path {
            write_snapshot(path, &next)?;
        }

        *state = next;
        Ok(output)
    }
}

impl NodeStore for LocalStore {
    fn get_node(&self, node_id: NodeId) -> BoxFuture<'_, StorageResult<Option<NodeRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.nodes.iter().find(|node| node.id == node_id).cloned())
        })
    }

    fn list_nodes(
        &self,
        scope: Option<ConversationId>,
    ) -> BoxFuture<'_, StorageResult<Vec<NodeRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .nodes
                .iter()
                .filter(|node| scope.is_none_or(|scope| node.conversation_id == scope))
                .cloned()
                .collect())
        })
    }

    fn put_node(&self, node: NodeRecord) -> BoxFuture<'_, StorageResult<NodeRecord>> {
        Box::pin(async move {
            self.mutate(|snapshot| {
                upsert_checked(snapshot, &node)?;
                Ok(node)
            })
            .await
        })
    }

    fn put_nodes(
        &self,
        nodes: Vec<NodeRecord>,
    ) -> BoxFuture<'_, StorageResult<Vec<NodeRecord>>> {
        Box::pin(async move {
            self.mutate(|snapshot| {
                for node in &nodes {
                    upsert_checked(snapshot, node)?;
                }
                Ok(nodes)
            })
            .await
        })
    }

    fn delete_node(&self, node_id: NodeId) -> BoxFuture<'_, StorageResult<()>> {
        self.delete_nodes(vec![node_id])
    }

    fn delete_nodes(&self, node_ids: Vec<NodeId>) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.mutate(|snapshot| {
                // Mirrors the durable backend's ON DELETE CASCADE on parent_id.
                let doomed = cascade_closure(&snapshot.nodes, node_ids);
                snapshot.nodes.retain(|node| !doomed.contains(&node.id));
                Ok(())
            })
            .await
        })
    }
}

impl ConversationStore for LocalStore {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let record = input.into_record(unix_timestamp_millis());
            self.mutate(|snapshot| {
                if snapshot
                    .conversations
                    .iter()
                    .any(|conversation| conversation.id == record.id)
                {
                    return super::error::ConflictSnafu {
                        stage: "local-create-conversation-duplicate",
                        entity: "conversation",
                        details: format!("conversation '{}' already exists", record.id),
                    }
                    .fail();
                }

                snapshot.conversations.push(record.clone());
                Ok(record)
            })
            .await
        })
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .conversations
                .iter()
                .find(|conversation| conversation.id == conversation_id)
                .cloned())
        })
    }

    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut conversations = state.conversations.clone();
            conversations.sort_by(|left, right| {
                right
                    .created_at_ms
                    .cmp(&left.created_at_ms)
                    .then_with(|| right.id.cmp(&left.id))
            });
            Ok(conversations)
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.mutate(|snapshot| {
                snapshot
                    .conversations
                    .retain(|conversation| conversation.id != conversation_id);
                snapshot
                    .nodes
                    .retain(|node| node.conversation_id != conversation_id);
                Ok(())
            })
            .await
        })
    }
}

fn upsert_checked(snapshot: &mut LocalSnapshot, node: &NodeRecord) -> StorageResult<()> {
    let conversation_exists = snapshot
        .conversations
        .iter()
        .any(|conversation| conversation.id == node.conversation_id);
    if !conversation_exists {
        return NotFoundSnafu {
            stage: "local-put-node-conversation",
            entity: "conversation",
            id: node.conversation_id.to_string(),
        }
        .fail();
    }

    if let Some(parent_id) = node.parent_id
        && !snapshot.nodes.iter().any(|existing| existing.id == parent_id)
    {
        return NotFoundSnafu {
            stage: "local-put-node-parent",
            entity: "node",
            id: parent_id.to_string(),
        }
        .fail();
    }

    match snapshot.nodes.iter_mut().find(|existing| existing.id == node.id) {
        Some(existing) => *existing = node.clone(),
        None => snapshot.nodes.push(node.clone()),
    }
    Ok(())
}

fn cascade_closure(nodes: &[NodeRecord], seeds: Vec<NodeId>) -> HashSet<NodeId> {
    let mut doomed = HashSet::new();
    let mut pending = seeds;

    while let Some(current) = pending.pop() {
        if !doomed.insert(current) {
            continue;
        }

        pending.extend(
            nodes
                .iter()
                .filter(|node| node.parent_id == Some(current))
                .map(|node| node.id),
        );
    }

    doomed
}

fn read_snapshot(path: &Path) -> StorageResult<LocalSnapshot> {
    if !path.exists() {
        return Ok(LocalSnapshot::default());
    }

    let text = std::fs::read_to_string(path).context(ReadLocalStoreSnafu {
        stage: "local-read-store",
        path: path.display().to_string(),
    })?;
    if text.trim().is_empty() {
        return Ok(LocalSnapshot::default());
    }

    let mut snapshot: LocalSnapshot =
        serde_json::from_str(&text).context(ParseLocalStoreSnafu {
            stage: "local-parse-store",
            path: path.display().to_string(),
        })?;
    snapshot.nodes.sort_by(creation_order);
    Ok(snapshot)
}

fn write_snapshot(path: &Path, snapshot: &LocalSnapshot) -> StorageResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateLocalDirectorySnafu {
            stage: "local-create-store-directory",
            path: parent.display().to_string(),
        })?;
    }

    let serialized = serde_json::to_string_pretty(snapshot).context(SerializeLocalStoreSnafu {
        stage: "local-serialize-store",
    })?;

    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, serialized).context(WriteLocalStoreSnafu {
        stage: "local-write-temporary-store",
        path: temp_path.display().to_string(),
    })?;
    std::fs::rename(&temp_path, path).context(WriteLocalStoreSnafu {
        stage: "local-rename-temporary-store",
        path: path.display().to_string(),
    })?;

    Ok(())
}
