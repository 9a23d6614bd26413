use std::sync::Arc;

use arbor_llm::{LlmProvider, ProviderMessage, resolve_model_id};
use arbor_storage::{
    ConversationId, ConversationRecord, NewConversation, NodeId, NodeRecord, Storage,
};
use snafu::{OptionExt, ResultExt};
use tokio::task::JoinHandle;

use crate::branch::{
    Draft, plan_branch, plan_clone, plan_edit_as_branch, plan_edit_prompt, plan_regenerate,
    plan_root, plan_submit,
};
use crate::cascade::{DeletionPlan, plan_clear_children, plan_delete_subtree};
use crate::error::{
    CoreError, CoreResult, CrossScopeParentSnafu, GenerationTaskSnafu, NotFoundSnafu,
    StoreUnavailableSnafu, store_write_failure,
};
use crate::lifecycle::{StatusTransition, apply_transition};
use crate::lineage::lineage;
use crate::repair::{RepairReport, plan_repair};
use crate::scope::{IndexCache, MonotonicClock, ScopeLocks};
use crate::tree::{TreeIndex, TreeViolation};

/// A persisted draft whose response is being generated in the background.
///
/// Dropping the handle leaves the generation running; the draft still resolves.
#[derive(Debug)]
pub struct Generation {
    draft: NodeRecord,
    task: JoinHandle<CoreResult<NodeRecord>>,
}

impl Generation {
    pub fn draft(&self) -> &NodeRecord {
        &self.draft
    }

    pub fn node_id(&self) -> NodeId {
        self.draft.id
    }

    /// Waits for the draft to settle. Provider failures come back as `CoreError::Provider`
    /// after the draft has been stored in `error` status.
    pub async fn wait(self) -> CoreResult<NodeRecord> {
        self.task.await.context(GenerationTaskSnafu {
            stage: "generation-join",
        })?
    }
}

/// Presentation-facing entry point: serializes writers per conversation and keeps the
/// published tree snapshots current.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    store: Arc<dyn Storage>,
    provider: Arc<dyn LlmProvider>,
    locks: ScopeLocks,
    cache: IndexCache,
    clock: MonotonicClock,
}

impl SessionController {
    pub fn new(store: Arc<dyn Storage>, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                store,
                provider,
                locks: ScopeLocks::default(),
                cache: IndexCache::default(),
                clock: MonotonicClock::default(),
            }),
        }
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.inner.provider
    }

    pub async fn create_conversation(&self, title: &str) -> CoreResult<ConversationRecord> {
        let record = self
            .inner
            .store
            .create_conversation(NewConversation::titled(title))
            .await
            .context(StoreUnavailableSnafu {
                stage: "create-conversation",
            })?;
        tracing::info!(conversation_id = %record.id, title = %record.title, "conversation created");
        Ok(record)
    }

    pub async fn list_conversations(&self) -> CoreResult<Vec<ConversationRecord>> {
        self.inner
            .store
            .list_conversations()
            .await
            .context(StoreUnavailableSnafu {
                stage: "list-conversations",
            })
    }

    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> CoreResult<()> {
        let _guard = self.inner.locks.acquire(conversation_id).await;
        self.inner
            .require_conversation(conversation_id, "delete-conversation-lookup")
            .await?;
        self.inner.remove_scope(conversation_id).await
    }

    pub async fn get_node(&self, node_id: NodeId) -> CoreResult<NodeRecord> {
        self.inner.fetch_node(node_id, "get-node").await
    }

    pub async fn get_tree(&self, conversation_id: ConversationId) -> CoreResult<Arc<TreeIndex>> {
        self.inner
            .require_conversation(conversation_id, "get-tree-conversation")
            .await?;
        self.inner.snapshot(conversation_id).await
    }

    pub async fn get_lineage(&self, node_id: NodeId) -> CoreResult<Vec<NodeRecord>> {
        let index = self.inner.snapshot_for_node(node_id).await?;
        lineage(&index, node_id)
    }

    pub async fn get_children(&self, node_id: NodeId) -> CoreResult<Vec<NodeRecord>> {
        let index = self.inner.snapshot_for_node(node_id).await?;
        index.require(node_id, "get-children")?;
        Ok(index.children_of(node_id).into_iter().cloned().collect())
    }

    pub async fn get_siblings(&self, node_id: NodeId) -> CoreResult<Vec<NodeRecord>> {
        let index = self.inner.snapshot_for_node(node_id).await?;
        Ok(index
            .siblings_of(node_id)?
            .into_iter()
            .cloned()
            .collect())
    }

    /// Deepest node reached by always taking the earliest child.
    pub async fn first_leaf(&self, node_id: NodeId) -> CoreResult<NodeRecord> {
        let index = self.inner.snapshot_for_node(node_id).await?;
        index.first_leaf(node_id).cloned()
    }

    pub async fn validate_scope(
        &self,
        conversation_id: ConversationId,
    ) -> CoreResult<Vec<TreeViolation>> {
        Ok(self.get_tree(conversation_id).await?.validate())
    }

    /// Idle `"Root"` node. Without a hint a fresh conversation is created for it.
    pub async fn create_root(&self, scope_hint: Option<ConversationId>) -> CoreResult<NodeRecord> {
        let conversation_id = match scope_hint {
            Some(conversation_id) => conversation_id,
            None => self.create_conversation("").await?.id,
        };

        let _guard = self.inner.locks.acquire(conversation_id).await;
        self.inner
            .require_conversation(conversation_id, "create-root-conversation")
            .await?;
        let index = self.inner.load_index(conversation_id).await?;
        let model_id = self.inner.provider.default_model().to_string();
        let Draft { node, .. } = plan_root(&index, None, &model_id, self.inner.clock.now_ms())?;

        self.inner.persist(index, node, "create-root").await
    }

    /// Sends `prompt` into a conversation: as its root when `parent_id` is absent,
    /// otherwise as a new child of `parent_id`.
    pub async fn send(
        &self,
        conversation_id: ConversationId,
        parent_id: Option<NodeId>,
        prompt: &str,
        model_id: &str,
    ) -> CoreResult<Generation> {
        let model_id = self.inner.resolve_model(model_id);

        let _guard = self.inner.locks.acquire(conversation_id).await;
        self.inner
            .require_conversation(conversation_id, "send-conversation")
            .await?;
        let index = self.inner.load_index(conversation_id).await?;
        let now_ms = self.inner.clock.now_ms();

        let draft = match parent_id {
            None => plan_root(&index, Some(prompt), &model_id, now_ms)?,
            Some(parent_id) => {
                if !index.contains(parent_id) {
                    return Err(self.inner.missing_parent(conversation_id, parent_id).await);
                }
                plan_branch(&index, parent_id, prompt, &model_id, now_ms)?
            }
        };

        self.inner.persist_and_dispatch(index, draft, "send").await
    }

    pub async fn branch(
        &self,
        parent_id: NodeId,
        prompt: &str,
        model_id: &str,
    ) -> CoreResult<Generation> {
        let conversation_id = self.inner.scope_of(parent_id, "branch-parent").await?;
        self.send(conversation_id, Some(parent_id), prompt, model_id)
            .await
    }

    pub async fn clone_node(&self, node_id: NodeId) -> CoreResult<NodeRecord> {
        let conversation_id = self.inner.scope_of(node_id, "clone-source").await?;
        let _guard = self.inner.locks.acquire(conversation_id).await;
        let index = self.inner.load_index(conversation_id).await?;
        let node = plan_clone(&index, node_id, self.inner.clock.now_ms())?;
        self.inner.persist(index, node, "clone").await
    }

    pub async fn regenerate(
        &self,
        node_id: NodeId,
        model_id: Option<&str>,
    ) -> CoreResult<Generation> {
        let conversation_id = self.inner.scope_of(node_id, "regenerate-source").await?;
        let _guard = self.inner.locks.acquire(conversation_id).await;
        let index = self.inner.load_index(conversation_id).await?;
        let draft = plan_regenerate(&index, node_id, model_id, self.inner.clock.now_ms())?;
        self.inner
            .persist_and_dispatch(index, draft, "regenerate")
            .await
    }

    pub async fn edit_prompt(&self, node_id: NodeId, prompt: &str) -> CoreResult<NodeRecord> {
        let conversation_id = self.inner.scope_of(node_id, "edit-prompt-source").await?;
        let _guard = self.inner.locks.acquire(conversation_id).await;
        let index = self.inner.load_index(conversation_id).await?;
        let node = plan_edit_prompt(&index, node_id, prompt, self.inner.clock.now_ms())?;
        self.inner.persist(index, node, "edit-prompt").await
    }

    pub async fn edit_as_branch(
        &self,
        node_id: NodeId,
        prompt: &str,
        model_id: Option<&str>,
    ) -> CoreResult<Generation> {
        let conversation_id = self.inner.scope_of(node_id, "edit-as-branch-source").await?;
        let _guard = self.inner.locks.acquire(conversation_id).await;
        let index = self.inner.load_index(conversation_id).await?;
        let draft =
            plan_edit_as_branch(&index, node_id, prompt, model_id, self.inner.clock.now_ms())?;
        self.inner
            .persist_and_dispatch(index, draft, "edit-as-branch")
            .await
    }

    pub async fn submit(&self, node_id: NodeId) -> CoreResult<Generation> {
        let conversation_id = self.inner.scope_of(node_id, "submit-source").await?;
        let _guard = self.inner.locks.acquire(conversation_id).await;
        let index = self.inner.load_index(conversation_id).await?;
        let draft = plan_submit(&index, node_id, self.inner.clock.now_ms())?;
        self.inner.persist_and_dispatch(index, draft, "submit").await
    }

    /// Removes `node_id` and its descendants. Deleting the only root drops the conversation.
    pub async fn delete_subtree(&self, node_id: NodeId) -> CoreResult<Vec<NodeId>> {
        let conversation_id = self.inner.scope_of(node_id, "delete-subtree-source").await?;
        let _guard = self.inner.locks.acquire(conversation_id).await;
        let index = self.inner.load_index(conversation_id).await?;
        let plan = plan_delete_subtree(&index, node_id)?;
        self.inner.apply_deletion(index, plan, "delete-subtree").await
    }

    pub async fn clear_children(&self, node_id: NodeId) -> CoreResult<Vec<NodeId>> {
        let conversation_id = self.inner.scope_of(node_id, "clear-children-source").await?;
        let _guard = self.inner.locks.acquire(conversation_id).await;
        let index = self.inner.load_index(conversation_id).await?;
        let plan = plan_clear_children(&index, node_id)?;
        self.inner.apply_deletion(index, plan, "clear-children").await
    }

    pub async fn repair_scope(&self, conversation_id: ConversationId) -> CoreResult<RepairReport> {
        let _guard = self.inner.locks.acquire(conversation_id).await;
        self.inner
            .require_conversation(conversation_id, "repair-conversation")
            .await?;
        let mut index = self.inner.load_index(conversation_id).await?;
        let (updates, report) = plan_repair(&index, self.inner.clock.now_ms());

        if !updates.is_empty() {
            let stored = match self.inner.store.put_nodes(updates).await {
                Ok(stored) => stored,
                Err(source) => {
                    // The published snapshot may already be stale; readers reload from the store.
                    self.inner.cache.evict(conversation_id).await;
                    return Err(store_write_failure("repair-put-nodes")(source));
                }
            };
            for node in stored {
                index.upsert(node);
            }
        }
        self.inner.cache.publish(index).await;

        tracing::info!(
            conversation_id = %conversation_id,
            reparented = report.reparented.len(),
            rewritten = report.rewritten.len(),
            "scope repaired"
        );
        Ok(report)
    }
}

impl ControllerInner {
    fn resolve_model(&self, model_id: &str) -> String {
        resolve_model_id(model_id, self.provider.default_model()).to_string()
    }

    async fn fetch_node(&self, node_id: NodeId, stage: &'static str) -> CoreResult<NodeRecord> {
        self.store
            .get_node(node_id)
            .await
            .context(StoreUnavailableSnafu { stage })?
            .context(NotFoundSnafu {
                stage,
                entity: "node",
                id: node_id.to_string(),
            })
    }

    async fn scope_of(&self, node_id: NodeId, stage: &'static str) -> CoreResult<ConversationId> {
        Ok(self.fetch_node(node_id, stage).await?.conversation_id)
    }

    async fn require_conversation(
        &self,
        conversation_id: ConversationId,
        stage: &'static str,
    ) -> CoreResult<ConversationRecord> {
        self.store
            .get_conversation(conversation_id)
            .await
            .context(StoreUnavailableSnafu { stage })?
            .context(NotFoundSnafu {
                stage,
                entity: "conversation",
                id: conversation_id.to_string(),
            })
    }

    /// Parent id absent from the conversation: either unknown or owned by another one.
    async fn missing_parent(&self, conversation_id: ConversationId, parent_id: NodeId) -> CoreError {
        match self.store.get_node(parent_id).await {
            Ok(Some(parent)) => CrossScopeParentSnafu {
                stage: "send-parent-scope",
                parent_id,
                expected: conversation_id,
                actual: parent.conversation_id,
            }
            .build(),
            Ok(None) => NotFoundSnafu {
                stage: "send-parent-lookup",
                entity: "node",
                id: parent_id.to_string(),
            }
            .build(),
            Err(source) => CoreError::StoreUnavailable {
                stage: "send-parent-lookup",
                source,
            },
        }
    }

    /// Fresh index straight from the store; writers call this while holding the scope lock.
    async fn load_index(&self, conversation_id: ConversationId) -> CoreResult<TreeIndex> {
        let nodes = self
            .store
            .list_nodes(Some(conversation_id))
            .await
            .context(StoreUnavailableSnafu {
                stage: "load-index",
            })?;
        Ok(TreeIndex::from_nodes(conversation_id, nodes))
    }

    async fn snapshot(&self, conversation_id: ConversationId) -> CoreResult<Arc<TreeIndex>> {
        if let Some(snapshot) = self.cache.get(conversation_id).await {
            return Ok(snapshot);
        }
        let index = self.load_index(conversation_id).await?;
        Ok(self.cache.publish_if_absent(index).await)
    }

    async fn snapshot_for_node(&self, node_id: NodeId) -> CoreResult<Arc<TreeIndex>> {
        let conversation_id = self.scope_of(node_id, "snapshot-for-node").await?;
        self.snapshot(conversation_id).await
    }

    async fn persist(
        &self,
        mut index: TreeIndex,
        node: NodeRecord,
        stage: &'static str,
    ) -> CoreResult<NodeRecord> {
        let node = self
            .store
            .put_node(node)
            .await
            .map_err(store_write_failure(stage))?;
        index.upsert(node.clone());
        self.cache.publish(index).await;

        tracing::info!(
            conversation_id = %node.conversation_id,
            node_id = %node.id,
            parent_id = ?node.parent_id,
            status = %node.status,
            stage,
            "node stored"
        );
        Ok(node)
    }

    async fn persist_and_dispatch(
        self: &Arc<Self>,
        index: TreeIndex,
        draft: Draft,
        stage: &'static str,
    ) -> CoreResult<Generation> {
        let Draft { node, context } = draft;
        let draft = self.persist(index, node, stage).await?;

        let task = tokio::spawn(
            self.clone()
                .resolve_generation(draft.clone(), context.unwrap_or_default()),
        );
        Ok(Generation { draft, task })
    }

    /// Runs the model call outside the scope lock, then records the outcome under it.
    async fn resolve_generation(
        self: Arc<Self>,
        draft: NodeRecord,
        context: Vec<ProviderMessage>,
    ) -> CoreResult<NodeRecord> {
        let outcome = self.provider.generate(context, &draft.model_id).await;
        let (transition, failure) = match outcome {
            Ok(response) => (StatusTransition::Complete { response }, None),
            Err(source) => (
                StatusTransition::Fail {
                    message: source.to_string(),
                },
                Some(source),
            ),
        };

        let conversation_id = draft.conversation_id;
        let _guard = self.locks.acquire(conversation_id).await;
        let mut index = self.load_index(conversation_id).await?;
        let Some(mut node) = index.get(draft.id).cloned() else {
            tracing::warn!(
                conversation_id = %conversation_id,
                node_id = %draft.id,
                "draft deleted before its generation resolved"
            );
            return NotFoundSnafu {
                stage: "generation-draft-lookup",
                entity: "node",
                id: draft.id.to_string(),
            }
            .fail();
        };

        let attempted = transition.name();
        apply_transition(&mut node, transition, self.clock.now_ms()).map_err(|rejection| {
            CoreError::InvalidTransition {
                stage: "generation-transition",
                node_id: draft.id,
                from: rejection.from_status(),
                attempted,
            }
        })?;

        self.store
            .put_node(node.clone())
            .await
            .map_err(store_write_failure("generation-put-node"))?;
        index.upsert(node.clone());
        self.cache.publish(index).await;

        match failure {
            None => {
                tracing::info!(
                    conversation_id = %conversation_id,
                    node_id = %node.id,
                    model_id = %node.model_id,
                    "generation completed"
                );
                Ok(node)
            }
            Some(source) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    node_id = %node.id,
                    model_id = %node.model_id,
                    error = %source,
                    "generation failed"
                );
                Err(CoreError::Provider {
                    stage: "generation-provider",
                    node_id: node.id,
                    source,
                })
            }
        }
    }

    async fn apply_deletion(
        &self,
        mut index: TreeIndex,
        plan: DeletionPlan,
        stage: &'static str,
    ) -> CoreResult<Vec<NodeId>> {
        let conversation_id = index.scope();

        if plan.removes_scope {
            self.remove_scope(conversation_id).await?;
        } else if !plan.is_empty() {
            self.store
                .delete_nodes(plan.doomed.clone())
                .await
                .context(StoreUnavailableSnafu { stage })?;
            index.remove(&plan.doomed);
            self.cache.publish(index).await;
        }

        tracing::info!(
            conversation_id = %conversation_id,
            target_id = %plan.target,
            removed = plan.doomed.len(),
            removes_scope = plan.removes_scope,
            stage,
            "nodes deleted"
        );
        Ok(plan.doomed)
    }

    async fn remove_scope(&self, conversation_id: ConversationId) -> CoreResult<()> {
        self.store
            .delete_conversation(conversation_id)
            .await
            .context(StoreUnavailableSnafu {
                stage: "delete-conversation",
            })?;
        self.cache.evict(conversation_id).await;
        self.locks.release(conversation_id).await;
        tracing::info!(conversation_id = %conversation_id, "conversation deleted");
        Ok(())
    }
}
