#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use arbor_core::SessionController;
use arbor_llm::{BoxFuture, LlmProvider, Model, ProviderError, ProviderMessage, ProviderResult};
use arbor_storage::{
    BoxFuture as StoreFuture, ConversationId, ConversationRecord, ConversationStore, LocalStore,
    NewConversation, NodeId, NodeRecord, NodeStore, Storage, StorageError, StorageResult,
};
use tokio::sync::Semaphore;

/// Deterministic provider: replies echo the last prompt and the number of history turns.
pub struct ScriptedProvider {
    models: Vec<Model>,
    failing: AtomicBool,
    calls: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            models: arbor_llm::default_models(),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            gate: None,
        })
    }

    /// Every call blocks until the returned semaphore hands out a permit.
    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let provider = Arc::new(Self {
            models: arbor_llm::default_models(),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            gate: Some(gate.clone()),
        });
        (provider, gate)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reply(messages: &[ProviderMessage]) -> String {
        let last = messages
            .last()
            .map(|message| message.content.as_str())
            .unwrap_or_default();
        format!(
            "reply to {last} after {} turns",
            messages.len().saturating_sub(1)
        )
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "scripted/default"
    }

    fn models(&self) -> &[Model] {
        &self.models
    }

    fn generate<'a>(
        &'a self,
        messages: Vec<ProviderMessage>,
        model_id: &'a str,
    ) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProviderError::EmptyCompletion {
                    stage: "scripted-provider",
                    model_id: model_id.to_string(),
                });
            }
            Ok(Self::reply(&messages))
        })
    }
}

pub fn local_controller(provider: Arc<ScriptedProvider>) -> SessionController {
    SessionController::new(Arc::new(LocalStore::in_memory()), provider)
}

pub fn controller_over(store: Arc<dyn Storage>, provider: Arc<ScriptedProvider>) -> SessionController {
    SessionController::new(store, provider)
}

/// Delegates to an inner store; while `fail_writes` is set every write fails like a full disk.
pub struct FlakyStore {
    inner: Arc<dyn Storage>,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn over(inner: Arc<dyn Storage>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    fn refuse(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteLocalStore {
                stage: "flaky-store-write",
                path: "flaky".to_string(),
                source: std::io::Error::other("disk full"),
            });
        }
        Ok(())
    }
}

impl NodeStore for FlakyStore {
    fn get_node(&self, node_id: NodeId) -> StoreFuture<'_, StorageResult<Option<NodeRecord>>> {
        self.inner.get_node(node_id)
    }

    fn list_nodes(
        &self,
        scope: Option<ConversationId>,
    ) -> StoreFuture<'_, StorageResult<Vec<NodeRecord>>> {
        self.inner.list_nodes(scope)
    }

    fn put_node(&self, node: NodeRecord) -> StoreFuture<'_, StorageResult<NodeRecord>> {
        Box::pin(async move {
            self.refuse()?;
            self.inner.put_node(node).await
        })
    }

    fn put_nodes(
        &self,
        nodes: Vec<NodeRecord>,
    ) -> StoreFuture<'_, StorageResult<Vec<NodeRecord>>> {
        Box::pin(async move {
            self.refuse()?;
            self.inner.put_nodes(nodes).await
        })
    }

    fn delete_node(&self, node_id: NodeId) -> StoreFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.refuse()?;
            self.inner.delete_node(node_id).await
        })
    }

    fn delete_nodes(&self, node_ids: Vec<NodeId>) -> StoreFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.refuse()?;
            self.inner.delete_nodes(node_ids).await
        })
    }
}

impl ConversationStore for FlakyStore {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> StoreFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            self.refuse()?;
            self.inner.create_conversation(input).await
        })
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, StorageResult<Option<ConversationRecord>>> {
        self.inner.get_conversation(conversation_id)
    }

    fn list_conversations(&self) -> StoreFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        self.inner.list_conversations()
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.refuse()?;
            self.inner.delete_conversation(conversation_id).await
        })
    }
}
