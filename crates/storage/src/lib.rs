pub mod error;
pub mod ids;
pub mod local;
pub mod sqlite;
pub mod types;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, NodeId};
pub use local::LocalStore;
pub use sqlite::{ImportReport, ImportWarning, SqliteStorage};
pub use types::{
    ConversationRecord, DEFAULT_CONVERSATION_TITLE, NewConversation, NodeRecord, NodeStatus,
    creation_order, unix_timestamp_millis,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Keyed node persistence shared by the durable and the local backend.
pub trait NodeStore: Send + Sync {
    fn get_node(&self, node_id: NodeId) -> BoxFuture<'_, StorageResult<Option<NodeRecord>>>;
    /// Nodes ordered by creation time, ties broken by id.
    fn list_nodes(
        &self,
        scope: Option<ConversationId>,
    ) -> BoxFuture<'_, StorageResult<Vec<NodeRecord>>>;
    /// Inserts or fully replaces by id. Replacing never removes the node's children.
    fn put_node(&self, node: NodeRecord) -> BoxFuture<'_, StorageResult<NodeRecord>>;
    /// Puts every node in order as one atomic write; a rejected node rejects the batch.
    fn put_nodes(
        &self,
        nodes: Vec<NodeRecord>,
    ) -> BoxFuture<'_, StorageResult<Vec<NodeRecord>>>;
    fn delete_node(&self, node_id: NodeId) -> BoxFuture<'_, StorageResult<()>>;
    /// Removes every listed node in one atomic write.
    fn delete_nodes(&self, node_ids: Vec<NodeId>) -> BoxFuture<'_, StorageResult<()>>;
}

pub trait ConversationStore: Send + Sync {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>>;
    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>>;
    /// Newest first.
    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>>;
    /// Removes the conversation together with all of its nodes.
    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>>;
}

pub trait Storage: NodeStore + ConversationStore {}

impl<T> Storage for T where T: NodeStore + ConversationStore {}

/// Backend chosen once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSelection {
    Sqlite { database_location: String },
    /// JSON file fallback; `None` keeps everything in process memory.
    Local { path: Option<PathBuf> },
}

pub async fn open_store(selection: StoreSelection) -> StorageResult<Arc<dyn Storage>> {
    match selection {
        StoreSelection::Sqlite { database_location } => {
            tracing::info!(database_location = %database_location, "opening sqlite node store");
            let storage = SqliteStorage::open(&database_location).await?;
            Ok(Arc::new(storage))
        }
        StoreSelection::Local { path: Some(path) } => {
            tracing::info!(path = %path.display(), "opening local fallback node store");
            Ok(Arc::new(LocalStore::open(path)?))
        }
        StoreSelection::Local { path: None } => {
            tracing::info!("using in-memory node store");
            Ok(Arc::new(LocalStore::in_memory()))
        }
    }
}
