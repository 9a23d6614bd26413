use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ConversationId, NodeId};
use super::types::{
    ConversationRecord, NewConversation, NodeRecord, NodeStatus, creation_order,
    unix_timestamp_millis,
};
use super::{BoxFuture, ConversationStore, NodeStore, Storage};

const NODE_COLUMNS: &str = "id, conversation_id, parent_id, root_id, depth, title, summary, prompt, response, model_id, status, error, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportWarning {
    pub node_id: NodeId,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportReport {
    pub imported_conversations: usize,
    pub imported_nodes: usize,
    pub skipped_nodes: usize,
    pub warnings: Vec<ImportWarning>,
    pub already_migrated: bool,
}

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One long-lived connection: keeps `:memory:` databases alive and serializes writers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite node store ready");
        Ok(Self { pool })
    }

    /// Copies every conversation and node of `source` into this database.
    ///
    /// Idempotent: once the database holds any conversation the import is treated as
    /// applied. Nodes whose parent cannot be resolved are skipped and reported.
    pub async fn import_from(&self, source: &dyn Storage) -> StorageResult<ImportReport> {
        let existing = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM conversations")
            .fetch_one(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "import-count-existing-conversations",
            })?;
        if existing > 0 {
            return Ok(ImportReport {
                already_migrated: true,
                ..ImportReport::default()
            });
        }

        let conversations = source.list_conversations().await?;
        let (nodes, cyclic) = parents_first(source.list_nodes(None).await?);

        let conversation_ids = conversations
            .iter()
            .map(|conversation| conversation.id)
            .collect::<HashSet<_>>();
        let mut inserted = HashSet::new();
        let mut warnings = Vec::new();

        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "import-begin",
        })?;

        for conversation in &conversations {
            insert_conversation(&mut tx, conversation, "import-insert-conversation").await?;
        }

        for node in &nodes {
            let reason = if !conversation_ids.contains(&node.conversation_id) {
                Some("missing-conversation")
            } else if node
                .parent_id
                .is_some_and(|parent_id| !inserted.contains(&parent_id))
            {
                Some("missing-parent")
            } else {
                None
            };

            if let Some(reason) = reason {
                tracing::warn!(node_id = %node.id, reason, "skipping node during import");
                warnings.push(ImportWarning {
                    node_id: node.id,
                    reason,
                });
                continue;
            }

            upsert_node(&mut tx, node, "import-insert-node").await?;
            inserted.insert(node.id);
        }

        for node in &cyclic {
            tracing::warn!(node_id = %node.id, "skipping node on a parent cycle during import");
            warnings.push(ImportWarning {
                node_id: node.id,
                reason: "parent-cycle",
            });
        }

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "import-commit",
        })?;

        Ok(ImportReport {
            imported_conversations: conversations.len(),
            imported_nodes: inserted.len(),
            skipped_nodes: warnings.len(),
            warnings,
            already_migrated: false,
        })
    }
}

impl NodeStore for SqliteStorage {
    fn get_node(&self, node_id: NodeId) -> BoxFuture<'_, StorageResult<Option<NodeRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, NodeRow>(&format!(
                "SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?"
            ))
            .bind(node_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "node-get-query",
            })?;

            row.map(node_row_to_record).transpose()
        })
    }

    fn list_nodes(
        &self,
        scope: Option<ConversationId>,
    ) -> BoxFuture<'_, StorageResult<Vec<NodeRecord>>> {
        Box::pin(async move {
            let rows = match scope {
                Some(conversation_id) => {
                    sqlx::query_as::<_, NodeRow>(&format!(
                        "SELECT {NODE_COLUMNS} FROM nodes WHERE conversation_id = ? ORDER BY created_at ASC, id ASC"
                    ))
                    .bind(conversation_id.to_string())
                    .fetch_all(&self.pool)
                    .await
                }
                None => {
                    sqlx::query_as::<_, NodeRow>(&format!(
                        "SELECT {NODE_COLUMNS} FROM nodes ORDER BY created_at ASC, id ASC"
                    ))
                    .fetch_all(&self.pool)
                    .await
                }
            }
            .context(SqliteQuerySnafu {
                stage: "node-list-query",
            })?;

            rows.into_iter().map(node_row_to_record).collect()
        })
    }

    fn put_node(&self, node: NodeRecord) -> BoxFuture<'_, StorageResult<NodeRecord>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "node-put-begin",
            })?;
            put_checked(&mut tx, &node).await?;
            tx.commit().await.context(SqliteQuerySnafu {
                stage: "node-put-commit",
            })?;

            Ok(node)
        })
    }

    fn put_nodes(
        &self,
        nodes: Vec<NodeRecord>,
    ) -> BoxFuture<'_, StorageResult<Vec<NodeRecord>>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "node-put-batch-begin",
            })?;
            // An early return drops `tx`, which rolls the whole batch back.
            for node in &nodes {
                put_checked(&mut tx, node).await?;
            }
            tx.commit().await.context(SqliteQuerySnafu {
                stage: "node-put-batch-commit",
            })?;

            tracing::debug!(count = nodes.len(), "stored node batch");
            Ok(nodes)
        })
    }

    fn delete_node(&self, node_id: NodeId) -> BoxFuture<'_, StorageResult<()>> {
        self.delete_nodes(vec![node_id])
    }

    fn delete_nodes(&self, node_ids: Vec<NodeId>) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "node-delete-begin",
            })?;

            // Children go through ON DELETE CASCADE; the whole batch commits or none of it does.
            for node_id in &node_ids {
                sqlx::query("DELETE FROM nodes WHERE id = ?")
                    .bind(node_id.to_string())
                    .execute(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "node-delete-apply",
                    })?;
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "node-delete-commit",
            })?;

            tracing::debug!(count = node_ids.len(), "deleted node batch");
            Ok(())
        })
    }
}

impl ConversationStore for SqliteStorage {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let record = input.into_record(unix_timestamp_millis());
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "conversation-create-begin",
            })?;

            let duplicate = sqlx::query_scalar::<_, i64>(
                "SELECT 1 FROM conversations WHERE id = ? LIMIT 1",
            )
            .bind(record.id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-duplicate-check",
            })?
            .is_some();
            if duplicate {
                return ConflictSnafu {
                    stage: "conversation-create-duplicate",
                    entity: "conversation",
                    details: format!("conversation '{}' already exists", record.id),
                }
                .fail();
            }

            insert_conversation(&mut tx, &record, "conversation-create-insert").await?;
            tx.commit().await.context(SqliteQuerySnafu {
                stage: "conversation-create-commit",
            })?;

            Ok(record)
        })
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, created_at FROM conversations WHERE id = ?",
            )
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-get-query",
            })?;

            row.map(conversation_row_to_record).transpose()
        })
    }

    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, created_at FROM conversations ORDER BY created_at DESC, id DESC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "conversation-delete-begin",
            })?;

            // Deepest rows first so no single delete fans out into a deep cascade chain.
            let node_ids = sqlx::query_scalar::<_, String>(
                "SELECT id FROM nodes WHERE conversation_id = ? ORDER BY depth DESC, created_at DESC",
            )
            .bind(conversation_id.to_string())
            .fetch_all(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-delete-list-nodes",
            })?;
            for node_id in &node_ids {
                sqlx::query("DELETE FROM nodes WHERE id = ?")
                    .bind(node_id.as_str())
                    .execute(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "conversation-delete-nodes",
                    })?;
            }

            sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(conversation_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete-apply",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "conversation-delete-commit",
            })?;

            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct NodeRow {
    id: String,
    conversation_id: String,
    parent_id: Option<String>,
    root_id: String,
    depth: i64,
    title: String,
    summary: String,
    prompt: Option<String>,
    response: Option<String>,
    model_id: String,
    status: String,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        title: row.title,
        created_at_ms: i64_to_u64(row.created_at, "conversation-row-created-at")?,
    })
}

fn node_row_to_record(row: NodeRow) -> StorageResult<NodeRecord> {
    Ok(NodeRecord {
        id: NodeId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        parent_id: row.parent_id.as_deref().map(NodeId::parse).transpose()?,
        root_id: NodeId::parse(&row.root_id)?,
        depth: i64_to_u32(row.depth, "node-row-depth")?,
        title: row.title,
        summary: row.summary,
        prompt: row.prompt,
        response: row.response,
        model_id: row.model_id,
        status: NodeStatus::parse(&row.status)?,
        error: row.error,
        created_at_ms: i64_to_u64(row.created_at, "node-row-created-at")?,
        updated_at_ms: i64_to_u64(row.updated_at, "node-row-updated-at")?,
    })
}

async fn insert_conversation(
    tx: &mut Transaction<'_, Sqlite>,
    record: &ConversationRecord,
    stage: &'static str,
) -> StorageResult<()> {
    sqlx::query("INSERT INTO conversations (id, title, created_at) VALUES (?, ?, ?)")
        .bind(record.id.to_string())
        .bind(record.title.as_str())
        .bind(u64_to_i64(record.created_at_ms, stage)?)
        .execute(&mut **tx)
        .await
        .context(SqliteQuerySnafu { stage })?;

    Ok(())
}

async fn put_checked(tx: &mut Transaction<'_, Sqlite>, node: &NodeRecord) -> StorageResult<()> {
    let conversation_exists =
        sqlx::query_scalar::<_, i64>("SELECT 1 FROM conversations WHERE id = ? LIMIT 1")
            .bind(node.conversation_id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "node-put-conversation-exists",
            })?
            .is_some();
    if !conversation_exists {
        return NotFoundSnafu {
            stage: "node-put-conversation-missing",
            entity: "conversation",
            id: node.conversation_id.to_string(),
        }
        .fail();
    }

    if let Some(parent_id) = node.parent_id {
        sqlx::query_scalar::<_, i64>("SELECT 1 FROM nodes WHERE id = ? LIMIT 1")
            .bind(parent_id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "node-put-parent-exists",
            })?
            .context(NotFoundSnafu {
                stage: "node-put-parent-missing",
                entity: "node",
                id: parent_id.to_string(),
            })?;
    }

    upsert_node(tx, node, "node-put-upsert").await
}

async fn upsert_node(
    tx: &mut Transaction<'_, Sqlite>,
    node: &NodeRecord,
    stage: &'static str,
) -> StorageResult<()> {
    // ON CONFLICT ... DO UPDATE rather than INSERT OR REPLACE: REPLACE deletes the old row
    // first, which would fire the parent cascade and wipe the node's subtree.
    sqlx::query(&format!(
        "INSERT INTO nodes ({NODE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
         conversation_id = excluded.conversation_id, parent_id = excluded.parent_id, \
         root_id = excluded.root_id, depth = excluded.depth, title = excluded.title, \
         summary = excluded.summary, prompt = excluded.prompt, response = excluded.response, \
         model_id = excluded.model_id, status = excluded.status, error = excluded.error, \
         updated_at = excluded.updated_at"
    ))
    .bind(node.id.to_string())
    .bind(node.conversation_id.to_string())
    .bind(node.parent_id.map(|parent_id| parent_id.to_string()))
    .bind(node.root_id.to_string())
    .bind(i64::from(node.depth))
    .bind(node.title.as_str())
    .bind(node.summary.as_str())
    .bind(node.prompt.as_deref())
    .bind(node.response.as_deref())
    .bind(node.model_id.as_str())
    .bind(node.status.as_str())
    .bind(node.error.as_deref())
    .bind(u64_to_i64(node.created_at_ms, stage)?)
    .bind(u64_to_i64(node.updated_at_ms, stage)?)
    .execute(&mut **tx)
    .await
    .context(SqliteQuerySnafu { stage })?;

    Ok(())
}

/// Orders nodes so each one follows its parent, walking parent links rather than trusting
/// stored depths. Nodes only reachable through a parent cycle are returned separately.
fn parents_first(nodes: Vec<NodeRecord>) -> (Vec<NodeRecord>, Vec<NodeRecord>) {
    let known = nodes.iter().map(|node| node.id).collect::<HashSet<_>>();
    let mut children: HashMap<NodeId, Vec<NodeRecord>> = HashMap::new();
    let mut ready = VecDeque::new();

    for node in nodes {
        match node.parent_id {
            Some(parent_id) if known.contains(&parent_id) => {
                children.entry(parent_id).or_default().push(node);
            }
            _ => ready.push_back(node),
        }
    }

    let mut ordered = Vec::with_capacity(known.len());
    while let Some(node) = ready.pop_front() {
        if let Some(waiting) = children.remove(&node.id) {
            ready.extend(waiting);
        }
        ordered.push(node);
    }

    let mut cyclic = children.into_values().flatten().collect::<Vec<_>>();
    cyclic.sort_by(creation_order);
    (ordered, cyclic)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value.try_into().map_err(|_| StorageError::InvariantViolation {
        stage,
        details: format!("negative sqlite integer '{value}' cannot map to u64"),
    })
}

fn i64_to_u32(value: i64, stage: &'static str) -> StorageResult<u32> {
    value.try_into().map_err(|_| StorageError::InvariantViolation {
        stage,
        details: format!("sqlite integer '{value}' cannot map to u32"),
    })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value.try_into().map_err(|_| StorageError::InvariantViolation {
        stage,
        details: format!("u64 '{value}' cannot map to sqlite i64"),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
