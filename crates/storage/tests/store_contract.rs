use std::time::Duration;

use arbor_storage::{
    ConversationId, LocalStore, NewConversation, NodeId, NodeRecord, NodeStatus, SqliteStorage,
    Storage, StorageError,
};

fn node(conversation_id: ConversationId, parent: Option<&NodeRecord>, at: u64) -> NodeRecord {
    let id = NodeId::new_v7();
    NodeRecord {
        id,
        conversation_id,
        parent_id: parent.map(|parent| parent.id),
        root_id: parent.map_or(id, |parent| parent.root_id),
        depth: parent.map_or(0, |parent| parent.depth + 1),
        title: "Prompt".to_string(),
        summary: "Prompt".to_string(),
        prompt: Some("prompt".to_string()),
        response: None,
        model_id: "openrouter/auto".to_string(),
        status: NodeStatus::Idle,
        error: None,
        created_at_ms: at,
        updated_at_ms: at,
    }
}

async fn ids_in(store: &dyn Storage, conversation_id: ConversationId) -> Vec<NodeId> {
    store
        .list_nodes(Some(conversation_id))
        .await
        .expect("list")
        .into_iter()
        .map(|node| node.id)
        .collect()
}

/// Behaviour every backend must share; callers never branch on which one they hold.
async fn check_contract(store: &dyn Storage) {
    let older = store
        .create_conversation(NewConversation::titled("older"))
        .await
        .expect("older conversation");
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newer = store
        .create_conversation(NewConversation::titled("newer"))
        .await
        .expect("newer conversation");
    let listed = store
        .list_conversations()
        .await
        .expect("list conversations")
        .into_iter()
        .map(|conversation| conversation.id)
        .collect::<Vec<_>>();
    assert_eq!(listed, vec![newer.id, older.id]);

    let duplicate = store
        .create_conversation(NewConversation {
            id: Some(older.id),
            title: "again".to_string(),
        })
        .await
        .expect_err("duplicate id");
    assert!(matches!(duplicate, StorageError::Conflict { .. }));

    // Creation time first, id breaks ties.
    let conversation_id = older.id;
    let root = node(conversation_id, None, 10);
    let mut twins = [
        node(conversation_id, Some(&root), 20),
        node(conversation_id, Some(&root), 20),
    ];
    let late = node(conversation_id, Some(&root), 30);
    store.put_node(root.clone()).await.expect("root");
    store.put_node(late.clone()).await.expect("late");
    store.put_node(twins[1].clone()).await.expect("twin");
    store.put_node(twins[0].clone()).await.expect("twin");
    twins.sort_by_key(|twin| twin.id);
    assert_eq!(
        ids_in(store, conversation_id).await,
        vec![root.id, twins[0].id, twins[1].id, late.id]
    );

    // Replacing a parent keeps its subtree.
    let grandchild = node(conversation_id, Some(&late), 40);
    store.put_node(grandchild.clone()).await.expect("grandchild");
    let mut answered = late.clone();
    answered.status = NodeStatus::Completed;
    answered.response = Some("answer".to_string());
    answered.touch(50);
    store.put_node(answered.clone()).await.expect("replace");
    assert_eq!(store.get_node(late.id).await.expect("get"), Some(answered));
    assert_eq!(
        store.get_node(grandchild.id).await.expect("get"),
        Some(grandchild.clone())
    );

    // A batch lands whole or not at all.
    let before = store.list_nodes(Some(conversation_id)).await.expect("list");
    let mut retitled = root.clone();
    retitled.title = "Renamed".to_string();
    let phantom = node(conversation_id, None, 60);
    let stray = node(conversation_id, Some(&phantom), 61);
    let rejected = store
        .put_nodes(vec![retitled.clone(), stray])
        .await
        .expect_err("stray parent");
    assert!(matches!(rejected, StorageError::NotFound { entity: "node", .. }));
    assert_eq!(
        store.list_nodes(Some(conversation_id)).await.expect("list"),
        before
    );

    let branch_head = node(conversation_id, Some(&root), 70);
    let branch_tail = node(conversation_id, Some(&branch_head), 71);
    let stored = store
        .put_nodes(vec![retitled.clone(), branch_head.clone(), branch_tail.clone()])
        .await
        .expect("batch with in-batch parent");
    assert_eq!(stored.len(), 3);
    assert_eq!(store.get_node(root.id).await.expect("get"), Some(retitled));
    assert_eq!(
        store.get_node(branch_tail.id).await.expect("get"),
        Some(branch_tail.clone())
    );

    // Deleting a node takes its descendants with it.
    store
        .delete_nodes(vec![late.id, branch_head.id])
        .await
        .expect("batch delete");
    assert_eq!(
        ids_in(store, conversation_id).await,
        vec![root.id, twins[0].id, twins[1].id]
    );

    store
        .delete_conversation(conversation_id)
        .await
        .expect("delete conversation");
    assert!(ids_in(store, conversation_id).await.is_empty());
    assert_eq!(
        store.get_conversation(conversation_id).await.expect("get"),
        None
    );
    assert!(
        store
            .get_conversation(newer.id)
            .await
            .expect("get")
            .is_some()
    );
}

#[tokio::test]
async fn local_store_honours_the_contract() {
    check_contract(&LocalStore::in_memory()).await;
}

#[tokio::test]
async fn local_file_store_honours_the_contract() {
    let directory = tempfile::tempdir().expect("tempdir");
    let store = LocalStore::open(directory.path().join("tree.json")).expect("open");
    check_contract(&store).await;
}

#[tokio::test]
async fn sqlite_store_honours_the_contract() {
    let directory = tempfile::tempdir().expect("tempdir");
    let location = directory.path().join("arbor.sqlite");
    let store = SqliteStorage::open(&location.display().to_string())
        .await
        .expect("open sqlite");
    check_contract(&store).await;
}
