mod support;

use std::sync::Arc;
use std::time::Duration;

use arbor_core::{CoreError, SessionController, TreeViolation};
use arbor_storage::{
    ConversationId, ConversationRecord, LocalStore, NodeId, NodeRecord, NodeStatus, NodeStore,
    SqliteStorage, Storage,
};

use support::{FlakyStore, ScriptedProvider, controller_over, local_controller};

fn ids(nodes: &[NodeRecord]) -> Vec<NodeId> {
    nodes.iter().map(|node| node.id).collect()
}

async fn root_and_child(controller: &SessionController) -> (NodeRecord, NodeRecord) {
    let conversation = controller
        .create_conversation("scenarios")
        .await
        .expect("conversation");
    let root = controller
        .send(conversation.id, None, "hello", "")
        .await
        .expect("send root")
        .wait()
        .await
        .expect("root resolves");
    let child = controller
        .branch(root.id, "tell me more", "")
        .await
        .expect("branch")
        .wait()
        .await
        .expect("child resolves");
    (root, child)
}

async fn run_branching_scenarios(controller: &SessionController) {
    // A: root then branch.
    let (root, c1) = root_and_child(controller).await;
    assert_eq!(root.status, NodeStatus::Completed);
    assert_eq!(root.depth, 0);
    assert_eq!(root.root_id, root.id);
    assert_eq!(c1.parent_id, Some(root.id));
    assert_eq!(c1.depth, 1);
    assert_eq!(c1.status, NodeStatus::Completed);
    assert_eq!(
        c1.response.as_deref(),
        Some("reply to tell me more after 2 turns")
    );
    assert_eq!(
        ids(&controller.get_lineage(c1.id).await.expect("lineage")),
        vec![root.id, c1.id]
    );

    // B: clone is an idle sibling and leaves the source alone.
    let c2 = controller.clone_node(c1.id).await.expect("clone");
    assert_eq!(c2.parent_id, Some(root.id));
    assert_eq!(c2.prompt, c1.prompt);
    assert_eq!(c2.response, None);
    assert_eq!(c2.status, NodeStatus::Idle);
    assert_eq!(controller.get_node(root.id).await.expect("root"), root);
    assert_eq!(controller.get_node(c1.id).await.expect("c1"), c1);
    assert_eq!(
        ids(&controller.get_siblings(c1.id).await.expect("siblings")),
        vec![c1.id, c2.id]
    );

    // C: grandchild, then drop c1's subtree.
    let g = controller
        .branch(c1.id, "follow-up", "")
        .await
        .expect("branch")
        .wait()
        .await
        .expect("grandchild resolves");
    assert_eq!(g.depth, 2);
    assert_eq!(g.root_id, root.id);

    let mut removed = controller.delete_subtree(c1.id).await.expect("delete");
    removed.sort();
    let mut expected = vec![c1.id, g.id];
    expected.sort();
    assert_eq!(removed, expected);

    for gone in [c1.id, g.id] {
        assert!(matches!(
            controller.get_node(gone).await,
            Err(CoreError::NotFound { .. })
        ));
    }
    assert_eq!(controller.get_node(root.id).await.expect("root"), root);
    assert_eq!(controller.get_node(c2.id).await.expect("c2"), c2);
    assert_eq!(
        ids(&controller.get_children(root.id).await.expect("children")),
        vec![c2.id]
    );
}

#[tokio::test]
async fn branching_scenarios_on_local_store() {
    run_branching_scenarios(&local_controller(ScriptedProvider::new())).await;
}

#[tokio::test]
async fn branching_scenarios_on_sqlite_store() {
    let directory = tempfile::tempdir().expect("tempdir");
    let location = directory.path().join("arbor.sqlite");
    let store = SqliteStorage::open(&location.display().to_string())
        .await
        .expect("sqlite");
    let controller = controller_over(Arc::new(store), ScriptedProvider::new());
    run_branching_scenarios(&controller).await;
}

#[tokio::test]
async fn regenerate_failure_keeps_draft_in_error() {
    let provider = ScriptedProvider::new();
    let controller = local_controller(provider.clone());
    let (root, c1) = root_and_child(&controller).await;

    provider.set_failing(true);
    let generation = controller.regenerate(c1.id, None).await.expect("regenerate");
    let draft = generation.draft().clone();
    assert_eq!(draft.parent_id, Some(root.id));
    assert_eq!(draft.prompt, c1.prompt);
    assert_eq!(draft.status, NodeStatus::Processing);

    let error = generation.wait().await.expect_err("provider failure");
    assert!(matches!(error, CoreError::Provider { node_id, .. } if node_id == draft.id));

    let stored = controller.get_node(draft.id).await.expect("draft kept");
    assert_eq!(stored.status, NodeStatus::Error);
    assert_eq!(stored.response, None);
    assert!(stored.error.is_some());
    assert_eq!(controller.get_node(c1.id).await.expect("c1"), c1);

    provider.set_failing(false);
    let retried = controller
        .regenerate(draft.id, None)
        .await
        .expect("retry")
        .wait()
        .await
        .expect("retry resolves");
    assert_eq!(retried.status, NodeStatus::Completed);
    assert_eq!(
        ids(&controller.get_siblings(c1.id).await.expect("siblings")),
        vec![c1.id, draft.id, retried.id]
    );
}

#[tokio::test]
async fn dangling_parent_truncates_lineage_and_repair_restores_tree() {
    let directory = tempfile::tempdir().expect("tempdir");
    let path = directory.path().join("tree.json");

    let conversation = ConversationRecord {
        id: ConversationId::new_v7(),
        title: "corrupted".to_string(),
        created_at_ms: 1,
    };
    let phantom = NodeId::new_v7();
    let orphan_id = NodeId::new_v7();
    let orphan = NodeRecord {
        id: orphan_id,
        conversation_id: conversation.id,
        parent_id: Some(phantom),
        root_id: phantom,
        depth: 1,
        title: "orphan".to_string(),
        summary: "orphan".to_string(),
        prompt: Some("orphan".to_string()),
        response: Some("still here".to_string()),
        model_id: "scripted/default".to_string(),
        status: NodeStatus::Completed,
        error: None,
        created_at_ms: 2,
        updated_at_ms: 2,
    };
    let leaf = NodeRecord {
        id: NodeId::new_v7(),
        parent_id: Some(orphan_id),
        depth: 2,
        title: "leaf".to_string(),
        created_at_ms: 3,
        updated_at_ms: 3,
        ..orphan.clone()
    };
    let snapshot = serde_json::json!({
        "conversations": [conversation],
        "nodes": [orphan, leaf],
    });
    std::fs::write(&path, snapshot.to_string()).expect("write corrupted store");

    let store = LocalStore::open(&path).expect("open corrupted store");
    let controller = controller_over(Arc::new(store), ScriptedProvider::new());

    let lineage = controller.get_lineage(leaf.id).await.expect("lineage");
    assert_eq!(ids(&lineage), vec![orphan.id, leaf.id]);

    let violations = controller
        .validate_scope(conversation.id)
        .await
        .expect("validate");
    assert!(violations.contains(&TreeViolation::DanglingParent {
        node_id: orphan.id,
        parent_id: phantom
    }));

    // The store refuses the clone's missing parent; that is a lookup failure, not an outage.
    assert!(matches!(
        controller.clone_node(orphan.id).await,
        Err(CoreError::NotFound { entity: "node", .. })
    ));
    assert_eq!(
        controller.get_tree(conversation.id).await.expect("tree").len(),
        2
    );

    let report = controller
        .repair_scope(conversation.id)
        .await
        .expect("repair");
    assert_eq!(report.kept_root, Some(orphan.id));
    assert!(
        controller
            .validate_scope(conversation.id)
            .await
            .expect("validate")
            .is_empty()
    );
    let repaired_leaf = controller.get_node(leaf.id).await.expect("leaf");
    assert_eq!(repaired_leaf.depth, 1);
    assert_eq!(repaired_leaf.root_id, orphan.id);
}

#[tokio::test]
async fn structural_errors_write_nothing() {
    let controller = local_controller(ScriptedProvider::new());
    let (root, c1) = root_and_child(&controller).await;
    let other = controller.create_root(None).await.expect("other root");

    assert!(matches!(
        controller.send(root.conversation_id, None, "second root", "").await,
        Err(CoreError::RootAlreadyExists { .. })
    ));
    assert!(matches!(
        controller.create_root(Some(root.conversation_id)).await,
        Err(CoreError::RootAlreadyExists { .. })
    ));
    assert!(matches!(
        controller.clone_node(root.id).await,
        Err(CoreError::RootAlreadyExists { .. })
    ));
    assert!(matches!(
        controller
            .send(other.conversation_id, Some(c1.id), "wrong tree", "")
            .await,
        Err(CoreError::CrossScopeParent { .. })
    ));
    assert!(matches!(
        controller
            .send(root.conversation_id, Some(NodeId::new_v7()), "lost", "")
            .await,
        Err(CoreError::NotFound { .. })
    ));
    assert!(matches!(
        controller.branch(c1.id, "   ", "").await,
        Err(CoreError::EmptyPrompt { .. })
    ));
    assert!(matches!(
        controller.send(ConversationId::new_v7(), None, "nowhere", "").await,
        Err(CoreError::NotFound { .. })
    ));

    let tree = controller
        .get_tree(root.conversation_id)
        .await
        .expect("tree");
    assert_eq!(tree.len(), 2);
    assert_eq!(controller.get_tree(other.conversation_id).await.expect("tree").len(), 1);
}

#[tokio::test]
async fn deleting_root_removes_conversation() {
    let controller = local_controller(ScriptedProvider::new());
    let (root, _) = root_and_child(&controller).await;

    controller.delete_subtree(root.id).await.expect("delete root");

    let conversations = controller.list_conversations().await.expect("list");
    assert!(
        conversations
            .iter()
            .all(|conversation| conversation.id != root.conversation_id)
    );
    assert!(matches!(
        controller.get_tree(root.conversation_id).await,
        Err(CoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn clear_children_keeps_node() {
    let controller = local_controller(ScriptedProvider::new());
    let (root, c1) = root_and_child(&controller).await;
    controller.clone_node(c1.id).await.expect("clone");

    let removed = controller.clear_children(root.id).await.expect("clear");
    assert_eq!(removed.len(), 2);
    assert_eq!(controller.get_node(root.id).await.expect("root"), root);
    assert!(controller.get_children(root.id).await.expect("children").is_empty());
}

#[tokio::test]
async fn generation_runs_without_holding_scope() {
    let (provider, gate) = ScriptedProvider::gated();
    let controller = local_controller(provider.clone());
    let root = controller.create_root(None).await.expect("root");

    let generation = controller
        .branch(root.id, "slow question", "")
        .await
        .expect("branch");
    let draft_id = generation.node_id();

    // The scope stays writable while the model call is parked.
    let sibling = controller
        .branch(root.id, "another", "")
        .await
        .expect("second branch");
    let clone = controller.clone_node(draft_id).await.expect("clone in flight");
    assert_eq!(
        controller.get_node(draft_id).await.expect("draft").status,
        NodeStatus::Processing
    );

    gate.add_permits(2);
    let resolved = generation.wait().await.expect("resolves");
    assert_eq!(resolved.status, NodeStatus::Completed);
    assert_eq!(
        resolved.response.as_deref(),
        Some("reply to slow question after 0 turns")
    );
    sibling.wait().await.expect("sibling resolves");
    assert_eq!(
        controller.get_node(clone.id).await.expect("clone").status,
        NodeStatus::Idle
    );
}

#[tokio::test]
async fn completion_for_deleted_draft_is_dropped() {
    let (provider, gate) = ScriptedProvider::gated();
    let controller = local_controller(provider);
    let root = controller.create_root(None).await.expect("root");

    let generation = controller
        .branch(root.id, "doomed", "")
        .await
        .expect("branch");
    let draft_id = generation.node_id();
    controller.delete_subtree(draft_id).await.expect("delete draft");

    gate.add_permits(1);
    assert!(matches!(
        generation.wait().await,
        Err(CoreError::NotFound { .. })
    ));
    assert!(matches!(
        controller.get_node(draft_id).await,
        Err(CoreError::NotFound { .. })
    ));
    assert_eq!(
        controller
            .get_tree(root.conversation_id)
            .await
            .expect("tree")
            .len(),
        1
    );
}

#[tokio::test]
async fn dropped_generation_still_resolves() {
    let controller = local_controller(ScriptedProvider::new());
    let root = controller.create_root(None).await.expect("root");

    let generation = controller
        .branch(root.id, "fire and forget", "")
        .await
        .expect("branch");
    let draft_id = generation.node_id();
    drop(generation);

    let mut status = NodeStatus::Processing;
    for _ in 0..200 {
        status = controller.get_node(draft_id).await.expect("draft").status;
        if status != NodeStatus::Processing {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(status, NodeStatus::Completed);
}

#[tokio::test]
async fn submit_sends_clone_and_edit_as_branch_forks_prompt() {
    let provider = ScriptedProvider::new();
    let controller = local_controller(provider.clone());
    let (root, c1) = root_and_child(&controller).await;

    let clone = controller.clone_node(c1.id).await.expect("clone");
    let edited = controller
        .edit_prompt(clone.id, "tell me less")
        .await
        .expect("edit prompt");
    assert_eq!(edited.prompt.as_deref(), Some("tell me less"));
    assert_eq!(edited.summary, "tell me less");
    assert!(edited.updated_at_ms >= clone.updated_at_ms);

    let submitted = controller
        .submit(clone.id)
        .await
        .expect("submit")
        .wait()
        .await
        .expect("submitted resolves");
    assert_eq!(submitted.id, clone.id);
    assert_eq!(submitted.status, NodeStatus::Completed);
    assert_eq!(
        submitted.response.as_deref(),
        Some("reply to tell me less after 2 turns")
    );
    assert!(matches!(
        controller.submit(clone.id).await,
        Err(CoreError::InvalidTransition { .. })
    ));

    let fork = controller
        .edit_as_branch(c1.id, "tell me differently", Some("openai/gpt-4o"))
        .await
        .expect("edit as branch")
        .wait()
        .await
        .expect("fork resolves");
    assert_eq!(fork.parent_id, Some(root.id));
    assert_eq!(fork.model_id, "openai/gpt-4o");
    assert_eq!(controller.get_node(c1.id).await.expect("c1"), c1);

    let leaf = controller.first_leaf(root.id).await.expect("first leaf");
    assert_eq!(leaf.id, c1.id);
}

#[tokio::test]
async fn lineage_reads_are_stable_between_writes() {
    let store: Arc<dyn Storage> = Arc::new(LocalStore::in_memory());
    let controller = controller_over(store, ScriptedProvider::new());
    let (_, c1) = root_and_child(&controller).await;

    let first = controller.get_lineage(c1.id).await.expect("lineage");
    let second = controller.get_lineage(c1.id).await.expect("lineage");
    assert_eq!(first, second);
}

#[tokio::test]
async fn failed_writes_leave_the_tree_untouched() {
    let store = FlakyStore::over(Arc::new(LocalStore::in_memory()));
    let controller = controller_over(store.clone(), ScriptedProvider::new());
    let (root, c1) = root_and_child(&controller).await;
    let before = controller
        .get_tree(root.conversation_id)
        .await
        .expect("tree")
        .nodes()
        .into_iter()
        .cloned()
        .collect::<Vec<_>>();

    store.set_failing(true);
    assert!(matches!(
        controller.branch(c1.id, "lost turn", "").await,
        Err(CoreError::StoreUnavailable { .. })
    ));
    assert!(matches!(
        controller.delete_subtree(c1.id).await,
        Err(CoreError::StoreUnavailable { .. })
    ));
    assert!(matches!(
        controller.clear_children(root.id).await,
        Err(CoreError::StoreUnavailable { .. })
    ));

    let served = controller
        .get_tree(root.conversation_id)
        .await
        .expect("tree")
        .nodes()
        .into_iter()
        .cloned()
        .collect::<Vec<_>>();
    assert_eq!(served, before);
    assert_eq!(
        store
            .list_nodes(Some(root.conversation_id))
            .await
            .expect("stored nodes"),
        before
    );

    store.set_failing(false);
    controller
        .branch(c1.id, "back online", "")
        .await
        .expect("branch")
        .wait()
        .await
        .expect("branch resolves");
    assert_eq!(controller.get_children(c1.id).await.expect("children").len(), 1);
}

#[tokio::test]
async fn failed_repair_keeps_store_and_snapshot_in_step() {
    let directory = tempfile::tempdir().expect("tempdir");
    let path = directory.path().join("tree.json");

    let conversation = ConversationRecord {
        id: ConversationId::new_v7(),
        title: "rogue roots".to_string(),
        created_at_ms: 1,
    };
    let roots = (0..3u64)
        .map(|offset| {
            let id = NodeId::new_v7();
            NodeRecord {
                id,
                conversation_id: conversation.id,
                parent_id: None,
                root_id: id,
                depth: 0,
                title: format!("root {offset}"),
                summary: "root".to_string(),
                prompt: Some(format!("root {offset}")),
                response: None,
                model_id: "scripted/default".to_string(),
                status: NodeStatus::Idle,
                error: None,
                created_at_ms: 10 + offset,
                updated_at_ms: 10 + offset,
            }
        })
        .collect::<Vec<_>>();
    let snapshot = serde_json::json!({
        "conversations": [conversation],
        "nodes": roots,
    });
    std::fs::write(&path, snapshot.to_string()).expect("write corrupted store");

    let store = FlakyStore::over(Arc::new(LocalStore::open(&path).expect("open")));
    let controller = controller_over(store.clone(), ScriptedProvider::new());
    assert!(matches!(
        controller
            .validate_scope(conversation.id)
            .await
            .expect("validate")
            .as_slice(),
        [TreeViolation::MultipleRoots { .. }, ..]
    ));

    store.set_failing(true);
    assert!(matches!(
        controller.repair_scope(conversation.id).await,
        Err(CoreError::StoreUnavailable { .. })
    ));
    let stored_roots = store
        .list_nodes(Some(conversation.id))
        .await
        .expect("stored nodes")
        .into_iter()
        .filter(NodeRecord::is_root)
        .count();
    assert_eq!(stored_roots, 3);
    assert_eq!(
        controller
            .get_tree(conversation.id)
            .await
            .expect("tree")
            .roots()
            .len(),
        stored_roots
    );

    store.set_failing(false);
    let report = controller
        .repair_scope(conversation.id)
        .await
        .expect("repair");
    assert_eq!(report.kept_root, Some(roots[0].id));
    assert_eq!(report.reparented, vec![roots[1].id, roots[2].id]);
    assert!(
        controller
            .validate_scope(conversation.id)
            .await
            .expect("validate")
            .is_empty()
    );
}
