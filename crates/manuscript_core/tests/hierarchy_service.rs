use manuscript_core::config::ConfigError;
use manuscript_core::db::open_db_in_memory;
use manuscript_core::external::memory::InMemoryExternalStore;
use manuscript_core::{
    CacheStore, CreateRequest, DocumentKind, DocumentNode, EngineConfig, ExternalStore,
    InvalidMoveReason, MetadataPatch, MirrorMode, NodeKey, Principal, Project,
    ReconciliationService, SqliteCacheStore, TreeError,
};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    cache: Arc<SqliteCacheStore>,
    external: Arc<InMemoryExternalStore>,
    service: ReconciliationService<SqliteCacheStore>,
    owner: Principal,
    project: Project,
}

fn fixture_with(config: EngineConfig) -> Fixture {
    let cache = Arc::new(SqliteCacheStore::try_new(open_db_in_memory().unwrap()).unwrap());
    let external = Arc::new(InMemoryExternalStore::new());
    let service = ReconciliationService::new(
        Arc::clone(&cache),
        Arc::clone(&external) as Arc<dyn ExternalStore>,
        config,
    )
    .unwrap();
    let owner = Principal::new("writer-1");
    let root_ref = external.add_project("Novel");
    let project = service
        .create_project(&owner, "Novel", Some(root_ref))
        .unwrap();
    Fixture {
        cache,
        external,
        service,
        owner,
        project,
    }
}

fn fixture() -> Fixture {
    fixture_with(EngineConfig {
        mirror_mode: MirrorMode::Inline,
        ..EngineConfig::default()
    })
}

async fn create(
    fx: &Fixture,
    title: &str,
    kind: DocumentKind,
    selection: Option<&DocumentNode>,
) -> DocumentNode {
    fx.service
        .create_node(
            &fx.owner,
            &CreateRequest {
                title: title.to_string(),
                kind,
                project_id: Some(fx.project.id),
                selection: selection.map(|node| node.id),
            },
        )
        .await
        .unwrap()
        .value
}

fn key(node: &DocumentNode) -> NodeKey {
    NodeKey::from(node.id)
}

/// Polls until the detached create mirror has recorded an external ref.
async fn wait_for_ref(fx: &Fixture, node_id: manuscript_core::NodeId) -> String {
    for _ in 0..200 {
        if let Some(external_ref) = fx.cache.get_node(node_id).unwrap().unwrap().external_ref {
            return external_ref;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("node {node_id} was never mirrored");
}

/// True when no cached node points at a parent that no longer exists.
fn parents_resolve(fx: &Fixture) -> bool {
    let nodes = fx.cache.list_project_nodes(fx.project.id).unwrap();
    nodes.iter().all(|node| {
        node.parent_id
            .map_or(true, |parent_id| nodes.iter().any(|other| other.id == parent_id))
    })
}

#[tokio::test]
async fn create_mirrors_to_external_store_with_real_kind() {
    let fx = fixture();
    let part = create(&fx, "Part One", DocumentKind::Part, None).await;
    let scene = create(&fx, "Opening", DocumentKind::Scene, Some(&part)).await;

    let part_ref = part.external_ref.clone().unwrap();
    let scene_ref = scene.external_ref.clone().unwrap();
    let external_part = fx.external.document(&part_ref).unwrap();
    assert_eq!(external_part.kind, DocumentKind::Part);
    assert_eq!(external_part.parent_ref.as_deref(), fx.project.external_ref.as_deref());
    assert_eq!(
        fx.external.document(&scene_ref).unwrap().parent_ref,
        Some(part_ref)
    );
}

#[tokio::test]
async fn create_under_leaf_selection_uses_its_parent() {
    let fx = fixture();
    let chapter = create(&fx, "Chapter", DocumentKind::Chapter, None).await;
    let scene = create(&fx, "Scene", DocumentKind::Scene, Some(&chapter)).await;
    let sibling = create(&fx, "  Next   scene ", DocumentKind::Scene, Some(&scene)).await;

    assert_eq!(sibling.parent_id, Some(chapter.id));
    assert_eq!(sibling.title, "Next scene");
    assert!(sibling.order > scene.order);
}

#[tokio::test]
async fn move_into_own_descendant_is_rejected_and_reverse_succeeds() {
    let fx = fixture();
    let a = create(&fx, "A", DocumentKind::Part, None).await;
    let b = create(&fx, "B", DocumentKind::Chapter, Some(&a)).await;

    let err = fx
        .service
        .move_node(&fx.owner, &key(&a), Some(&key(&b)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TreeError::InvalidMove {
            reason: InvalidMoveReason::Cycle,
            ..
        }
    ));
    assert_eq!(fx.cache.get_node(a.id).unwrap().unwrap().parent_id, None);

    let moved = fx
        .service
        .move_node(&fx.owner, &key(&b), None)
        .await
        .unwrap()
        .value;
    assert_eq!(moved.parent_id, None);
    let moved = fx
        .service
        .move_node(&fx.owner, &key(&b), Some(&key(&a)))
        .await
        .unwrap();
    assert!(moved.warnings.is_empty());
    assert_eq!(moved.value.parent_id, Some(a.id));
    assert_eq!(
        fx.external
            .document(b.external_ref.as_deref().unwrap())
            .unwrap()
            .parent_ref,
        a.external_ref
    );
}

#[tokio::test]
async fn move_accepts_external_refs_as_keys() {
    let fx = fixture();
    let folder = create(&fx, "Research", DocumentKind::Folder, None).await;
    let note = create(&fx, "Sources", DocumentKind::Research, None).await;

    let node_key = NodeKey::parse(note.external_ref.clone().unwrap()).unwrap();
    let parent_key = NodeKey::parse(folder.external_ref.clone().unwrap()).unwrap();
    let moved = fx
        .service
        .move_node(&fx.owner, &node_key, Some(&parent_key))
        .await
        .unwrap()
        .value;
    assert_eq!(moved.id, note.id);
    assert_eq!(moved.parent_id, Some(folder.id));
}

#[tokio::test]
async fn move_under_leaf_or_other_project_is_rejected() {
    let fx = fixture();
    let scene = create(&fx, "Scene", DocumentKind::Scene, None).await;
    let note = create(&fx, "Note", DocumentKind::Note, None).await;

    let err = fx
        .service
        .move_node(&fx.owner, &key(&note), Some(&key(&scene)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TreeError::InvalidMove {
            reason: InvalidMoveReason::TargetNotContainer,
            ..
        }
    ));

    let other = fx
        .service
        .create_project(&fx.owner, "Sequel", None)
        .unwrap();
    let foreign = fx
        .service
        .create_node(
            &fx.owner,
            &CreateRequest {
                title: "Foreign".to_string(),
                kind: DocumentKind::Folder,
                project_id: Some(other.id),
                selection: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(foreign.warnings.len(), 1);

    let err = fx
        .service
        .move_node(&fx.owner, &key(&note), Some(&key(&foreign.value)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TreeError::InvalidMove {
            reason: InvalidMoveReason::CrossProject,
            ..
        }
    ));
}

#[tokio::test]
async fn can_delete_reports_direct_children() {
    let fx = fixture();
    let chapter = create(&fx, "Chapter", DocumentKind::Chapter, None).await;
    let first = create(&fx, "First", DocumentKind::Scene, Some(&chapter)).await;
    create(&fx, "Second", DocumentKind::Scene, Some(&chapter)).await;

    let check = fx.service.can_delete(&fx.owner, &key(&chapter)).unwrap();
    assert!(!check.can_delete);
    assert_eq!(check.child_count, 2);
    assert_eq!(check.children[0].title, "First");

    fx.service
        .delete_node(&fx.owner, &key(&first), false)
        .await
        .unwrap();
    let check = fx.service.can_delete(&fx.owner, &key(&chapter)).unwrap();
    assert!(!check.can_delete);
    assert_eq!(check.child_count, 1);
}

#[tokio::test]
async fn force_delete_removes_whole_subtree_everywhere() {
    let fx = fixture();
    let part = create(&fx, "Part", DocumentKind::Part, None).await;
    let chapter = create(&fx, "Chapter", DocumentKind::Chapter, Some(&part)).await;
    create(&fx, "Scene 1", DocumentKind::Scene, Some(&chapter)).await;
    create(&fx, "Scene 2", DocumentKind::Scene, Some(&chapter)).await;
    create(&fx, "Aside", DocumentKind::Note, Some(&part)).await;
    let survivor = create(&fx, "Cast", DocumentKind::Character, None).await;

    let err = fx
        .service
        .delete_node(&fx.owner, &key(&part), false)
        .await
        .unwrap_err();
    match err {
        TreeError::NonEmptyContainer {
            descendant_count,
            children,
            ..
        } => {
            assert_eq!(descendant_count, 4);
            assert_eq!(children.len(), 2);
        }
        other => panic!("unexpected error: {other}"),
    }

    let outcome = fx
        .service
        .delete_node(&fx.owner, &key(&part), true)
        .await
        .unwrap();
    assert!(outcome.warnings.is_empty());
    assert_eq!(outcome.value.deleted_count, 5);
    assert_eq!(outcome.value.removed.last(), Some(&part.id));

    let remaining = fx.cache.list_project_nodes(fx.project.id).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, survivor.id);
    assert!(remaining
        .iter()
        .all(|node| !manuscript_core::is_descendant(part.id, node.id, &remaining)));
    assert_eq!(fx.external.document_count(), 1);
}

#[tokio::test]
async fn mirror_failure_keeps_cache_write_and_returns_warning() {
    let fx = fixture();
    fx.external.set_failing(true);

    let applied = fx
        .service
        .create_node(
            &fx.owner,
            &CreateRequest {
                title: "Offline scene".to_string(),
                kind: DocumentKind::Scene,
                project_id: Some(fx.project.id),
                selection: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(applied.warnings.len(), 1);
    assert_eq!(applied.warnings[0].operation, "create_leaf_document");

    let stored = fx.cache.get_node(applied.value.id).unwrap().unwrap();
    assert_eq!(stored.external_ref, None);
    assert_eq!(fx.external.document_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_external_store_times_out_without_failing_the_request() {
    let fx = fixture_with(EngineConfig {
        mirror_mode: MirrorMode::Inline,
        external_timeout_ms: 50,
        ..EngineConfig::default()
    });
    fx.external.set_latency(Some(Duration::from_secs(30)));

    let applied = fx
        .service
        .create_node(
            &fx.owner,
            &CreateRequest {
                title: "Slow".to_string(),
                kind: DocumentKind::Folder,
                project_id: Some(fx.project.id),
                selection: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(applied.warnings.len(), 1);
    assert!(applied.warnings[0].message.contains("timed out"));
}

#[tokio::test]
async fn detached_mirror_completes_in_background() {
    let fx = fixture_with(EngineConfig::default());
    let applied = fx
        .service
        .create_node(
            &fx.owner,
            &CreateRequest {
                title: "Background".to_string(),
                kind: DocumentKind::Note,
                project_id: Some(fx.project.id),
                selection: None,
            },
        )
        .await
        .unwrap();
    assert!(applied.warnings.is_empty());

    let mut mirrored = None;
    for _ in 0..100 {
        mirrored = fx.cache.get_node(applied.value.id).unwrap().unwrap().external_ref;
        if mirrored.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let mirrored = mirrored.expect("detached mirror should record the external ref");
    assert_eq!(fx.external.document(&mirrored).unwrap().title, "Background");
}

#[tokio::test]
async fn non_owner_is_rejected() {
    let fx = fixture();
    let scene = create(&fx, "Scene", DocumentKind::Scene, None).await;
    let intruder = Principal::new("someone-else");

    let err = fx
        .service
        .delete_node(&intruder, &key(&scene), true)
        .await
        .unwrap_err();
    assert!(matches!(err, TreeError::Authorization { .. }));
    assert!(fx.cache.get_node(scene.id).unwrap().is_some());

    let err = fx.service.list_tree(&intruder, fx.project.id).unwrap_err();
    assert!(matches!(err, TreeError::Authorization { .. }));
}

#[tokio::test]
async fn unknown_keys_are_not_found() {
    let fx = fixture();
    let missing = NodeKey::parse("doc-does-not-exist").unwrap();
    let err = fx
        .service
        .move_node(&fx.owner, &missing, None)
        .await
        .unwrap_err();
    assert!(matches!(err, TreeError::NodeNotFound(_)));
}

#[tokio::test]
async fn content_edits_update_word_counts_and_tree_totals() {
    let fx = fixture();
    let part = create(&fx, "Part", DocumentKind::Part, None).await;
    let chapter = create(&fx, "Chapter", DocumentKind::Chapter, Some(&part)).await;
    let scene = create(&fx, "Scene", DocumentKind::Scene, Some(&chapter)).await;

    let words = |count: usize| vec!["word"; count].join(" ");
    fx.service
        .update_content(&fx.owner, &key(&part), &words(100))
        .await
        .unwrap();
    fx.service
        .update_content(&fx.owner, &key(&chapter), &words(250))
        .await
        .unwrap();
    let edited = fx
        .service
        .update_content(&fx.owner, &key(&scene), &words(50))
        .await
        .unwrap()
        .value;
    assert_eq!(edited.word_count, 50);
    assert!(edited.last_edited_at.is_some());
    assert_eq!(
        fx.external
            .content(edited.external_ref.as_deref().unwrap())
            .unwrap(),
        words(50)
    );

    let tree = fx.service.list_tree(&fx.owner, fx.project.id).unwrap();
    assert_eq!(tree.word_totals[&part.id], 400);
    assert_eq!(tree.word_totals[&chapter.id], 300);
}

#[tokio::test]
async fn metadata_patch_is_validated_and_mirrored() {
    let fx = fixture();
    let scene = create(&fx, "Scene", DocumentKind::Scene, None).await;

    let err = fx
        .service
        .update_metadata(&fx.owner, &key(&scene), &MetadataPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TreeError::Validation(_)));

    let err = fx
        .service
        .update_metadata(
            &fx.owner,
            &key(&scene),
            &MetadataPatch {
                title: Some("   ".to_string()),
                ..MetadataPatch::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TreeError::Validation(_)));

    let updated = fx
        .service
        .update_metadata(
            &fx.owner,
            &key(&scene),
            &MetadataPatch {
                title: Some("The  Storm".to_string()),
                synopsis: Some("Rain arrives.".to_string()),
                tags: Some(vec!["weather".to_string(), "weather".to_string()]),
                ..MetadataPatch::default()
            },
        )
        .await
        .unwrap()
        .value;
    assert_eq!(updated.title, "The Storm");
    assert_eq!(updated.tags, vec!["weather"]);

    let external = fx
        .external
        .document(updated.external_ref.as_deref().unwrap())
        .unwrap();
    assert_eq!(external.title, "The Storm");
    assert_eq!(external.synopsis, "Rain arrives.");
}

#[tokio::test]
async fn concurrent_moves_of_one_node_leave_a_forest() {
    let fx = Arc::new(fixture());
    let left = create(&fx, "Left", DocumentKind::Folder, None).await;
    let right = create(&fx, "Right", DocumentKind::Folder, None).await;
    let scene = create(&fx, "Scene", DocumentKind::Scene, None).await;

    let mut handles = Vec::new();
    for target in [left.clone(), right.clone(), left.clone(), right.clone()] {
        let fx = Arc::clone(&fx);
        let scene_key = key(&scene);
        handles.push(tokio::spawn(async move {
            fx.service
                .move_node(&fx.owner, &scene_key, Some(&key(&target)))
                .await
                .map(|applied| applied.value.parent_id)
        }));
    }
    let mut applied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => applied += 1,
            Err(err) => assert!(matches!(err, TreeError::Conflict(_)), "{err}"),
        }
    }
    assert!(applied >= 1);

    let stored = fx.cache.get_node(scene.id).unwrap().unwrap();
    assert!(stored.parent_id == Some(left.id) || stored.parent_id == Some(right.id));
}

#[test]
fn zero_timeout_config_is_rejected() {
    let cache = Arc::new(SqliteCacheStore::try_new(open_db_in_memory().unwrap()).unwrap());
    let external: Arc<dyn ExternalStore> = Arc::new(InMemoryExternalStore::new());
    let result = ReconciliationService::new(
        cache,
        external,
        EngineConfig {
            external_timeout_ms: 0,
            ..EngineConfig::default()
        },
    );
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[tokio::test]
async fn external_ref_keys_resolve_within_the_callers_projects() {
    let fx = fixture();
    let mine = create(&fx, "Scene", DocumentKind::Scene, None).await;
    let shared_ref = mine.external_ref.clone().unwrap();

    let other = Principal::new("writer-2");
    let their_project = fx.service.create_project(&other, "Other", None).unwrap();
    let mut theirs = DocumentNode::new(their_project.id, None, DocumentKind::Scene, "Theirs");
    theirs.external_ref = Some(shared_ref.clone());
    let theirs = fx.cache.insert_node(&theirs).unwrap();

    let shared_key = NodeKey::parse(shared_ref).unwrap();
    assert_eq!(fx.service.resolve(&fx.owner, &shared_key).unwrap().id, mine.id);
    assert_eq!(fx.service.resolve(&other, &shared_key).unwrap().id, theirs.id);
    assert!(fx.service.can_delete(&other, &shared_key).unwrap().can_delete);
}

#[tokio::test]
async fn detached_create_mirror_follows_a_move_made_before_it_landed() {
    let fx = fixture_with(EngineConfig::default());
    let left = create(&fx, "Left", DocumentKind::Folder, None).await;
    let right = create(&fx, "Right", DocumentKind::Folder, None).await;
    wait_for_ref(&fx, left.id).await;
    let right_ref = wait_for_ref(&fx, right.id).await;

    let scene = create(&fx, "Scene", DocumentKind::Scene, Some(&left)).await;
    let moved = fx
        .service
        .move_node(&fx.owner, &key(&scene), Some(&key(&right)))
        .await
        .unwrap();
    assert!(moved.warnings.is_empty());
    assert_eq!(moved.value.parent_id, Some(right.id));

    let scene_ref = wait_for_ref(&fx, scene.id).await;
    let mut external_parent = None;
    for _ in 0..200 {
        external_parent = fx.external.document(&scene_ref).and_then(|doc| doc.parent_ref);
        if external_parent.as_deref() == Some(right_ref.as_str()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(external_parent, Some(right_ref.clone()));

    let report = fx.service.request_sync(&fx.owner, fx.project.id).await.unwrap();
    assert!(report.error.is_none());
    assert_eq!(
        fx.external.document(&scene_ref).unwrap().parent_ref,
        Some(right_ref)
    );
    assert_eq!(
        fx.cache.get_node(scene.id).unwrap().unwrap().parent_id,
        Some(right.id)
    );
}

#[tokio::test]
async fn detached_create_of_a_node_deleted_meanwhile_leaves_no_external_document() {
    let fx = fixture_with(EngineConfig::default());
    let scene = create(&fx, "Fleeting", DocumentKind::Scene, None).await;
    fx.service
        .delete_node(&fx.owner, &key(&scene), false)
        .await
        .unwrap();

    // The background create and its cleanup both finish within the polls.
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(fx.cache.get_node(scene.id).unwrap().is_none());
    assert_eq!(fx.external.document_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn move_racing_a_force_delete_of_its_container_has_one_consistent_winner() {
    for _ in 0..16 {
        let fx = Arc::new(fixture());
        let container = create(&fx, "Container", DocumentKind::Folder, None).await;
        let scene = create(&fx, "Scene", DocumentKind::Scene, Some(&container)).await;
        let shelter = create(&fx, "Shelter", DocumentKind::Folder, None).await;

        let mover = {
            let fx = Arc::clone(&fx);
            let (scene_key, shelter_key) = (key(&scene), key(&shelter));
            tokio::spawn(async move {
                fx.service
                    .move_node(&fx.owner, &scene_key, Some(&shelter_key))
                    .await
            })
        };
        let deleter = {
            let fx = Arc::clone(&fx);
            let container_key = key(&container);
            tokio::spawn(async move {
                fx.service
                    .delete_node(&fx.owner, &container_key, true)
                    .await
            })
        };
        let moved = mover.await.unwrap();
        let deleted = deleter.await.unwrap();

        for err in [moved.as_ref().err(), deleted.as_ref().err()]
            .into_iter()
            .flatten()
        {
            assert!(
                matches!(err, TreeError::Conflict(_) | TreeError::NodeNotFound(_)),
                "unexpected error: {err}"
            );
        }
        assert!(moved.is_ok() || deleted.is_ok());

        match fx.cache.get_node(scene.id).unwrap() {
            Some(stored) => {
                assert!(moved.is_ok(), "scene survived without its move winning");
                assert_eq!(stored.parent_id, Some(shelter.id));
            }
            None => {
                assert!(moved.is_err(), "moved scene was deleted with its old container");
                assert!(deleted.is_ok());
            }
        }
        assert!(parents_resolve(&fx));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn move_into_a_subtree_planned_for_deletion_makes_the_delete_conflict() {
    let fx = Arc::new(fixture());
    let part = create(&fx, "Part", DocumentKind::Part, None).await;
    let chapter = create(&fx, "Chapter", DocumentKind::Chapter, Some(&part)).await;
    let mut subtree = vec![part.id, chapter.id];
    let mut filler = 0;
    // The blocked lock must sort before the move target so the delete holds
    // nothing the move needs while it waits.
    while subtree.iter().min() == Some(&chapter.id) {
        filler += 1;
        let note = create(&fx, &format!("Note {filler}"), DocumentKind::Note, Some(&part)).await;
        subtree.push(note.id);
    }
    let first = *subtree.iter().min().unwrap();
    let stray = create(&fx, "Stray", DocumentKind::Scene, None).await;
    fx.external.set_latency(Some(Duration::from_millis(300)));

    // Inline mirrors hold the node lock until the slow external call returns.
    let blocker = {
        let fx = Arc::clone(&fx);
        tokio::spawn(async move {
            fx.service
                .update_content(&fx.owner, &NodeKey::from(first), "held")
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let deleter = {
        let fx = Arc::clone(&fx);
        let part_key = key(&part);
        tokio::spawn(async move { fx.service.delete_node(&fx.owner, &part_key, true).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let moved = fx
        .service
        .move_node(&fx.owner, &key(&stray), Some(&key(&chapter)))
        .await
        .unwrap();
    assert_eq!(moved.value.parent_id, Some(chapter.id));

    blocker.await.unwrap().unwrap();
    let err = deleter.await.unwrap().unwrap_err();
    assert!(matches!(err, TreeError::Conflict(id) if id == part.id));
    assert_eq!(
        fx.cache.get_node(stray.id).unwrap().unwrap().parent_id,
        Some(chapter.id)
    );
    assert!(fx.cache.get_node(part.id).unwrap().is_some());
    assert!(parents_resolve(&fx));
}
