//! End-to-end tests wiring providers, the coordinator and the background
//! services to in-process collaborators.

use std::sync::Arc;
use std::time::Duration;

use folio_core::api::ProjectDescriptor;
use folio_core::auth::StaticTokenSource;
use folio_core::background_worker::{BackgroundSyncWorker, OfflineProjectStore};
use folio_core::config::{SyncMode, SyncTimings};
use folio_core::connectivity::Connectivity;
use folio_core::coordinator::{NewElement, ProjectCoordinator};
use folio_core::crdt::MemoryStore;
use folio_core::media_sync::MediaAutoSync;
use folio_core::model::{Element, ElementType, SyncPhase};
use folio_core::project_key::ProjectKey;
use folio_core::provider::{
    ConnectOptions, ProviderDeps, ProviderFactory, SyncProvider, SyncProviderExt,
};
use folio_core::sync_queue::{SyncQueue, SyncStage};
use folio_core::test_utils::{MockMediaSync, MockProjectApi};
use folio_core::transport::MemoryServer;

const URL: &str = "ws://memory.test";

fn server_factory(server: &MemoryServer, token: &str) -> ProviderFactory {
    let deps = ProviderDeps::new(Arc::new(MemoryStore::new()))
        .with_transport(Arc::new(server.clone()))
        .with_tokens(Arc::new(StaticTokenSource::new(token)));
    ProviderFactory::new(SyncMode::Server, Some(URL.to_string()), deps)
}

fn key(owner: &str, slug: &str) -> ProjectKey {
    ProjectKey::new(owner, slug).unwrap()
}

#[tokio::test]
async fn offline_first_create() {
    let factory = ProviderFactory::new(
        SyncMode::Local,
        None,
        ProviderDeps::new(Arc::new(MemoryStore::new())),
    );
    let coordinator = ProjectCoordinator::from_factory(&factory);
    assert!(coordinator.load_project("alice", "novel").await.success);
    assert_eq!(coordinator.sync_phase(), SyncPhase::Offline);

    let folder = coordinator
        .add_element(NewElement::new(ElementType::Folder, "Chapters"))
        .await
        .unwrap();
    coordinator
        .add_element(NewElement::new(ElementType::Item, "Chapter 1").under(&folder.id))
        .await
        .unwrap();

    let elements = coordinator.elements();
    let levels: Vec<u32> = elements.iter().map(|e| e.level).collect();
    let orders: Vec<u32> = elements.iter().map(|e| e.order).collect();
    let expandable: Vec<bool> = elements.iter().map(|e| e.expandable).collect();
    assert_eq!(levels, vec![0, 1]);
    assert_eq!(orders, vec![0, 1]);
    assert_eq!(expandable, vec![true, false]);
    assert!(elements.iter().all(|e| e.parent_id.is_none()));
}

#[tokio::test(start_paused = true)]
async fn optimistic_update_survives_reconnect() {
    let server = MemoryServer::new().with_token("t");
    let provider = server_factory(&server, "t").create();
    assert!(provider.connect(ConnectOptions::new("alice", "novel")).await.success);
    assert_eq!(provider.sync_phase(), SyncPhase::Synced);

    let written: Vec<Element> = ["e1", "e2", "e3"]
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let mut element = Element::new(ElementType::Item, *name);
            element.order = i as u32;
            element
        })
        .collect();
    provider.update_elements(written.clone());
    assert_eq!(provider.get_elements(), written);

    server.drop_connections(Some("network change"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(provider.sync_phase(), SyncPhase::Offline);
    assert_eq!(provider.get_elements(), written);

    // First backoff step is one second
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(provider.sync_phase(), SyncPhase::Synced);
    assert_eq!(provider.get_elements(), written);

    // A late peer seeds its own README before the first sync, then merges
    let peer = server_factory(&server, "t").create();
    assert!(peer.connect(ConnectOptions::new("alice", "novel")).await.success);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let names: Vec<String> = peer
        .get_elements()
        .into_iter()
        .map(|e| e.name)
        .filter(|name| name != folio_core::crdt::DEFAULT_ELEMENT_NAME)
        .collect();
    assert_eq!(names, vec!["e1", "e2", "e3"]);
}

#[tokio::test(start_paused = true)]
async fn access_denied_is_final() {
    let server = MemoryServer::new().with_token("good");
    let coordinator = ProjectCoordinator::from_factory(&server_factory(&server, "stale"));

    let result = coordinator.load_project("alice", "novel").await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("invalid-token"));
    assert_eq!(coordinator.sync_phase(), SyncPhase::Unavailable);
    assert!(coordinator.error().is_some());

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(server.open_count(), 1);
    assert_eq!(coordinator.sync_phase(), SyncPhase::Unavailable);
}

#[tokio::test(start_paused = true)]
async fn bulk_sync_with_one_failure() {
    let api = MockProjectApi::new("alice")
        .with_project(ProjectDescriptor::new("alice", "p1", "One"))
        .with_project(ProjectDescriptor::new("alice", "p2", "Two"));
    api.fail_get(&key("alice", "p1"));
    let queue = SyncQueue::new(
        Arc::new(api.clone()),
        Connectivity::default(),
        SyncMode::Server,
        SyncTimings::default(),
    );

    let state = queue
        .sync_all_projects(vec![key("alice", "p1"), key("alice", "p2")])
        .await
        .unwrap();
    assert_eq!((state.total, state.completed, state.failed), (2, 1, 1));

    let summary = queue.summary();
    assert_eq!(summary[0].stage, SyncStage::Failed);
    assert!(summary[0].error.is_some());
    assert_eq!(summary[1].stage, SyncStage::Completed);
    assert!(summary.iter().all(|s| s.stage.is_terminal()));
}

#[tokio::test(start_paused = true)]
async fn media_notifications_debounce_into_one_sync() {
    let server = MemoryServer::new().with_token("t");
    let media = MockMediaSync::new();
    let auto_sync = MediaAutoSync::new(
        Arc::new(media.clone()),
        SyncMode::Server,
        Some(URL.to_string()),
        Arc::new(server.clone()),
        Arc::new(StaticTokenSource::new("t")),
        Connectivity::default(),
        SyncTimings::default(),
    );
    let project = key("alice", "novel");
    auto_sync.start_auto_sync(project.clone());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(media.full_sync_count(), 1);

    for (i, file) in ["a.png", "b.png", "c.png"].iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        assert_eq!(server.notify_media(&project, file, "uploaded"), 1);
    }
    let last_event = tokio::time::Instant::now();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(media.full_sync_count(), 2);
    assert_eq!(media.full_sync_times()[1] - last_event, Duration::from_secs(2));
    auto_sync.stop();
}

#[tokio::test(start_paused = true)]
async fn background_worker_creates_offline_project() {
    let api = MockProjectApi::new("alice");
    let connectivity = Connectivity::new(false);
    let projects = OfflineProjectStore::new(Arc::new(MemoryStore::new()));
    projects
        .create_offline(ProjectDescriptor::new("alice", "draft", "Draft"))
        .unwrap();

    let worker = BackgroundSyncWorker::new(
        projects.clone(),
        Arc::new(api.clone()),
        connectivity.clone(),
        SyncMode::Server,
    );
    worker.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(api.created().is_empty());

    connectivity.set_online(true);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(api.created().len(), 1);
    let local = projects.get(&key("alice", "draft")).unwrap().unwrap();
    assert!(!local.pending_creation);
    assert!(local.project.id.is_some());
    worker.stop();
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_store_keeps_tree_between_sessions() {
    use folio_core::crdt::SqliteStore;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("folio.db");

    let factory = ProviderFactory::new(
        SyncMode::Local,
        None,
        ProviderDeps::new(Arc::new(SqliteStore::open(&path).unwrap())),
    );
    let coordinator = ProjectCoordinator::from_factory(&factory);
    coordinator.load_project("alice", "novel").await;
    let item = coordinator
        .add_element(NewElement::new(ElementType::Item, "Outline"))
        .await
        .unwrap();
    coordinator.disconnect();
    drop(coordinator);

    let factory = ProviderFactory::new(
        SyncMode::Local,
        None,
        ProviderDeps::new(Arc::new(SqliteStore::open(&path).unwrap())),
    );
    let coordinator = ProjectCoordinator::from_factory(&factory);
    coordinator.load_project("alice", "novel").await;
    assert_eq!(coordinator.elements(), vec![item]);
}
