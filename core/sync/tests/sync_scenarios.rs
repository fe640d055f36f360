//! End-to-end sync scenarios against an in-memory remote.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use strata_common::{Node, NodePath};
use strata_storage::{JsonFileStore, MemoryRemote, MemoryStore, Method, NodeStore, Status};
use strata_sync::{
    Access, AccessMode, Caching, LocalCache, MaxAge, Origin, SyncConfig, SyncMode, SyncRequest,
    SyncScheduler, SyncedStore, Synchronizer,
};

fn p(s: &str) -> NodePath {
    NodePath::parse(s).unwrap()
}

fn drain<E: Clone>(rx: &mut broadcast::Receiver<E>) -> Vec<E> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

struct Client {
    local: Arc<LocalCache>,
    remote: Arc<MemoryRemote>,
    caching: Arc<Caching>,
    sync: Synchronizer,
    store: SyncedStore,
}

fn client_with(store: Arc<dyn NodeStore>, remote: Arc<MemoryRemote>) -> Client {
    let config = SyncConfig::default();
    let local = Arc::new(LocalCache::new(store, &config));
    let access = Arc::new(Access::new());
    access.claim("*", AccessMode::ReadWrite).unwrap();
    let caching = Arc::new(Caching::with_access(access.clone()));
    let sync = Synchronizer::new(
        local.clone(),
        remote.clone(),
        caching.clone(),
        access,
        config.clone(),
    );
    let store = SyncedStore::new(remote.clone(), config)
        .with_local(local.clone())
        .with_synchronizer(sync.clone());
    Client {
        local,
        remote,
        caching,
        sync,
        store,
    }
}

fn client() -> Client {
    client_with(Arc::new(MemoryStore::new()), Arc::new(MemoryRemote::new()))
}

async fn cached_node(local: &LocalCache, path: &NodePath) -> Option<Node> {
    local
        .store()
        .get_nodes(std::slice::from_ref(path))
        .await
        .unwrap()
        .remove(path)
        .flatten()
}

#[tokio::test]
async fn test_create_sync_conflict() {
    let c = client();
    let note = p("/note");

    c.store.put(&note, b"v1".to_vec(), "text/plain").await.unwrap();
    let first = c.sync.sync_until_done().await.unwrap();
    assert!(first.completed);

    let create = &c.remote.requests()[0];
    assert_eq!(create.method, Method::Put);
    assert_eq!(create.options.if_none_match.as_deref(), Some("*"));
    let r1 = c.remote.revision(&note).unwrap();
    let synced = cached_node(&c.local, &note).await.unwrap();
    assert_eq!(synced.common.revision.as_deref(), Some(r1.as_str()));
    assert_eq!(synced.common.content(), Some(&b"v1"[..]));

    c.store.put(&note, b"v2".to_vec(), "text/plain").await.unwrap();
    let r2 = c.remote.set_document(&note, "v3", "text/plain");
    assert_ne!(r1, r2);

    let mut changes = c.local.subscribe();
    c.sync.sync_until_done().await.unwrap();

    let conflicts: Vec<_> = drain(&mut changes)
        .into_iter()
        .filter(|e| e.origin == Origin::Conflict)
        .collect();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].old_value.as_deref(), Some(&b"v2"[..]));
    assert_eq!(conflicts[0].new_value.as_deref(), Some(&b"v3"[..]));
    assert_eq!(conflicts[0].last_common_value.as_deref(), Some(&b"v1"[..]));

    let resolved = cached_node(&c.local, &note).await.unwrap();
    assert_eq!(resolved.common.content(), Some(&b"v3"[..]));
    assert_eq!(resolved.common.revision.as_deref(), Some(r2.as_str()));
    assert!(resolved.local.is_none());
    assert!(resolved.remote.is_none());

    let got = c.store.get(&note, MaxAge::Ignore).await.unwrap();
    assert_eq!(got.body.as_deref(), Some(&b"v3"[..]));
}

#[tokio::test]
async fn test_one_task_per_path() {
    let c = client();
    c.remote.set_latency(Duration::from_millis(100));
    let path = p("/slow");
    c.store.put(&path, b"x".to_vec(), "text/plain").await.unwrap();

    c.sync.sync().await.unwrap();
    c.sync.sync().await.unwrap();
    assert_eq!(c.sync.tasks(), vec![path.clone()]);
    assert_eq!(c.sync.running_count(), 1);
    assert!(c.sync.time_started(&path).is_some());

    let report = c.sync.sync_until_done().await.unwrap();
    assert!(report.completed);
    assert_eq!(c.remote.max_concurrent_requests(&path), 1);
    let puts = c
        .remote
        .requests()
        .into_iter()
        .filter(|r| r.method == Method::Put)
        .count();
    assert_eq!(puts, 1);
}

#[tokio::test]
async fn test_concurrent_puts_on_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::open(dir.path().join("cache.json")).await.unwrap();
    let c = client_with(Arc::new(store), Arc::new(MemoryRemote::new()));

    let (pb, pc) = (p("/a/b"), p("/a/c"));
    let (b, cc) = tokio::join!(
        c.store.put(&pb, b"b".to_vec(), "text/plain"),
        c.store.put(&pc, b"c".to_vec(), "text/plain"),
    );
    b.unwrap();
    cc.unwrap();

    let reopened = JsonFileStore::open(dir.path().join("cache.json")).await.unwrap();
    let folder = p("/a/");
    let node = reopened
        .get_nodes(std::slice::from_ref(&folder))
        .await
        .unwrap()
        .remove(&folder)
        .flatten()
        .unwrap();
    let items = node.local.unwrap().items_map.unwrap();
    assert_eq!(items.get("b"), Some(&true));
    assert_eq!(items.get("c"), Some(&true));
}

#[tokio::test]
async fn test_local_delete_reaches_remote() {
    let c = client();
    c.store.put(&p("/docs/a"), b"a".to_vec(), "text/plain").await.unwrap();
    c.store.put(&p("/docs/b"), b"b".to_vec(), "text/plain").await.unwrap();
    c.sync.sync_until_done().await.unwrap();

    c.store.delete(&p("/docs/a")).await.unwrap();
    let listing = c.store.get(&p("/docs/"), MaxAge::Ignore).await.unwrap();
    let items: serde_json::Value = serde_json::from_slice(&listing.body.unwrap()).unwrap();
    assert_eq!(items, serde_json::json!({"b": true}));

    c.sync.sync_until_done().await.unwrap();
    assert!(c.remote.document(&p("/docs/a")).is_none());
    assert!(c.remote.document(&p("/docs/b")).is_some());
    assert!(cached_node(&c.local, &p("/docs/a")).await.is_none());
}

#[tokio::test]
async fn test_caching_all_mirrors_remote_tree() {
    let c = client();
    c.remote.set_document(&p("/books/one"), "1", "text/plain");
    c.remote.set_document(&p("/books/shelf/two"), "2", "text/plain");

    let mut changes = c.local.subscribe();
    c.caching.enable(&p("/books/")).unwrap();
    for _ in 0..4 {
        c.sync.sync_until_done().await.unwrap();
    }

    for (path, body) in [("/books/one", "1"), ("/books/shelf/two", "2")] {
        let got = c.store.get(&p(path), MaxAge::Ignore).await.unwrap();
        assert_eq!(got.status, Status::OK, "{path}");
        assert_eq!(got.body.as_deref(), Some(body.as_bytes()), "{path}");
    }
    let remote_events = drain(&mut changes)
        .into_iter()
        .filter(|e| e.origin == Origin::Remote)
        .count();
    assert!(remote_events >= 2);

    // A document removed remotely disappears on the next folder refresh.
    c.remote.remove_document(&p("/books/one"));
    c.sync.sync_paths(vec![p("/books/")]).await.unwrap();
    let gone = c.store.get(&p("/books/one"), MaxAge::Ignore).await.unwrap();
    assert_eq!(gone.status, Status::NOT_FOUND);
}

#[tokio::test]
async fn test_offline_push_fails_and_recovers() {
    let c = client();
    c.store.put(&p("/a"), b"x".to_vec(), "text/plain").await.unwrap();
    c.remote.set_online(false);

    let offline = c.sync.sync_until_done().await.unwrap();
    assert!(!offline.completed);
    let pending = cached_node(&c.local, &p("/a")).await.unwrap();
    assert!(pending.push.is_none());
    assert!(pending.local.is_some());

    c.remote.set_online(true);
    let online = c.sync.sync_until_done().await.unwrap();
    assert!(online.completed);
    assert!(c.remote.document(&p("/a")).is_some());
}

#[tokio::test]
async fn test_scheduler_drives_synchronizer() {
    let c = client();
    let (scheduler, handle) = SyncScheduler::new(SyncMode::OnDemand);
    let sync = c.sync.clone();
    let task = tokio::spawn(
        handle
            .with_changes(c.local.subscribe_diffs())
            .run(move |request| {
                let sync = sync.clone();
                async move {
                    match request {
                        SyncRequest::Paths(paths) => sync.sync_paths(paths).await,
                        _ => sync.sync_until_done().await,
                    }
                }
            }),
    );

    c.store.put(&p("/auto"), b"x".to_vec(), "text/plain").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(c.remote.document(&p("/auto")).is_some());

    let report = scheduler.request_sync().await.unwrap();
    assert!(report.completed);

    scheduler.shutdown().await;
    task.await.unwrap();
}
