//! Local cache layer.
//!
//! The cache is the single source of local truth. Every structural change
//! goes through [`LocalCache::transaction`], which serializes writers in
//! FIFO order so no two updates ever observe each other's intermediate
//! state.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{debug, warn};

use strata_common::{now_millis, Body, Error, ItemsMap, Node, NodeMap, NodePath, Result, Slot};
use strata_storage::{NodeStore, Response, Status};

use crate::config::{ChangeEventsConfig, SyncConfig};
use crate::events::{ChangeEvent, EventBus, Origin};

/// Freshest usable slot of a node.
///
/// Folders prefer a local listing over the common one. Documents prefer
/// local content; a pending local delete hides the common body.
pub fn get_latest(node: &Node) -> Option<&Slot> {
    if node.path.is_folder() {
        if let Some(local) = node.local.as_ref().filter(|l| l.items_map.is_some()) {
            return Some(local);
        }
        return Some(&node.common).filter(|c| c.items_map.is_some());
    }

    if let Some(local) = &node.local {
        if local.content().is_some() && local.content_type.is_some() {
            return Some(local);
        }
        if local.is_delete_marker() {
            return None;
        }
    }
    Some(&node.common).filter(|c| c.content().is_some() && c.content_type.is_some())
}

/// Whether a read of the first path in `chain` must go to the remote.
///
/// `chain` is a path followed by its ancestors. Any pending remote slot
/// makes the read stale; otherwise the first node with a fresh enough
/// latest slot makes it current.
fn is_outdated(chain: &[NodePath], nodes: &NodeMap, max_age: Duration) -> bool {
    let now = now_millis();
    let max_age = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
    for path in chain {
        let node = nodes.get(path).and_then(Option::as_ref);
        if node.is_some_and(|n| n.remote.is_some()) {
            return true;
        }
        match node.and_then(get_latest) {
            Some(latest) => {
                if latest.timestamp.is_some_and(|ts| now - ts <= max_age) {
                    return false;
                }
            }
            None => return true,
        }
    }
    true
}

/// Value and content type a write replaces.
fn previous_value(node: &Node) -> (Option<Vec<u8>>, Option<String>) {
    match &node.local {
        Some(local) => (
            local.content().map(<[u8]>::to_vec),
            local.content_type.clone(),
        ),
        None => (
            node.common.content().map(<[u8]>::to_vec),
            node.common.content_type.clone(),
        ),
    }
}

/// Add `item` to a folder's local listing, seeding it from common.
fn update_folder_node_with_item_name(node: &mut Node, item: &str) {
    let common_items = node.common.items_map.get_or_insert_with(ItemsMap::new).clone();
    if node.local.is_none() {
        node.local = Some(node.common.clone());
    }
    let Some(local) = node.local.as_mut() else {
        return;
    };
    local
        .items_map
        .get_or_insert(common_items)
        .insert(item.to_string(), true);
}

/// Serialized access to the node store.
///
/// Holding a transaction excludes every other writer until it is dropped.
pub struct Transaction<'a> {
    cache: &'a LocalCache,
    _guard: MutexGuard<'a, ()>,
}

impl Transaction<'_> {
    pub async fn get_nodes(&self, paths: &[NodePath]) -> Result<NodeMap> {
        self.cache.store.get_nodes(paths).await
    }

    /// Persist a write set, warning while the store is slow to commit.
    pub async fn set_nodes(&self, nodes: NodeMap) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let write = self.cache.store.set_nodes(nodes);
        tokio::pin!(write);
        let started = Instant::now();
        loop {
            tokio::select! {
                result = &mut write => return result,
                _ = tokio::time::sleep(self.cache.slow_commit_warning) => {
                    warn!(
                        "Node store commit pending for {:?}, {} updates queued",
                        started.elapsed(),
                        self.cache.queued.load(Ordering::SeqCst)
                    );
                }
            }
        }
    }
}

/// Local cache of the synchronized tree.
pub struct LocalCache {
    store: Arc<dyn NodeStore>,
    changes: EventBus<ChangeEvent>,
    diffs: EventBus<NodePath>,
    events_config: ChangeEventsConfig,
    slow_commit_warning: Duration,
    update_lock: Mutex<()>,
    queued: AtomicUsize,
}

impl LocalCache {
    pub fn new(store: Arc<dyn NodeStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            changes: EventBus::new(),
            diffs: EventBus::new(),
            events_config: config.change_events,
            slow_commit_warning: config.slow_commit_warning,
            update_lock: Mutex::new(()),
            queued: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    /// Subscribe to change events of enabled origins.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Subscribe to paths touched by local writes.
    pub fn subscribe_diffs(&self) -> broadcast::Receiver<NodePath> {
        self.diffs.subscribe()
    }

    /// Emit a change event if its origin is enabled.
    pub fn emit_change(&self, event: ChangeEvent) {
        if self.events_config.enabled(event.origin) {
            self.changes.emit(event);
        }
    }

    /// Wait for exclusive write access. Waiters are served in FIFO order.
    pub async fn transaction(&self) -> Transaction<'_> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let guard = self.update_lock.lock().await;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        Transaction {
            cache: self,
            _guard: guard,
        }
    }

    /// Apply `transform` to the nodes at `paths` in one transaction.
    ///
    /// Nodes the transform leaves unchanged are not written. Documents whose
    /// local value differs from the value it replaced produce a window
    /// change event after the write is persisted.
    pub async fn update_nodes<F>(&self, paths: Vec<NodePath>, transform: F) -> Result<()>
    where
        F: FnOnce(&[NodePath], &mut NodeMap) -> Result<()>,
    {
        let tx = self.transaction().await;
        let mut nodes = tx.get_nodes(&paths).await?;
        let snapshot = nodes.clone();
        transform(&paths, &mut nodes)?;

        let mut events = Vec::new();
        let mut changed = NodeMap::new();
        for (path, mut node) in nodes {
            if let Some(local) = node.as_mut().and_then(|n| n.local.as_mut()) {
                if path.is_document() {
                    let previous_body = local.previous_body.take();
                    let previous_content_type = local.previous_content_type.take();
                    let body = local.content().map(<[u8]>::to_vec);
                    let local_changed = snapshot
                        .get(&path)
                        .and_then(Option::as_ref)
                        .and_then(|n| n.local.as_ref())
                        != Some(&*local);
                    if local_changed
                        && (previous_body != body || previous_content_type != local.content_type)
                    {
                        events.push(
                            ChangeEvent::new(path.clone(), Origin::Window)
                                .old(previous_body, previous_content_type)
                                .new_value(body, local.content_type.clone()),
                        );
                    }
                }
            }
            if snapshot.get(&path) != Some(&node) {
                changed.insert(path, node);
            }
        }

        let touched: Vec<NodePath> = changed.keys().cloned().collect();
        tx.set_nodes(changed).await?;
        drop(tx);

        for event in events {
            self.emit_change(event);
        }
        for path in touched {
            self.diffs.emit(path);
        }
        Ok(())
    }

    /// Read a path from the cache without any staleness check.
    pub async fn get_cached(&self, path: &NodePath) -> Result<Response> {
        let nodes = self.store.get_nodes(std::slice::from_ref(path)).await?;
        let node = nodes.get(path).and_then(Option::as_ref);
        Ok(Self::response_for(node))
    }

    /// Read a path, delegating to `queue` if the cached copy is older than
    /// `max_age` or a remote change is pending on it or an ancestor.
    pub async fn get<F, Fut>(&self, path: &NodePath, max_age: Duration, queue: F) -> Result<Response>
    where
        F: FnOnce(NodePath) -> Fut,
        Fut: Future<Output = Result<Response>>,
    {
        let chain = path.paths_from_root();
        let nodes = self.store.get_nodes(&chain).await?;
        if is_outdated(&chain, &nodes, max_age) {
            debug!("Cached copy of {} is outdated, queueing fetch", path);
            return queue(path.clone()).await;
        }
        Ok(Self::response_for(nodes.get(path).and_then(Option::as_ref)))
    }

    fn response_for(node: Option<&Node>) -> Response {
        let Some((node, latest)) = node.and_then(|n| get_latest(n).map(|l| (n, l))) else {
            return Response::status(Status::NOT_FOUND);
        };

        if node.path.is_folder() {
            let items: ItemsMap = latest
                .items_map
                .iter()
                .flatten()
                .filter(|(_, present)| **present)
                .map(|(name, _)| (name.clone(), true))
                .collect();
            return Response {
                status: Status::OK,
                body: serde_json::to_vec(&items).ok(),
                content_type: None,
                revision: latest.revision.clone(),
            };
        }

        Response {
            status: Status::OK,
            body: latest.content().map(<[u8]>::to_vec),
            content_type: latest.content_type.clone(),
            revision: latest.revision.clone(),
        }
    }

    /// Write a document locally and list it in every ancestor folder.
    ///
    /// # Errors
    /// - `path` is a folder
    pub async fn put(&self, path: &NodePath, body: Vec<u8>, content_type: &str) -> Result<()> {
        if path.is_folder() {
            return Err(Error::InvalidInput(format!("cannot put a folder: {path}")));
        }
        let content_type = content_type.to_string();
        self.update_nodes(path.paths_from_root(), move |paths, nodes| {
            for (i, current) in paths.iter().enumerate() {
                let node = nodes
                    .entry(current.clone())
                    .or_insert(None)
                    .get_or_insert_with(|| Node::new(current.clone()));
                if i == 0 {
                    let (previous_body, previous_content_type) = previous_value(node);
                    node.local = Some(Slot {
                        body: Some(Body::Content(body.clone())),
                        content_type: Some(content_type.clone()),
                        timestamp: Some(now_millis()),
                        previous_body,
                        previous_content_type,
                        ..Slot::default()
                    });
                } else if let Some(item) = paths[i - 1].item_name() {
                    update_folder_node_with_item_name(node, &item);
                }
            }
            Ok(())
        })
        .await
    }

    /// Mark a document deleted locally and unlist it from its ancestors.
    ///
    /// The ancestor walk stops at the first folder that still has other
    /// items.
    ///
    /// # Errors
    /// - `path` is a folder
    pub async fn delete(&self, path: &NodePath) -> Result<()> {
        if path.is_folder() {
            return Err(Error::InvalidInput(format!("cannot delete a folder: {path}")));
        }
        self.update_nodes(path.paths_from_root(), |paths, nodes| {
            for (i, current) in paths.iter().enumerate() {
                let Some(node) = nodes.get_mut(current).and_then(Option::as_mut) else {
                    warn!("Cannot delete non-existing node {}", current);
                    continue;
                };

                if i == 0 {
                    let (previous_body, previous_content_type) = previous_value(node);
                    node.local = Some(Slot {
                        body: Some(Body::Deleted),
                        timestamp: Some(now_millis()),
                        previous_body,
                        previous_content_type,
                        ..Slot::default()
                    });
                    continue;
                }

                let Some(item) = paths[i - 1].item_name() else {
                    continue;
                };
                let common = node.common.clone();
                let local = node.local.get_or_insert(common);
                let items = local.items_map.get_or_insert_with(ItemsMap::new);
                items.remove(&item);
                if items.values().any(|present| *present) {
                    break;
                }
            }
            Ok(())
        })
        .await
    }

    /// Discard cached state below `path`.
    ///
    /// Documents with local changes emit a local change event from the
    /// local value back to the common value before they are dropped.
    pub async fn flush(&self, path: &NodePath) -> Result<()> {
        let tx = self.transaction().await;
        let paths = Self::descendants(&tx, path).await?;
        let nodes = tx.get_nodes(&paths).await?;

        let mut events = Vec::new();
        let mut removals = NodeMap::new();
        for (node_path, node) in nodes {
            let Some(node) = node else {
                continue;
            };
            if node_path.is_document() {
                if let Some(local) = &node.local {
                    events.push(
                        ChangeEvent::new(node_path.clone(), Origin::Local)
                            .old(local.content().map(<[u8]>::to_vec), local.content_type.clone())
                            .new_value(
                                node.common.content().map(<[u8]>::to_vec),
                                node.common.content_type.clone(),
                            ),
                    );
                }
            }
            removals.insert(node_path, None);
        }

        debug!("Flushing {} nodes below {}", removals.len(), path);
        tx.set_nodes(removals).await?;
        drop(tx);

        for event in events {
            self.emit_change(event);
        }
        Ok(())
    }

    /// `path` and every descendant reachable through latest listings.
    async fn descendants(tx: &Transaction<'_>, path: &NodePath) -> Result<Vec<NodePath>> {
        let mut found = vec![path.clone()];
        let mut frontier = vec![path.clone()];
        while !frontier.is_empty() {
            let folders: Vec<NodePath> = frontier.drain(..).filter(NodePath::is_folder).collect();
            if folders.is_empty() {
                break;
            }
            let nodes = tx.get_nodes(&folders).await?;
            for (folder, node) in &nodes {
                let Some(node) = node else {
                    continue;
                };
                let Some(items) = get_latest(node).and_then(|l| l.items_map.as_ref()) else {
                    continue;
                };
                for name in items.keys() {
                    if let Ok(child) = folder.join(name) {
                        found.push(child.clone());
                        frontier.push(child);
                    }
                }
            }
        }
        Ok(found)
    }

    /// Emit a local change event for every cached document.
    ///
    /// Used at startup so consumers can build their view from the cache.
    pub async fn fire_initial(&self) -> Result<()> {
        let mut events = Vec::new();
        self.store
            .for_all_nodes(&mut |node: &Node| {
                if node.path.is_folder() {
                    return;
                }
                if let Some(latest) = get_latest(node) {
                    events.push(
                        ChangeEvent::new(node.path.clone(), Origin::Local)
                            .new_value(latest.content().map(<[u8]>::to_vec), latest.content_type.clone()),
                    );
                }
            })
            .await?;
        for event in events {
            self.emit_change(event);
        }
        Ok(())
    }

    pub async fn for_all_nodes(&self, visitor: &mut (dyn FnMut(&Node) + Send)) -> Result<()> {
        self.store.for_all_nodes(visitor).await
    }
}
