//! Core sync engine that reconciles the local cache with the remote.
//!
//! The synchronizer collects paths that need work, runs at most one remote
//! request per path with bounded concurrency, and merges every response
//! into the cache inside a single cache transaction.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strata_common::{now_millis, Body, Error, Node, NodeMap, NodePath, Result, Slot};
use strata_storage::{Method, RemoteClient, RequestOptions, Response, Status};

use crate::access::{Access, AccessMode};
use crate::caching::{Caching, CachingStrategy};
use crate::config::SyncConfig;
use crate::events::{ChangeEvent, EventBus, FailureKind, SyncEvent};
use crate::integrity::{is_corrupt, parse_server_listing, ServerListing};
use crate::local::{LocalCache, Transaction};
use crate::merge::{auto_merge, merge_remote_deletion};
use crate::status::{interpret_status, Interpretation};
use crate::tasks::{
    is_stale_child, needs_fetch, needs_push, needs_refresh, needs_remote_delete,
    needs_remote_put, node_changed, TaskState,
};

/// Content type used when a pushed document has none.
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Delay before refilling task slots after a task finished.
const BACKFILL_DELAY: Duration = Duration::from_millis(10);

/// Outcome of a sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// False if a task failed during the cycle.
    pub completed: bool,
    /// Tasks still queued when the cycle ended.
    pub tasks_remaining: usize,
    pub duration: Duration,
}

/// Remote request chosen for a task.
enum Planned {
    Get(RequestOptions),
    Put {
        body: Vec<u8>,
        content_type: String,
        options: RequestOptions,
    },
    Delete(RequestOptions),
}

impl Planned {
    fn method(&self) -> Method {
        match self {
            Planned::Get(_) => Method::Get,
            Planned::Put { .. } => Method::Put,
            Planned::Delete(_) => Method::Delete,
        }
    }
}

/// Reconciles a [`LocalCache`] with a [`RemoteClient`].
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<Inner>,
}

struct Inner {
    local: Arc<LocalCache>,
    remote: Arc<dyn RemoteClient>,
    caching: Arc<Caching>,
    access: Arc<Access>,
    config: SyncConfig,
    events: EventBus<SyncEvent>,
    state: Mutex<TaskState>,
    /// Responses are handled one at a time, in completion order.
    finish_lock: tokio::sync::Mutex<()>,
    cancel: Mutex<CancellationToken>,
}

impl Synchronizer {
    /// Create a synchronizer and hook it to caching activations.
    pub fn new(
        local: Arc<LocalCache>,
        remote: Arc<dyn RemoteClient>,
        caching: Arc<Caching>,
        access: Arc<Access>,
        config: SyncConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            local,
            remote,
            caching,
            access,
            config,
            events: EventBus::new(),
            state: Mutex::new(TaskState::default()),
            finish_lock: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner.caching.on_activate(Box::new(move |path| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.add_task(path.clone(), None);
            if tokio::runtime::Handle::try_current().is_ok() {
                inner.do_tasks();
            }
        }));

        Self { inner }
    }

    pub fn local(&self) -> &Arc<LocalCache> {
        &self.inner.local
    }

    pub fn remote(&self) -> &Arc<dyn RemoteClient> {
        &self.inner.remote
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Subscribe to sync progress and failure events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Queue a task for `path` without starting it.
    pub fn add_task(&self, path: NodePath) {
        self.inner.add_task(path, None);
    }

    /// Start queued tasks in free slots.
    ///
    /// Returns true if every slot is busy afterwards.
    pub fn do_tasks(&self) -> bool {
        self.inner.do_tasks()
    }

    /// Scan the cache for work if no tasks are queued.
    pub async fn collect_tasks(&self, also_refresh: bool) -> Result<()> {
        self.inner.collect_tasks(also_refresh).await
    }

    /// Paths with a queued or running task.
    pub fn tasks(&self) -> Vec<NodePath> {
        self.inner.lock_state().paths()
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock_state().running_count()
    }

    /// When the running task for `path` was started.
    pub fn time_started(&self, path: &NodePath) -> Option<Instant> {
        self.inner.lock_state().time_started(path)
    }

    /// Run one sync step: fill free slots, collecting work first if there
    /// is nothing queued.
    ///
    /// Emits [`SyncEvent::SyncDone`] right away if there is nothing to do.
    pub async fn sync(&self) -> Result<()> {
        self.inner.lock_state().done = false;
        if self.inner.do_tasks() {
            return Ok(());
        }
        self.inner.collect_tasks(true).await?;
        self.inner.do_tasks();

        let idle = !self.inner.lock_state().has_tasks();
        if idle || self.inner.is_stopped() {
            self.inner.mark_done();
            self.inner.events.emit(SyncEvent::SyncDone { completed: idle });
        }
        Ok(())
    }

    /// Sync and wait for the cycle to end.
    ///
    /// # Errors
    /// - Remote is not connected
    pub async fn sync_until_done(&self) -> Result<SyncReport> {
        if !self.inner.remote.connected() {
            return Err(Error::NotConnected("cannot sync without a remote".to_string()));
        }
        let started = Instant::now();
        let mut rx = self.inner.events.subscribe();
        self.sync().await?;

        loop {
            match rx.recv().await {
                Ok(SyncEvent::SyncDone { completed }) => {
                    let report = SyncReport {
                        completed,
                        tasks_remaining: self.inner.lock_state().len(),
                        duration: started.elapsed(),
                    };
                    info!(
                        "Sync finished in {:?}: completed={}, {} tasks remaining",
                        report.duration, report.completed, report.tasks_remaining
                    );
                    return Ok(report);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Sync event receiver lagged by {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Sync("sync event channel closed".to_string()));
                }
            }
        }
    }

    /// Queue tasks for specific paths and sync until done.
    pub async fn sync_paths(&self, paths: Vec<NodePath>) -> Result<SyncReport> {
        for path in paths {
            self.inner.add_task(path, None);
        }
        self.sync_until_done().await
    }

    /// Fetch `path` from the remote and answer from the updated cache.
    ///
    /// # Errors
    /// - Remote is not connected or offline
    /// - The fetch task failed
    pub async fn queue_get_request(&self, path: &NodePath) -> Result<Response> {
        if !self.inner.remote.connected() {
            return Err(Error::NotConnected(format!(
                "cannot fulfil max age for {path}: remote is not connected"
            )));
        }
        if !self.inner.remote.online() {
            return Err(Error::Offline);
        }

        let (tx, rx) = oneshot::channel();
        self.inner.add_task(path.clone(), Some(tx));
        self.inner.do_tasks();

        match rx.await {
            Ok(true) => self.inner.local.get_cached(path).await,
            _ => Err(Error::Network(format!("could not fetch {path}"))),
        }
    }

    /// Stop starting tasks and discard responses still in flight.
    pub fn stop(&self) {
        info!("Stopping synchronizer");
        self.inner.token().cancel();
    }

    /// Resume after [`Synchronizer::stop`].
    pub fn start(&self) {
        let mut cancel = self.inner.cancel.lock().unwrap_or_else(|e| e.into_inner());
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn is_stopped(&self) -> bool {
        self.token().is_cancelled()
    }

    /// Set the done flag, returning whether it was newly set.
    fn mark_done(&self) -> bool {
        let mut state = self.lock_state();
        let first = !state.done;
        state.done = true;
        first
    }

    fn add_task(&self, path: NodePath, waiter: Option<oneshot::Sender<bool>>) {
        debug!("Adding task for {}", path);
        self.lock_state().add(path, waiter);
    }

    fn emit_error(&self, path: &NodePath, kind: FailureKind, message: String) {
        self.events.emit(SyncEvent::Error {
            path: path.clone(),
            kind,
            message,
        });
    }

    /// Task slots: all of them online, one while offline, none without a
    /// remote.
    fn slots(&self) -> usize {
        if !self.remote.connected() {
            0
        } else if self.remote.online() {
            self.config.num_threads
        } else {
            1
        }
    }

    fn do_tasks(self: &Arc<Self>) -> bool {
        if self.is_stopped() {
            return false;
        }
        let slots = self.slots();
        let (started, all_busy) = {
            let mut state = self.lock_state();
            let free = slots.saturating_sub(state.running_count());
            if free == 0 {
                return true;
            }
            let started = state.start(free);
            let all_busy = started.len() >= free;
            (started, all_busy)
        };

        let token = self.token();
        for path in started {
            let inner = Arc::clone(self);
            let token = token.clone();
            tokio::spawn(async move {
                inner.run_task(path, token).await;
            });
        }
        all_busy
    }

    async fn run_task(self: Arc<Self>, path: NodePath, token: CancellationToken) {
        debug!("Running task for {}", path);
        let outcome = self.do_task(&path).await;
        self.finish_task(path, outcome, token).await;
    }

    /// Decide the request for `path`, record a push if needed, and run it.
    async fn do_task(&self, path: &NodePath) -> Result<(Method, Response)> {
        let planned = {
            let tx = self.local.transaction().await;
            let node = tx
                .get_nodes(std::slice::from_ref(path))
                .await?
                .remove(path)
                .flatten();
            self.plan(&tx, path, node).await?
        };
        let method = planned.method();

        let request = async {
            match planned {
                Planned::Get(options) => self.remote.get(path, options).await,
                Planned::Put {
                    body,
                    content_type,
                    options,
                } => self.remote.put(path, body, &content_type, options).await,
                Planned::Delete(options) => self.remote.delete(path, options).await,
            }
        };

        let response = match tokio::time::timeout(self.config.request_timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("{} {} failed: {}", method, path, e);
                Response::status(Status::Offline)
            }
            Err(_) => {
                warn!("{} {} timed out", method, path);
                Response::status(Status::Timeout)
            }
        };
        debug!("{} {} -> {}", method, path, response.status);
        Ok((method, response))
    }

    async fn plan(&self, tx: &Transaction<'_>, path: &NodePath, node: Option<Node>) -> Result<Planned> {
        let Some(mut node) = node else {
            return Ok(Planned::Get(RequestOptions::default()));
        };
        if is_stale_child(&node) || is_corrupt(&node) {
            return Ok(Planned::Get(RequestOptions::default()));
        }

        if needs_remote_put(&node) {
            let mut push = node.local.clone().unwrap_or_default();
            push.timestamp = Some(now_millis());
            let body = push.content().map(<[u8]>::to_vec).unwrap_or_default();
            let content_type = push
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
            let options = match &node.common.revision {
                Some(revision) => RequestOptions::if_match(revision.clone()),
                None => RequestOptions::if_none_match("*"),
            };
            node.push = Some(push);
            tx.set_nodes(single(path, Some(node))).await?;
            return Ok(Planned::Put {
                body,
                content_type,
                options,
            });
        }

        if needs_remote_delete(&node) {
            node.push = Some(Slot {
                body: Some(Body::Deleted),
                timestamp: Some(now_millis()),
                ..Slot::default()
            });
            let revision = node.common.revision.clone();
            tx.set_nodes(single(path, Some(node))).await?;
            return Ok(match revision {
                Some(revision) => Planned::Delete(RequestOptions::if_match(revision)),
                None => Planned::Get(RequestOptions::default()),
            });
        }

        Ok(match &node.common.revision {
            Some(revision) => Planned::Get(RequestOptions::if_none_match(revision.clone())),
            None => Planned::Get(RequestOptions::default()),
        })
    }

    async fn finish_task(
        self: &Arc<Self>,
        path: NodePath,
        outcome: Result<(Method, Response)>,
        token: CancellationToken,
    ) {
        let _finishing = self.finish_lock.lock().await;

        let (completed, failed) = if token.is_cancelled() {
            debug!("Synchronizer stopped, discarding response for {}", path);
            if let Err(e) = self.deal_with_failure(&path).await {
                warn!("Could not roll back push for {}: {}", path, e);
            }
            (false, true)
        } else {
            match outcome {
                Ok((method, response)) => match self.handle_response(&path, method, response).await {
                    Ok(completed) => (completed, false),
                    Err(e) => {
                        warn!("Task for {} failed: {}", path, e);
                        (false, true)
                    }
                },
                Err(e) => {
                    warn!("Task for {} failed: {}", path, e);
                    self.emit_error(&path, FailureKind::Store, e.to_string());
                    (false, true)
                }
            }
        };

        let tasks_remaining = {
            let mut state = self.lock_state();
            state.finish(&path, completed, failed);
            state.len()
        };
        self.events.emit(SyncEvent::SyncReqDone { tasks_remaining });

        if failed {
            if self.mark_done() {
                self.events.emit(SyncEvent::SyncDone { completed: false });
            }
            return;
        }

        if let Err(e) = self.collect_tasks(false).await {
            warn!("Collecting tasks failed: {}", e);
        }
        let idle = !self.lock_state().has_tasks();
        if idle || self.is_stopped() {
            self.mark_done();
            info!("Sync cycle done");
            self.events.emit(SyncEvent::SyncDone { completed: true });
        } else {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(BACKFILL_DELAY).await;
                inner.do_tasks();
            });
        }
    }

    /// Apply a response. Returns whether the task completed.
    async fn handle_response(&self, path: &NodePath, method: Method, response: Response) -> Result<bool> {
        let status = interpret_status(response.status, self.remote.implied_auth());

        if !status.successful {
            self.deal_with_failure(path).await?;
            let kind = status.failure_kind().unwrap_or(FailureKind::Network);
            let error = match kind {
                FailureKind::Unauthorized => Error::Unauthorized(format!("{method} {path}")),
                FailureKind::Network => Error::Network(format!("{method} {path} failed")),
                FailureKind::Timeout => Error::Network(format!("{method} {path} timed out")),
                FailureKind::Http(code) => Error::Http(code),
                FailureKind::Store => Error::Storage(format!("{method} {path}")),
            };
            self.emit_error(path, kind, error.to_string());
            return Err(error);
        }

        let result = match method {
            Method::Get => self.handle_get_response(path, status, response).await,
            Method::Put | Method::Delete => self
                .complete_push(path, method, status.conflict, response.revision)
                .await
                .map(|()| true),
        };
        if let Err(e) = &result {
            self.emit_error(path, FailureKind::Store, e.to_string());
        }
        result
    }

    async fn handle_get_response(
        &self,
        path: &NodePath,
        status: Interpretation,
        response: Response,
    ) -> Result<bool> {
        let tx = self.local.transaction().await;
        let mut events = Vec::new();

        if !status.changed {
            self.update_common_timestamp(&tx, path, response.revision).await?;
            return Ok(true);
        }

        if path.is_folder() {
            let listing = if status.not_found {
                ServerListing::new()
            } else {
                match parse_server_listing(response.body.as_deref()) {
                    Some(listing) => listing,
                    None => {
                        warn!("Discarding corrupt folder description from server for {}", path);
                        return Ok(false);
                    }
                }
            };
            let (changed, missing) = self
                .complete_fetch_folder(&tx, path, &listing, response.revision, &mut events)
                .await?;
            self.mark_children(&tx, path, &listing, changed, missing, &mut events)
                .await?;
        } else {
            let body = if status.not_found {
                Body::Deleted
            } else {
                Body::Content(response.body.unwrap_or_default())
            };
            let changed = self
                .complete_fetch_document(&tx, path, body, response.content_type, response.revision, &mut events)
                .await?;
            tx.set_nodes(self.apply_flush_policy(changed)).await?;
        }
        drop(tx);

        for event in events {
            self.local.emit_change(event);
        }
        Ok(true)
    }

    /// Record a fetched folder listing as the folder's remote slot and merge.
    ///
    /// Returns the write set and the names listed in common that the
    /// server no longer has.
    async fn complete_fetch_folder(
        &self,
        tx: &Transaction<'_>,
        path: &NodePath,
        listing: &ServerListing,
        revision: Option<String>,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<(NodeMap, Vec<String>)> {
        let mut node = tx
            .get_nodes(std::slice::from_ref(path))
            .await?
            .remove(path)
            .flatten()
            .unwrap_or_else(|| Node::bare(path.clone()));

        let missing: Vec<String> = node
            .common
            .items_map
            .iter()
            .flatten()
            .map(|(name, _)| name)
            .filter(|name| !listing.contains_key(*name))
            .cloned()
            .collect();

        node.remote = Some(Slot {
            revision,
            timestamp: Some(now_millis()),
            items_map: Some(listing.keys().map(|name| (name.clone(), true)).collect()),
            ..Slot::default()
        });
        node.push = None;

        Ok((single(path, auto_merge(node, events)), missing))
    }

    async fn complete_fetch_document(
        &self,
        tx: &Transaction<'_>,
        path: &NodePath,
        body: Body,
        content_type: Option<String>,
        revision: Option<String>,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<NodeMap> {
        let mut paths = vec![path.clone()];
        paths.extend(path.parent());
        let mut nodes = tx.get_nodes(&paths).await?;

        let mut node = nodes
            .remove(path)
            .flatten()
            .unwrap_or_else(|| Node::bare(path.clone()));
        let found = !body.is_deleted();
        node.remote = Some(Slot {
            revision,
            timestamp: Some(now_millis()),
            body: Some(body),
            content_type,
            ..Slot::default()
        });
        node.push = None;

        if found {
            if let (Some(parent), Some(item)) = (path.parent(), path.item_name()) {
                if let Some(Some(parent_node)) = nodes.get_mut(&parent) {
                    list_item_locally(parent_node, &item);
                }
            }
        }

        nodes.insert(path.clone(), auto_merge(node, events));
        Ok(nodes)
    }

    /// Reconcile a folder's children with a fresh listing.
    ///
    /// Listed children whose revision changed get a remote revision slot;
    /// unknown children are stubbed when the folder caches everything.
    /// Children that disappeared are deleted together with their subtrees.
    async fn mark_children(
        &self,
        tx: &Transaction<'_>,
        folder: &NodePath,
        listing: &ServerListing,
        mut changed: NodeMap,
        missing: Vec<String>,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<()> {
        let missing: BTreeSet<NodePath> = missing
            .iter()
            .filter_map(|name| folder.join(name).ok())
            .collect();
        let mut paths: Vec<NodePath> = listing
            .keys()
            .filter_map(|name| folder.join(name).ok())
            .collect();
        paths.extend(missing.iter().cloned());

        let nodes = tx.get_nodes(&paths).await?;
        let now = now_millis();
        let mut recurse = BTreeSet::new();

        for (child, node) in nodes {
            let name = child.item_name().unwrap_or_default();

            if let Some(meta) = listing.get(&name) {
                let remote = Slot {
                    revision: Some(meta.revision.clone()),
                    timestamp: Some(now),
                    content_type: meta.content_type.clone(),
                    content_length: meta.content_length,
                    ..Slot::default()
                };
                match node {
                    Some(mut node) => {
                        if node_changed(&node, &meta.revision) {
                            node.remote = Some(remote);
                            changed.insert(child, auto_merge(node, events));
                        }
                    }
                    None => {
                        if self.caching.check_path(&child) == CachingStrategy::All {
                            let mut stub = Node::bare(child.clone());
                            stub.common = Slot::stamped(now);
                            stub.remote = Some(remote);
                            changed.insert(child, Some(stub));
                        }
                    }
                }
                continue;
            }

            if !missing.contains(&child) {
                continue;
            }
            let Some(mut node) = node else {
                continue;
            };
            collect_children(&child, &node, &mut recurse);

            let merged = if node.remote.is_some() || child.is_folder() {
                None
            } else if node.local.is_some() {
                node.remote = Some(remote_delete_marker(now));
                auto_merge(node, events)
            } else {
                merge_remote_deletion(node, events)
            };

            if merged.is_none() {
                if let Some(Some(parent)) = changed.get_mut(folder) {
                    unlist_item_locally(parent, &name);
                }
            }
            changed.insert(child, merged);
        }

        self.delete_remote_trees(tx, recurse, &mut changed, events).await?;
        tx.set_nodes(self.apply_flush_policy(changed)).await
    }

    /// Mark every node below the given paths as deleted remotely, one tree
    /// level per store read.
    async fn delete_remote_trees(
        &self,
        tx: &Transaction<'_>,
        paths: BTreeSet<NodePath>,
        changed: &mut NodeMap,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<()> {
        let mut level: Vec<NodePath> = paths.into_iter().collect();
        let now = now_millis();

        while !level.is_empty() {
            let nodes = tx.get_nodes(&level).await?;
            let mut next = BTreeSet::new();
            for (path, node) in nodes {
                let Some(mut node) = node else {
                    continue;
                };
                if path.is_folder() {
                    collect_children(&path, &node, &mut next);
                    if node.local.is_none() {
                        changed.insert(path, None);
                    }
                } else {
                    node.remote = Some(remote_delete_marker(now));
                    changed.insert(path, auto_merge(node, events));
                }
            }
            level = next.into_iter().collect();
        }
        Ok(())
    }

    /// Settle a finished PUT or DELETE.
    async fn complete_push(
        &self,
        path: &NodePath,
        method: Method,
        conflict: bool,
        revision: Option<String>,
    ) -> Result<()> {
        let tx = self.local.transaction().await;
        let node = tx
            .get_nodes(std::slice::from_ref(path))
            .await?
            .remove(path)
            .flatten();
        let Some(mut node) = node.filter(|n| n.push.is_some()) else {
            self.token().cancel();
            return Err(Error::Sync(format!(
                "push for {path} completed but no push version was recorded"
            )));
        };
        let push = node.push.take().unwrap_or_default();
        let now = now_millis();
        let mut events = Vec::new();

        let result = if conflict {
            debug!("Conflict pushing {}", path);
            let known = node
                .remote
                .as_ref()
                .is_some_and(|r| r.revision.is_some() && r.revision == revision);
            if !known {
                let revision = revision.unwrap_or_else(|| "conflict".to_string());
                node.remote = Some(Slot::revision_only(revision, now));
            }
            auto_merge(node, &mut events)
        } else {
            node.common = Slot {
                revision,
                timestamp: Some(now),
                ..Slot::default()
            };
            match method {
                Method::Put => {
                    node.common.body = push.body.clone();
                    node.common.content_type = push.content_type.clone();
                    let unchanged = node
                        .local
                        .as_ref()
                        .is_some_and(|l| l.body == push.body && l.content_type == push.content_type);
                    if unchanged {
                        node.local = None;
                    }
                    Some(node)
                }
                Method::Delete => {
                    if node.local.as_ref().is_some_and(Slot::is_delete_marker) {
                        None
                    } else {
                        Some(node)
                    }
                }
                Method::Get => Some(node),
            }
        };

        tx.set_nodes(self.apply_flush_policy(single(path, result))).await?;
        drop(tx);
        for event in events {
            self.local.emit_change(event);
        }
        Ok(())
    }

    /// A 304 confirms the cached revision is current.
    async fn update_common_timestamp(
        &self,
        tx: &Transaction<'_>,
        path: &NodePath,
        revision: Option<String>,
    ) -> Result<()> {
        let mut nodes = tx.get_nodes(std::slice::from_ref(path)).await?;
        if let Some(Some(node)) = nodes.get_mut(path) {
            if node.common.revision.is_some() && node.common.revision == revision {
                node.common.timestamp = Some(now_millis());
            }
        }
        tx.set_nodes(self.apply_flush_policy(nodes)).await
    }

    /// Roll back an in-flight push so the next scan re-evaluates `local`.
    async fn deal_with_failure(&self, path: &NodePath) -> Result<()> {
        let tx = self.local.transaction().await;
        let node = tx
            .get_nodes(std::slice::from_ref(path))
            .await?
            .remove(path)
            .flatten();
        if let Some(mut node) = node.filter(|n| n.push.is_some()) {
            node.push = None;
            tx.set_nodes(single(path, Some(node))).await?;
        }
        Ok(())
    }

    /// Drop nodes without local changes under the flush strategy.
    ///
    /// A node someone is waiting to read is kept until the next write.
    fn apply_flush_policy(&self, mut nodes: NodeMap) -> NodeMap {
        for (path, node) in nodes.iter_mut() {
            let flush = node.as_ref().is_some_and(|n| n.local.is_none())
                && self.caching.check_path(path) == CachingStrategy::Flush
                && !self.lock_state().has_waiters(path);
            if flush {
                debug!("Flushing {}", path);
                *node = None;
            }
        }
        nodes
    }

    async fn collect_tasks(&self, also_refresh: bool) -> Result<()> {
        let busy = self.lock_state().has_tasks();
        if busy || self.is_stopped() {
            return Ok(());
        }
        let found = self.collect_diff_tasks().await?;
        if found > 0 || !also_refresh {
            return Ok(());
        }
        self.collect_refresh_tasks().await
    }

    /// Queue corrupt nodes, nodes needing a fetch and documents needing a
    /// push, up to the configured bound.
    async fn collect_diff_tasks(&self) -> Result<usize> {
        let max = self.config.max_diff_tasks;
        let access = &self.access;
        let mut found = Vec::new();

        self.local
            .for_all_nodes(&mut |node: &Node| {
                if found.len() >= max {
                    return;
                }
                if is_corrupt(node) {
                    warn!("Corrupt node in local cache: {}", node.path);
                    found.push(node.path.clone());
                } else if needs_fetch(node)
                    && access.check_path_permission(&node.path, AccessMode::Read)
                {
                    found.push(node.path.clone());
                } else if node.path.is_document()
                    && needs_push(node)
                    && access.check_path_permission(&node.path, AccessMode::ReadWrite)
                {
                    found.push(node.path.clone());
                }
            })
            .await?;

        let count = found.len();
        let mut state = self.lock_state();
        for path in found {
            state.add(path, None);
        }
        Ok(count)
    }

    /// Queue folders whose cached data is older than the sync interval.
    async fn collect_refresh_tasks(&self) -> Result<()> {
        let interval = self.config.current_sync_interval();
        let access = &self.access;
        let mut found = Vec::new();

        self.local
            .for_all_nodes(&mut |node: &Node| {
                if !needs_refresh(node, interval) {
                    return;
                }
                match node.path.parent() {
                    Some(parent) if access.check_path_permission(&parent, AccessMode::Read) => {
                        found.push(parent);
                    }
                    _ if access.check_path_permission(&node.path, AccessMode::Read) => {
                        found.push(node.path.clone());
                    }
                    _ => {}
                }
            })
            .await?;

        let mut state = self.lock_state();
        for path in found {
            state.add(path, None);
        }
        state.delete_child_paths();
        Ok(())
    }
}

fn single(path: &NodePath, node: Option<Node>) -> NodeMap {
    let mut nodes = NodeMap::new();
    nodes.insert(path.clone(), node);
    nodes
}

fn remote_delete_marker(timestamp: i64) -> Slot {
    Slot {
        body: Some(Body::Deleted),
        timestamp: Some(timestamp),
        ..Slot::default()
    }
}

/// Queue every child named in a folder's common or local listing.
fn collect_children(path: &NodePath, node: &Node, into: &mut BTreeSet<NodePath>) {
    if !path.is_folder() {
        return;
    }
    for slot in [Some(&node.common), node.local.as_ref()].into_iter().flatten() {
        for name in slot.items_map.iter().flatten().map(|(name, _)| name) {
            if let Ok(child) = path.join(name) {
                into.insert(child);
            }
        }
    }
}

fn list_item_locally(folder: &mut Node, item: &str) {
    let Some(items) = folder.local.as_mut().and_then(|l| l.items_map.as_mut()) else {
        return;
    };
    items.insert(item.to_string(), true);
    let settled = Some(&*items) == folder.common.items_map.as_ref();
    if settled {
        folder.local = None;
    }
}

fn unlist_item_locally(folder: &mut Node, item: &str) {
    let Some(items) = folder.local.as_mut().and_then(|l| l.items_map.as_mut()) else {
        return;
    };
    items.remove(item);
    let settled = Some(&*items) == folder.common.items_map.as_ref();
    if settled {
        folder.local = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{drain, Origin};
    use strata_common::ItemsMap;
    use strata_storage::{MemoryRemote, MemoryStore, NodeStore};

    fn p(s: &str) -> NodePath {
        NodePath::parse(s).unwrap()
    }

    struct Fixture {
        sync: Synchronizer,
        local: Arc<LocalCache>,
        remote: Arc<MemoryRemote>,
        caching: Arc<Caching>,
    }

    fn fixture() -> Fixture {
        fixture_with(SyncConfig::default())
    }

    fn fixture_with(config: SyncConfig) -> Fixture {
        let local = Arc::new(LocalCache::new(Arc::new(MemoryStore::new()), &config));
        let remote = Arc::new(MemoryRemote::new());
        let access = Arc::new(Access::new());
        access.claim("*", AccessMode::ReadWrite).unwrap();
        let caching = Arc::new(Caching::with_access(access.clone()));
        let sync = Synchronizer::new(local.clone(), remote.clone(), caching.clone(), access, config);
        Fixture {
            sync,
            local,
            remote,
            caching,
        }
    }

    async fn node(local: &LocalCache, path: &str) -> Option<Node> {
        let path = p(path);
        local.store().get_nodes(&[path.clone()]).await.unwrap().remove(&path).flatten()
    }

    async fn seed(local: &LocalCache, node: Node) {
        let mut write = NodeMap::new();
        write.insert(node.path.clone(), Some(node));
        local.store().set_nodes(write).await.unwrap();
    }

    #[tokio::test]
    async fn test_push_new_document() {
        let f = fixture();
        f.local.put(&p("/notes/a"), b"v1".to_vec(), "text/plain").await.unwrap();

        let report = f.sync.sync_until_done().await.unwrap();
        assert!(report.completed);

        let (body, content_type) = f.remote.document(&p("/notes/a")).unwrap();
        assert_eq!(body, b"v1");
        assert_eq!(content_type, "text/plain");

        let requests = f.remote.requests();
        assert_eq!(requests[0].method, Method::Put);
        assert_eq!(requests[0].options.if_none_match.as_deref(), Some("*"));

        let synced = node(&f.local, "/notes/a").await.unwrap();
        assert!(synced.local.is_none());
        assert!(synced.push.is_none());
        assert_eq!(synced.common.revision, f.remote.revision(&p("/notes/a")));
    }

    #[tokio::test]
    async fn test_push_delete() {
        let f = fixture();
        f.local.put(&p("/a"), b"v1".to_vec(), "text/plain").await.unwrap();
        f.sync.sync_until_done().await.unwrap();

        f.local.delete(&p("/a")).await.unwrap();
        let report = f.sync.sync_until_done().await.unwrap();
        assert!(report.completed);
        assert!(f.remote.document(&p("/a")).is_none());
        assert!(node(&f.local, "/a").await.is_none());
    }

    #[tokio::test]
    async fn test_conflict_on_push() {
        let f = fixture();
        let path = p("/note");
        f.local.put(&path, b"v1".to_vec(), "text/plain").await.unwrap();
        f.sync.sync_until_done().await.unwrap();

        f.local.put(&path, b"v2".to_vec(), "text/plain").await.unwrap();
        f.remote.set_document(&path, "v3", "text/plain");
        let mut changes = f.local.subscribe();

        f.sync.sync_until_done().await.unwrap();

        let conflicts: Vec<_> = drain(&mut changes)
            .into_iter()
            .filter(|e| e.origin == Origin::Conflict)
            .collect();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].old_value.as_deref(), Some(&b"v2"[..]));
        assert_eq!(conflicts[0].new_value.as_deref(), Some(&b"v3"[..]));
        assert_eq!(conflicts[0].last_common_value.as_deref(), Some(&b"v1"[..]));

        let merged = node(&f.local, "/note").await.unwrap();
        assert_eq!(merged.common.content(), Some(&b"v3"[..]));
        assert!(merged.local.is_none());
        assert!(merged.remote.is_none());
    }

    #[tokio::test]
    async fn test_hard_failure_rolls_back_push() {
        let f = fixture();
        f.local.put(&p("/a"), b"v1".to_vec(), "text/plain").await.unwrap();
        let mut events = f.sync.subscribe();
        f.remote.fail_next(Status::Http(500));

        let report = f.sync.sync_until_done().await.unwrap();
        assert!(!report.completed);
        assert_eq!(report.tasks_remaining, 1);

        let failed = node(&f.local, "/a").await.unwrap();
        assert!(failed.push.is_none());
        assert!(failed.local.is_some());

        let errors: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::Error { kind, .. } => Some(kind),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![FailureKind::Http(500)]);

        let retry = f.sync.sync_until_done().await.unwrap();
        assert!(retry.completed);
        assert!(f.remote.document(&p("/a")).is_some());
    }

    #[tokio::test]
    async fn test_request_timeout_rolls_back_push() {
        let f = fixture_with(SyncConfig {
            request_timeout: Duration::from_millis(50),
            ..SyncConfig::default()
        });
        f.remote.set_latency(Duration::from_millis(300));
        f.local.put(&p("/a"), b"v1".to_vec(), "text/plain").await.unwrap();
        let mut events = f.sync.subscribe();

        let report = f.sync.sync_until_done().await.unwrap();
        assert!(!report.completed);
        while f.sync.running_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let pending = node(&f.local, "/a").await.unwrap();
        assert!(pending.push.is_none());
        assert!(pending.local.is_some());
        assert!(f.remote.document(&p("/a")).is_none());

        let events = drain(&mut events);
        assert!(events.contains(&SyncEvent::SyncDone { completed: false }));
        let errors: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SyncEvent::Error { path, kind, .. } => Some((path.clone(), *kind)),
                _ => None,
            })
            .collect();
        assert!(errors.contains(&(p("/a"), FailureKind::Timeout)));
        assert!(errors.iter().all(|(_, kind)| *kind == FailureKind::Timeout));
    }

    #[tokio::test]
    async fn test_flush_strategy_drops_synced_nodes() {
        let f = fixture();
        f.caching.set(&NodePath::root(), CachingStrategy::Flush).unwrap();
        f.local.put(&p("/a"), b"v1".to_vec(), "text/plain").await.unwrap();

        let report = f.sync.sync_until_done().await.unwrap();
        assert!(report.completed);
        assert!(f.remote.document(&p("/a")).is_some());
        assert!(node(&f.local, "/a").await.is_none());

        f.remote.clear_requests();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let sync = f.sync.clone();
        let got = f
            .local
            .get(&p("/a"), Duration::from_millis(1), |path| async move {
                sync.queue_get_request(&path).await
            })
            .await
            .unwrap();
        assert_eq!(got.status, Status::OK);
        assert_eq!(got.body.as_deref(), Some(&b"v1"[..]));
        assert!(f
            .remote
            .requests()
            .iter()
            .any(|r| r.method == Method::Get && r.path == p("/a")));
    }

    #[tokio::test]
    async fn test_corrupt_node_is_refetched() {
        let f = fixture();
        let revision = f.remote.set_document(&p("/a"), "good", "text/plain");
        let mut corrupt = Node::bare(p("/a"));
        corrupt.common = Slot {
            revision: Some(String::new()),
            timestamp: Some(now_millis()),
            body: Some(Body::from("bad")),
            content_type: Some("text/plain".into()),
            ..Slot::default()
        };
        assert!(is_corrupt(&corrupt));
        seed(&f.local, corrupt).await;

        let report = f.sync.sync_until_done().await.unwrap();
        assert!(report.completed);

        let get = f
            .remote
            .requests()
            .into_iter()
            .find(|r| r.path == p("/a"))
            .unwrap();
        assert_eq!(get.method, Method::Get);
        assert!(get.options.if_none_match.is_none());

        let repaired = node(&f.local, "/a").await.unwrap();
        assert!(!is_corrupt(&repaired));
        assert_eq!(repaired.common.content(), Some(&b"good"[..]));
        assert_eq!(repaired.common.revision.as_deref(), Some(revision.as_str()));
    }

    #[tokio::test]
    async fn test_unauthorized_event() {
        let f = fixture();
        f.local.put(&p("/a"), b"v1".to_vec(), "text/plain").await.unwrap();
        let mut events = f.sync.subscribe();
        f.remote.fail_next(Status::Http(401));

        f.sync.sync_until_done().await.unwrap();
        let unauthorized = drain(&mut events).into_iter().any(|e| {
            matches!(e, SyncEvent::Error { kind: FailureKind::Unauthorized, .. })
        });
        assert!(unauthorized);
    }

    #[tokio::test]
    async fn test_refresh_fetches_remote_tree() {
        let f = fixture();
        f.remote.set_document(&p("/notes/a"), "remote", "text/plain");
        f.caching.enable(&p("/notes/")).unwrap();
        // Enabling queued the folder; the second cycle fetches the stubbed child.
        for _ in 0..2 {
            f.sync.sync_until_done().await.unwrap();
        }

        let doc = node(&f.local, "/notes/a").await.unwrap();
        assert_eq!(doc.common.content(), Some(&b"remote"[..]));
        let folder = node(&f.local, "/notes/").await.unwrap();
        let items: ItemsMap = [("a".to_string(), true)].into_iter().collect();
        assert_eq!(folder.common.items_map, Some(items));
    }

    #[tokio::test]
    async fn test_remote_deletion_propagates() {
        let f = fixture();
        let folder = p("/docs/");
        let mut listing = Node::bare(folder.clone());
        listing.common = Slot {
            revision: Some("old".into()),
            timestamp: Some(0),
            items_map: Some([("a".to_string(), true)].into_iter().collect()),
            ..Slot::default()
        };
        seed(&f.local, listing).await;
        let mut doc = Node::bare(p("/docs/a"));
        doc.common = Slot {
            revision: Some("r1".into()),
            timestamp: Some(now_millis()),
            body: Some(Body::from("gone soon")),
            content_type: Some("text/plain".into()),
            ..Slot::default()
        };
        seed(&f.local, doc).await;
        f.remote.set_document(&p("/docs/b"), "b", "text/plain");

        let mut changes = f.local.subscribe();
        f.sync.add_task(folder.clone());
        f.sync.sync_until_done().await.unwrap();

        assert!(node(&f.local, "/docs/a").await.is_none());
        let deletions: Vec<_> = drain(&mut changes)
            .into_iter()
            .filter(|e| e.path == p("/docs/a"))
            .collect();
        assert_eq!(deletions.len(), 1);
        assert!(deletions[0].new_value.is_none());
    }

    #[tokio::test]
    async fn test_not_modified_refreshes_timestamp() {
        let f = fixture();
        let revision = f.remote.set_document(&p("/a"), "x", "text/plain");
        let mut doc = Node::bare(p("/a"));
        doc.common = Slot {
            revision: Some(revision.clone()),
            timestamp: Some(1),
            body: Some(Body::from("x")),
            content_type: Some("text/plain".into()),
            ..Slot::default()
        };
        seed(&f.local, doc).await;

        f.sync.add_task(p("/a"));
        f.sync.sync_until_done().await.unwrap();

        let requests = f.remote.requests();
        assert_eq!(requests[0].options.if_none_match.as_deref(), Some(revision.as_str()));
        let refreshed = node(&f.local, "/a").await.unwrap();
        assert!(refreshed.common.timestamp.unwrap() > 1);
    }

    #[tokio::test]
    async fn test_corrupt_listing_is_discarded() {
        let f = fixture();
        let folder = p("/f/");
        let mut existing = Node::bare(folder.clone());
        existing.common = Slot {
            timestamp: Some(1),
            items_map: Some([("keep".to_string(), true)].into_iter().collect()),
            ..Slot::default()
        };
        seed(&f.local, existing.clone()).await;

        let status = interpret_status(Status::OK, false);
        let response = Response {
            body: Some(b"[1, 2]".to_vec()),
            ..Response::status(Status::OK)
        };
        let completed = f
            .sync
            .inner
            .handle_get_response(&folder, status, response)
            .await
            .unwrap();
        assert!(!completed);
        assert_eq!(node(&f.local, "/f/").await.unwrap(), existing);
    }

    #[tokio::test]
    async fn test_queue_get_request() {
        let f = fixture();
        f.remote.set_document(&p("/a"), "remote", "text/plain");
        let response = f.sync.queue_get_request(&p("/a")).await.unwrap();
        assert_eq!(response.status, Status::OK);
        assert_eq!(response.body.as_deref(), Some(&b"remote"[..]));

        f.remote.set_online(false);
        assert!(matches!(
            f.sync.queue_get_request(&p("/a")).await,
            Err(Error::Offline)
        ));
        f.remote.set_connected(false);
        assert!(matches!(
            f.sync.queue_get_request(&p("/a")).await,
            Err(Error::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_discards_in_flight_response() {
        let f = fixture();
        f.remote.set_latency(Duration::from_millis(100));
        f.local.put(&p("/a"), b"v1".to_vec(), "text/plain").await.unwrap();

        let mut events = f.sync.subscribe();
        f.sync.sync().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.sync.stop();

        loop {
            if let Ok(SyncEvent::SyncDone { completed }) = events.recv().await {
                assert!(!completed);
                break;
            }
        }
        let rolled_back = node(&f.local, "/a").await.unwrap();
        assert!(rolled_back.push.is_none());
        assert!(rolled_back.local.is_some());
        assert!(f.sync.is_stopped());

        f.sync.start();
        assert!(!f.sync.is_stopped());
    }

    #[tokio::test]
    async fn test_nothing_to_do_reports_done() {
        let f = fixture();
        let report = f.sync.sync_until_done().await.unwrap();
        assert!(report.completed);
        assert_eq!(report.tasks_remaining, 0);
        assert!(f.remote.requests().is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_sync_is_rejected() {
        let f = fixture();
        f.remote.set_connected(false);
        assert!(matches!(
            f.sync.sync_until_done().await,
            Err(Error::NotConnected(_))
        ));
    }
}
