//! In-memory remote for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

use super::{Method, RemoteClient, RequestOptions, Response, Status};
use strata_common::{Error, NodePath, Result};

/// Content type of folder listings.
const FOLDER_CONTENT_TYPE: &str = "application/ld+json";

#[derive(Debug, Clone)]
struct Document {
    body: Vec<u8>,
    content_type: String,
    revision: String,
}

/// A request as seen by [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: NodePath,
    pub options: RequestOptions,
}

#[derive(Debug, Default)]
struct State {
    documents: BTreeMap<NodePath, Document>,
    folder_revisions: BTreeMap<NodePath, String>,
    scripted: VecDeque<Status>,
    requests: Vec<RecordedRequest>,
    in_flight: HashMap<NodePath, usize>,
    max_in_flight: HashMap<NodePath, usize>,
}

impl State {
    fn touch_ancestors(&mut self, path: &NodePath) {
        let mut current = path.parent();
        while let Some(folder) = current {
            self.folder_revisions
                .insert(folder.clone(), new_revision());
            current = folder.parent();
        }
    }

    fn listing(&self, folder: &NodePath) -> BTreeMap<String, serde_json::Value> {
        let mut items = BTreeMap::new();
        for (path, doc) in self.documents.range(folder.clone()..) {
            if !folder.is_ancestor_of(path) {
                if path.components().starts_with(folder.components()) {
                    continue;
                }
                break;
            }
            if path.depth() == folder.depth() + 1 {
                let name = path.item_name().unwrap_or_default();
                items.insert(
                    name,
                    serde_json::json!({
                        "ETag": doc.revision,
                        "Content-Type": doc.content_type,
                        "Content-Length": doc.body.len(),
                    }),
                );
            } else {
                let child = &path.components()[folder.depth()];
                let child_path = folder.join(&format!("{child}/"));
                if let Ok(child_path) = child_path {
                    let revision = self
                        .folder_revisions
                        .get(&child_path)
                        .cloned()
                        .unwrap_or_default();
                    items.insert(format!("{child}/"), serde_json::json!({ "ETag": revision }));
                }
            }
        }
        items
    }
}

fn new_revision() -> String {
    Uuid::new_v4().simple().to_string()
}

/// In-memory remoteStorage-style server.
///
/// Keeps documents with generated ETags, derives folder listings with
/// per-folder ETags, and honours `If-Match` / `If-None-Match`. Tests can
/// toggle connectivity, inject latency, script failures and inspect the
/// request log.
pub struct MemoryRemote {
    state: Mutex<State>,
    connected: AtomicBool,
    online: AtomicBool,
    implied_auth: AtomicBool,
    latency: Mutex<Duration>,
}

impl MemoryRemote {
    /// Create a connected, online remote with no documents.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            connected: AtomicBool::new(true),
            online: AtomicBool::new(true),
            implied_auth: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_implied_auth(&self, implied: bool) {
        self.implied_auth.store(implied, Ordering::SeqCst);
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Answer the next request with `status` without touching any data.
    ///
    /// `Status::Offline` makes the request fail with a transport error.
    pub fn fail_next(&self, status: Status) {
        self.lock().scripted.push_back(status);
    }

    /// Write a document directly, as another client would. Returns the new revision.
    pub fn set_document(&self, path: &NodePath, body: impl Into<Vec<u8>>, content_type: &str) -> String {
        let mut state = self.lock();
        let revision = new_revision();
        state.documents.insert(
            path.clone(),
            Document {
                body: body.into(),
                content_type: content_type.to_string(),
                revision: revision.clone(),
            },
        );
        state.touch_ancestors(path);
        revision
    }

    /// Remove a document directly, as another client would.
    pub fn remove_document(&self, path: &NodePath) -> bool {
        let mut state = self.lock();
        let removed = state.documents.remove(path).is_some();
        if removed {
            state.touch_ancestors(path);
        }
        removed
    }

    /// Body and content type of a stored document.
    pub fn document(&self, path: &NodePath) -> Option<(Vec<u8>, String)> {
        self.lock()
            .documents
            .get(path)
            .map(|doc| (doc.body.clone(), doc.content_type.clone()))
    }

    /// Current revision of a document or folder.
    pub fn revision(&self, path: &NodePath) -> Option<String> {
        let state = self.lock();
        if path.is_folder() {
            state.folder_revisions.get(path).cloned()
        } else {
            state.documents.get(path).map(|doc| doc.revision.clone())
        }
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    /// Highest number of simultaneous requests seen for one path.
    pub fn max_concurrent_requests(&self, path: &NodePath) -> usize {
        self.lock().max_in_flight.get(path).copied().unwrap_or(0)
    }

    async fn handle(
        &self,
        method: Method,
        path: &NodePath,
        options: RequestOptions,
        write: Option<(Vec<u8>, String)>,
    ) -> Result<Response> {
        let scripted = {
            let mut state = self.lock();
            state.requests.push(RecordedRequest {
                method,
                path: path.clone(),
                options: options.clone(),
            });
            let count = {
                let count = state.in_flight.entry(path.clone()).or_insert(0);
                *count += 1;
                *count
            };
            let max = state.max_in_flight.entry(path.clone()).or_insert(0);
            *max = (*max).max(count);
            state.scripted.pop_front()
        };
        let _in_flight = InFlight { remote: self, path };

        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = if !self.online() {
            Err(Error::Network("remote unreachable".to_string()))
        } else {
            match scripted {
                Some(Status::Offline) => Err(Error::Network("scripted failure".to_string())),
                Some(status) => Ok(Response::status(status)),
                None => {
                    let mut state = self.lock();
                    Ok(match method {
                        Method::Get => Self::get_locked(&state, path, &options),
                        Method::Put => match write {
                            Some((body, content_type)) => {
                                Self::put_locked(&mut state, path, body, content_type, &options)
                            }
                            None => Response::status(Status::Http(400)),
                        },
                        Method::Delete => Self::delete_locked(&mut state, path, &options),
                    })
                }
            }
        };

        if let Ok(response) = &result {
            trace!("{} {} -> {}", method, path, response.status);
        }
        result
    }

    fn get_locked(state: &State, path: &NodePath, options: &RequestOptions) -> Response {
        let (revision, body, content_type) = if path.is_folder() {
            let items = state.listing(path);
            if items.is_empty() {
                return Response::status(Status::NOT_FOUND);
            }
            let revision = state.folder_revisions.get(path).cloned().unwrap_or_default();
            let body = serde_json::to_vec(&items).unwrap_or_default();
            (revision, body, FOLDER_CONTENT_TYPE.to_string())
        } else {
            match state.documents.get(path) {
                Some(doc) => (doc.revision.clone(), doc.body.clone(), doc.content_type.clone()),
                None => return Response::status(Status::NOT_FOUND),
            }
        };

        if options.if_none_match.as_deref() == Some(revision.as_str()) {
            return Response {
                revision: Some(revision),
                ..Response::status(Status::NOT_MODIFIED)
            };
        }

        Response {
            status: Status::OK,
            body: Some(body),
            content_type: Some(content_type),
            revision: Some(revision),
        }
    }

    fn put_locked(
        state: &mut State,
        path: &NodePath,
        body: Vec<u8>,
        content_type: String,
        options: &RequestOptions,
    ) -> Response {
        if path.is_folder() {
            return Response::status(Status::Http(400));
        }
        let existing = state.documents.get(path).map(|doc| doc.revision.clone());

        if let Some(expected) = &options.if_match {
            if existing.as_ref() != Some(expected) {
                return Response::status(Status::PRECONDITION_FAILED);
            }
        }
        if options.if_none_match.as_deref() == Some("*") && existing.is_some() {
            return Response::status(Status::PRECONDITION_FAILED);
        }

        let revision = new_revision();
        state.documents.insert(
            path.clone(),
            Document {
                body,
                content_type,
                revision: revision.clone(),
            },
        );
        state.touch_ancestors(path);

        let status = if existing.is_some() {
            Status::OK
        } else {
            Status::CREATED
        };
        Response {
            revision: Some(revision),
            ..Response::status(status)
        }
    }

    fn delete_locked(state: &mut State, path: &NodePath, options: &RequestOptions) -> Response {
        let Some(existing) = state.documents.get(path).map(|doc| doc.revision.clone()) else {
            return Response::status(Status::NOT_FOUND);
        };
        if let Some(expected) = &options.if_match {
            if *expected != existing {
                return Response::status(Status::PRECONDITION_FAILED);
            }
        }
        state.documents.remove(path);
        state.touch_ancestors(path);
        Response::status(Status::OK)
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn implied_auth(&self) -> bool {
        self.implied_auth.load(Ordering::SeqCst)
    }

    async fn get(&self, path: &NodePath, options: RequestOptions) -> Result<Response> {
        self.handle(Method::Get, path, options, None).await
    }

    async fn put(
        &self,
        path: &NodePath,
        body: Vec<u8>,
        content_type: &str,
        options: RequestOptions,
    ) -> Result<Response> {
        self.handle(Method::Put, path, options, Some((body, content_type.to_string())))
            .await
    }

    async fn delete(&self, path: &NodePath, options: RequestOptions) -> Result<Response> {
        self.handle(Method::Delete, path, options, None).await
    }
}

/// Counts a request as in flight until dropped, including when the caller
/// abandons it mid-request.
struct InFlight<'a> {
    remote: &'a MemoryRemote,
    path: &'a NodePath,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.remote.lock().in_flight.get_mut(self.path) {
            *count = count.saturating_sub(1);
        }
    }
}
