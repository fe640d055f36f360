//! Entry point for reads and writes, routed through the local cache when
//! there is one and straight to the remote otherwise.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use strata_common::{Error, NodePath, Result};
use strata_storage::{RemoteClient, RequestOptions, Response, Status};

use crate::config::{Backend, SyncConfig};
use crate::engine::Synchronizer;
use crate::events::{EventBus, WireEvent};
use crate::local::LocalCache;
use crate::status::interpret_status;

/// How old cached data may be before a read goes to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxAge {
    /// Twice the sync interval while the remote is reachable, otherwise
    /// the cache is served as is.
    #[default]
    Default,
    /// Serve the cache as is.
    Ignore,
    Within(Duration),
}

/// Synced get/put/delete.
pub struct SyncedStore {
    local: Option<Arc<LocalCache>>,
    remote: Arc<dyn RemoteClient>,
    sync: Option<Synchronizer>,
    config: SyncConfig,
    wire: EventBus<WireEvent>,
}

impl SyncedStore {
    /// A store without a local cache; every call goes to the remote.
    pub fn new(remote: Arc<dyn RemoteClient>, config: SyncConfig) -> Self {
        Self {
            local: None,
            remote,
            sync: None,
            config,
            wire: EventBus::new(),
        }
    }

    /// Route reads and writes through `local`.
    pub fn with_local(mut self, local: Arc<LocalCache>) -> Self {
        self.local = Some(local);
        self
    }

    /// Use `sync` to fetch outdated data on reads.
    pub fn with_synchronizer(mut self, sync: Synchronizer) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn local(&self) -> Option<&Arc<LocalCache>> {
        self.local.as_ref()
    }

    pub fn synchronizer(&self) -> Option<&Synchronizer> {
        self.sync.as_ref()
    }

    /// Subscribe to busy/done events of direct remote requests.
    pub fn subscribe_wire(&self) -> broadcast::Receiver<WireEvent> {
        self.wire.subscribe()
    }

    pub async fn get(&self, path: &NodePath, max_age: MaxAge) -> Result<Response> {
        let Some(local) = &self.local else {
            return self
                .on_wire(self.remote.get(path, RequestOptions::default()))
                .await;
        };

        let max_age = match max_age {
            MaxAge::Default if self.remote.connected() && self.remote.online() => {
                Some(self.config.current_sync_interval() * 2)
            }
            MaxAge::Default | MaxAge::Ignore => None,
            MaxAge::Within(age) => Some(age),
        };
        let Some(max_age) = max_age else {
            return local.get_cached(path).await;
        };

        let sync = self.sync.clone();
        local
            .get(path, max_age, |path| async move {
                match sync {
                    Some(sync) => sync.queue_get_request(&path).await,
                    None => Err(Error::NotConnected(format!(
                        "no synchronizer to refresh {path}"
                    ))),
                }
            })
            .await
    }

    pub async fn put(&self, path: &NodePath, body: Vec<u8>, content_type: &str) -> Result<Response> {
        if self.share_first(path) {
            debug!("Writing {} to the remote first", path);
            return self
                .on_wire(self.remote.put(path, body, content_type, RequestOptions::default()))
                .await;
        }
        match &self.local {
            Some(local) => {
                local.put(path, body, content_type).await?;
                Ok(Response::status(Status::OK))
            }
            None => {
                self.on_wire(self.remote.put(path, body, content_type, RequestOptions::default()))
                    .await
            }
        }
    }

    pub async fn delete(&self, path: &NodePath) -> Result<Response> {
        match &self.local {
            Some(local) => {
                local.delete(path).await?;
                Ok(Response::status(Status::OK))
            }
            None => {
                self.on_wire(self.remote.delete(path, RequestOptions::default()))
                    .await
            }
        }
    }

    /// Public documents on Dropbox need the server revision right away to
    /// create a share link.
    fn share_first(&self, path: &NodePath) -> bool {
        self.config.backend == Backend::Dropbox && path.is_document() && path.is_public()
    }

    async fn on_wire<F>(&self, request: F) -> Result<Response>
    where
        F: Future<Output = Result<Response>>,
    {
        self.wire.emit(WireEvent::Busy);
        let result = request.await;
        let success = result
            .as_ref()
            .is_ok_and(|r| interpret_status(r.status, self.remote.implied_auth()).successful);
        self.wire.emit(WireEvent::Done { success });
        result
    }
}
