//! Events published by the cache, the synchronizer and the facade.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use strata_common::NodePath;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// A local write by this client.
    Window,
    /// Cached local state replayed or discarded.
    Local,
    /// A remote change merged into the cache.
    Remote,
    /// A conflicting local change lost to the remote version.
    Conflict,
}

/// A change to a cached document or folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: NodePath,
    pub origin: Origin,
    pub old_value: Option<Vec<u8>>,
    pub new_value: Option<Vec<u8>>,
    pub old_content_type: Option<String>,
    pub new_content_type: Option<String>,
    /// Merge base, only set for conflicts.
    pub last_common_value: Option<Vec<u8>>,
    pub last_common_content_type: Option<String>,
}

impl ChangeEvent {
    pub fn new(path: NodePath, origin: Origin) -> Self {
        Self {
            path,
            origin,
            old_value: None,
            new_value: None,
            old_content_type: None,
            new_content_type: None,
            last_common_value: None,
            last_common_content_type: None,
        }
    }

    pub fn old(mut self, value: Option<Vec<u8>>, content_type: Option<String>) -> Self {
        self.old_value = value;
        self.old_content_type = content_type;
        self
    }

    pub fn new_value(mut self, value: Option<Vec<u8>>, content_type: Option<String>) -> Self {
        self.new_value = value;
        self.new_content_type = content_type;
        self
    }

    pub fn last_common(mut self, value: Option<Vec<u8>>, content_type: Option<String>) -> Self {
        self.last_common_value = value;
        self.last_common_content_type = content_type;
        self
    }
}

/// Category of a failed sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Unauthorized,
    Network,
    /// No answer within the request timeout.
    Timeout,
    Http(u16),
    /// The local node store failed while handling a response.
    Store,
}

/// Progress and failures of the synchronizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// One task finished; `tasks_remaining` are still queued.
    SyncReqDone { tasks_remaining: usize },
    /// A sync cycle ended. `completed` is false if a task failed.
    SyncDone { completed: bool },
    Error {
        path: NodePath,
        kind: FailureKind,
        message: String,
    },
}

/// Remote activity on the facade's direct-to-remote path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEvent {
    Busy,
    Done { success: bool },
}

const CHANNEL_CAPACITY: usize = 1024;

/// Broadcast channel for one event kind.
///
/// Emitting with no subscribers is not an error.
#[derive(Debug)]
pub struct EventBus<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain every event currently buffered in `rx`.
#[cfg(test)]
pub(crate) fn drain<E: Clone>(rx: &mut broadcast::Receiver<E>) -> Vec<E> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
