//! Caching policy: how much of each subtree to keep locally.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use strata_common::{Error, NodePath, Result};

use crate::access::{Access, AccessMode};

/// Retention strategy for a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CachingStrategy {
    /// Fetch and keep everything below the path.
    All,
    /// Keep what has been read or written.
    Seen,
    /// Keep only pending local changes.
    Flush,
}

/// Handler invoked when a path switches to [`CachingStrategy::All`].
pub type ActivateHandler = Box<dyn Fn(&NodePath) + Send + Sync>;

/// Per-path caching strategies, inherited from the nearest configured
/// ancestor.
#[derive(Default)]
pub struct Caching {
    roots: RwLock<BTreeMap<NodePath, CachingStrategy>>,
    access: Option<Arc<Access>>,
    activate: Mutex<Activation>,
}

#[derive(Default)]
struct Activation {
    handler: Option<ActivateHandler>,
    pending: Vec<NodePath>,
}

impl Caching {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caching policy that only accepts paths readable under `access`.
    pub fn with_access(access: Arc<Access>) -> Self {
        Self {
            access: Some(access),
            ..Self::default()
        }
    }

    /// Set the strategy for a folder and everything below it.
    ///
    /// Switching to `All` triggers the activation handler, or queues the
    /// path until one is registered.
    ///
    /// # Errors
    /// - `path` is a document path
    /// - Read access to `path` has not been claimed
    pub fn set(&self, path: &NodePath, strategy: CachingStrategy) -> Result<()> {
        if !path.is_folder() {
            return Err(Error::InvalidPath(format!(
                "caching strategy must be set on a folder, got {path}"
            )));
        }
        if let Some(access) = &self.access {
            if !access.check_path_permission(path, AccessMode::Read) {
                return Err(Error::InvalidInput(format!(
                    "claim read access to {path} before setting its caching strategy"
                )));
            }
        }

        debug!("Caching strategy for {} set to {:?}", path, strategy);
        self.roots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.clone(), strategy);

        if strategy == CachingStrategy::All {
            let mut activation = self.activate.lock().unwrap_or_else(|e| e.into_inner());
            match &activation.handler {
                Some(handler) => handler(path),
                None => activation.pending.push(path.clone()),
            }
        }
        Ok(())
    }

    /// Cache everything below `path`.
    pub fn enable(&self, path: &NodePath) -> Result<()> {
        self.set(path, CachingStrategy::All)
    }

    /// Stop caching below `path`.
    pub fn disable(&self, path: &NodePath) -> Result<()> {
        self.set(path, CachingStrategy::Flush)
    }

    /// Register the activation handler and replay queued activations.
    pub fn on_activate(&self, handler: ActivateHandler) {
        let mut activation = self.activate.lock().unwrap_or_else(|e| e.into_inner());
        for path in std::mem::take(&mut activation.pending) {
            handler(&path);
        }
        activation.handler = Some(handler);
    }

    /// Effective strategy for `path`: the nearest configured ancestor's,
    /// or `Seen` if none is configured.
    pub fn check_path(&self, path: &NodePath) -> CachingStrategy {
        let roots = self.roots.read().unwrap_or_else(|e| e.into_inner());
        path.paths_from_root()
            .iter()
            .find_map(|candidate| roots.get(candidate).copied())
            .unwrap_or(CachingStrategy::Seen)
    }

    /// Configured root paths and their strategies.
    pub fn root_paths(&self) -> Vec<(NodePath, CachingStrategy)> {
        self.roots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(path, strategy)| (path.clone(), *strategy))
            .collect()
    }

    /// Forget every configured strategy and queued activation.
    pub fn reset(&self) {
        self.roots.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.activate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .clear();
    }
}
