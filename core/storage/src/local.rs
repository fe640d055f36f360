//! File-backed node store.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::store::NodeStore;
use strata_common::{Error, Node, NodeMap, NodePath, Result};

/// Node store persisted as a single JSON document.
///
/// The whole node set is held in memory and rewritten on every write via a
/// temporary file and a rename, so a crash never leaves a half-written
/// cache behind.
pub struct JsonFileStore {
    file: PathBuf,
    nodes: Mutex<BTreeMap<NodePath, Node>>,
}

impl JsonFileStore {
    /// Open (or create) a store backed by `file`.
    ///
    /// # Postconditions
    /// - Parent directory exists
    /// - Records that fail to decode are skipped with a warning
    ///
    /// # Errors
    /// - Permission denied
    /// - File is not a JSON object
    pub async fn open(file: impl AsRef<Path>) -> Result<Self> {
        let file = file.as_ref().to_path_buf();

        if let Some(parent) = file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let nodes = if fs::try_exists(&file).await? {
            let content = fs::read_to_string(&file).await?;
            Self::decode(&content)?
        } else {
            BTreeMap::new()
        };

        debug!("Opened node store {} with {} nodes", file.display(), nodes.len());

        Ok(Self {
            file,
            nodes: Mutex::new(nodes),
        })
    }

    /// Location of the backing file.
    pub fn file(&self) -> &Path {
        &self.file
    }

    fn decode(content: &str) -> Result<BTreeMap<NodePath, Node>> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(content)?;
        let mut nodes = BTreeMap::new();
        for (key, value) in raw {
            let path = match NodePath::parse(&key) {
                Ok(path) => path,
                Err(e) => {
                    warn!("Skipping stored node with bad key {:?}: {}", key, e);
                    continue;
                }
            };
            match serde_json::from_value::<Node>(value) {
                Ok(node) if node.path == path => {
                    nodes.insert(path, node);
                }
                Ok(node) => {
                    warn!("Skipping stored node {} filed under {}", node.path, path);
                }
                Err(e) => {
                    warn!("Skipping undecodable node {}: {}", path, e);
                }
            }
        }
        Ok(nodes)
    }

    async fn persist(&self, nodes: &BTreeMap<NodePath, Node>) -> Result<()> {
        let json = serde_json::to_vec_pretty(nodes)?;
        let tmp = self.file.with_extension("tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.file).await.map_err(Error::Io)
    }
}

#[async_trait]
impl NodeStore for JsonFileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_nodes(&self, paths: &[NodePath]) -> Result<NodeMap> {
        let nodes = self.nodes.lock().await;
        Ok(paths
            .iter()
            .map(|path| (path.clone(), nodes.get(path).cloned()))
            .collect())
    }

    async fn set_nodes(&self, changes: NodeMap) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut nodes = self.nodes.lock().await;
        let mut next = nodes.clone();
        for (path, node) in changes {
            match node {
                Some(node) => {
                    next.insert(path, node);
                }
                None => {
                    next.remove(&path);
                }
            }
        }

        self.persist(&next).await?;
        *nodes = next;
        Ok(())
    }

    async fn for_all_nodes(&self, visitor: &mut (dyn for<'n> FnMut(&'n Node) + Send)) -> Result<()> {
        let snapshot: Vec<Node> = self.nodes.lock().await.values().cloned().collect();
        for node in &snapshot {
            visitor(node);
        }
        Ok(())
    }
}
