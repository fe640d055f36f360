//! In-memory node store.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::store::NodeStore;
use strata_common::{Error, Node, NodeMap, NodePath, Result};

/// In-memory node store.
///
/// Useful for testing and for sessions that do not need a persistent
/// cache. All data is lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: RwLock<BTreeMap<NodePath, Node>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().map(|nodes| nodes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> Error {
        Error::Storage("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_nodes(&self, paths: &[NodePath]) -> Result<NodeMap> {
        let nodes = self.nodes.read().map_err(|_| Self::poisoned())?;
        Ok(paths
            .iter()
            .map(|path| (path.clone(), nodes.get(path).cloned()))
            .collect())
    }

    async fn set_nodes(&self, changes: NodeMap) -> Result<()> {
        let mut nodes = self.nodes.write().map_err(|_| Self::poisoned())?;
        for (path, node) in changes {
            match node {
                Some(node) => {
                    nodes.insert(path, node);
                }
                None => {
                    nodes.remove(&path);
                }
            }
        }
        Ok(())
    }

    async fn for_all_nodes(&self, visitor: &mut (dyn for<'n> FnMut(&'n Node) + Send)) -> Result<()> {
        let snapshot: Vec<Node> = {
            let nodes = self.nodes.read().map_err(|_| Self::poisoned())?;
            nodes.values().cloned().collect()
        };
        for node in &snapshot {
            visitor(node);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> NodePath {
        NodePath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStore::new();
        let mut write = NodeMap::new();
        write.insert(path("/a"), Some(Node::new(path("/a"))));
        store.set_nodes(write).await.unwrap();

        let nodes = store.get_nodes(&[path("/a"), path("/b")]).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[&path("/a")].is_some());
        assert!(nodes[&path("/b")].is_none());
    }

    #[tokio::test]
    async fn test_none_deletes() {
        let store = MemoryStore::new();
        let mut write = NodeMap::new();
        write.insert(path("/a"), Some(Node::new(path("/a"))));
        store.set_nodes(write).await.unwrap();
        assert_eq!(store.len(), 1);

        let mut delete = NodeMap::new();
        delete.insert(path("/a"), None);
        store.set_nodes(delete).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_for_all_nodes() {
        let store = MemoryStore::new();
        let mut write = NodeMap::new();
        for p in ["/a", "/b/", "/b/c"] {
            write.insert(path(p), Some(Node::new(path(p))));
        }
        store.set_nodes(write).await.unwrap();

        let mut seen = Vec::new();
        store
            .for_all_nodes(&mut |node: &Node| seen.push(node.path.to_string()))
            .await
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["/a", "/b/", "/b/c"]);
    }
}
