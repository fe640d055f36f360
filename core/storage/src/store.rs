//! Node store trait definition.

use async_trait::async_trait;

use strata_common::{Node, NodeMap, NodePath, Result};

/// Persistence backend for cached nodes.
///
/// The sync engine only needs batched reads, batched writes and a full
/// scan. Implementations must be safe to share between tasks.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Get the store name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Load nodes by path.
    ///
    /// # Postconditions
    /// - The returned map has an entry for every requested path
    /// - Absent nodes map to `None`
    async fn get_nodes(&self, paths: &[NodePath]) -> Result<NodeMap>;

    /// Persist a write set.
    ///
    /// # Postconditions
    /// - `Some(node)` entries are stored under their key
    /// - `None` entries are deleted
    /// - The write is all-or-nothing from the point of view of readers
    async fn set_nodes(&self, nodes: NodeMap) -> Result<()>;

    /// Visit every stored node.
    async fn for_all_nodes(&self, visitor: &mut (dyn for<'n> FnMut(&'n Node) + Send)) -> Result<()>;
}
