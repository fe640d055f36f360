//! Automatic merging of remote state into cached nodes.
//!
//! Merges are pure: they take a node, return the merged node (or `None` if
//! it should be removed from the cache) and push the change events the
//! merge produced. The caller persists the result and emits the events.

use tracing::debug;

use strata_common::{Body, Node, Slot};

use crate::events::{ChangeEvent, Origin};

/// Merge a node's `remote` slot into `common`, reconciling with `local`.
///
/// Nodes without a `remote` slot are returned unchanged, so merging an
/// already merged node is a no-op.
pub fn auto_merge(node: Node, events: &mut Vec<ChangeEvent>) -> Option<Node> {
    if node.remote.is_none() {
        return Some(node);
    }

    let merged = match (node.local.is_some(), node.path.is_folder()) {
        (true, true) => Some(merge_folder(node)),
        (true, false) => merge_document(node, events),
        (false, true) => Some(promote_folder(node)),
        (false, false) => promote_document(node, events),
    };

    merged.filter(|node| !node.is_empty())
}

/// Remote confirmed a node is gone and it has no local edits.
///
/// Emits a deletion event if a document body was cached. The node is
/// always dropped.
pub fn merge_remote_deletion(node: Node, events: &mut Vec<ChangeEvent>) -> Option<Node> {
    if let Some(old) = node.common.content() {
        events.push(
            ChangeEvent::new(node.path.clone(), Origin::Remote)
                .old(Some(old.to_vec()), node.common.content_type.clone()),
        );
    }
    None
}

fn merge_folder(mut node: Node) -> Node {
    let Some(remote) = node.remote.take() else {
        return node;
    };
    if remote.items_map.is_none() {
        node.remote = Some(remote);
        return node;
    }

    let old_common = std::mem::replace(&mut node.common, remote);
    let Some(local) = node.local.as_mut() else {
        return node;
    };
    let local_items = local.items_map.get_or_insert_with(Default::default);

    if let Some(common_items) = &node.common.items_map {
        for name in common_items.keys() {
            if !local_items.get(name).copied().unwrap_or(false) {
                local_items.insert(name.clone(), false);
            }
        }
    }

    if let Some(old_items) = &old_common.items_map {
        let remote_items = node.common.items_map.as_ref();
        for (name, _) in old_items.iter().filter(|(_, present)| **present) {
            let dropped_remotely = !remote_items.is_some_and(|items| items.contains_key(name));
            if dropped_remotely && local_items.get(name) == Some(&true) {
                local_items.insert(name.clone(), false);
            }
        }
    }

    if node.local.as_ref().and_then(|l| l.items_map.as_ref()) == node.common.items_map.as_ref() {
        node.local = None;
    }
    node
}

/// The remote slot says nothing the merge base does not already know.
fn has_no_remote_changes(node: &Node) -> bool {
    let Some(remote) = &node.remote else {
        return true;
    };
    if let Some(revision) = &remote.revision {
        if node.common.revision.as_ref() != Some(revision) {
            return false;
        }
    }
    let common_gone = matches!(node.common.body, None | Some(Body::Deleted));
    (common_gone && remote.is_delete_marker())
        || (remote.body == node.common.body && remote.content_type == node.common.content_type)
}

fn merge_document(mut node: Node, events: &mut Vec<ChangeEvent>) -> Option<Node> {
    if has_no_remote_changes(&node) {
        let remote = node.remote.take();
        let both_deleted = remote.as_ref().is_some_and(Slot::is_delete_marker)
            && node.local.as_ref().is_some_and(Slot::is_delete_marker);
        if both_deleted {
            debug!("Mutual deletion of {}", node.path);
            node.local = None;
        }
        return Some(node);
    }

    let remote = node.remote.take()?;
    if remote.body.is_none() {
        // Revision announced but not fetched yet.
        node.remote = Some(remote);
        return Some(node);
    }

    let local = node.local.take().unwrap_or_default();
    events.push(
        ChangeEvent::new(node.path.clone(), Origin::Conflict)
            .old(local.content().map(<[u8]>::to_vec), local.content_type.clone())
            .new_value(remote.content().map(<[u8]>::to_vec), remote.content_type.clone())
            .last_common(
                node.common.content().map(<[u8]>::to_vec),
                node.common.content_type.clone(),
            ),
    );

    node.common = if remote.content().is_some() {
        remote
    } else {
        Slot::default()
    };
    Some(node)
}

fn promote_folder(mut node: Node) -> Node {
    if node.remote.as_ref().is_some_and(|r| r.items_map.is_some()) {
        if let Some(remote) = node.remote.take() {
            node.common = remote;
        }
    }
    node
}

fn promote_document(mut node: Node, events: &mut Vec<ChangeEvent>) -> Option<Node> {
    let remote_has_body = node.remote.as_ref().is_some_and(|r| r.body.is_some());
    if !remote_has_body {
        return Some(node);
    }
    let remote = node.remote.take()?;

    let old_value = node.common.content().map(<[u8]>::to_vec);
    let new_value = remote.content().map(<[u8]>::to_vec);
    if old_value.is_some() || new_value.is_some() {
        events.push(
            ChangeEvent::new(node.path.clone(), Origin::Remote)
                .old(old_value, node.common.content_type.clone())
                .new_value(new_value, remote.content_type.clone()),
        );
    }

    if remote.is_delete_marker() {
        return None;
    }
    node.common = remote;
    Some(node)
}
