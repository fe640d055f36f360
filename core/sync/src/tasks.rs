//! Task bookkeeping and node classification.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

use strata_common::{now_millis, Node, NodePath};

use crate::integrity::is_corrupt;

/// What the synchronizer would do with a node right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// Shape is invalid; will be re-fetched.
    Corrupt,
    /// Local and remote both changed; a fetch resolves it.
    InConflict,
    /// Remote data is missing or announced but not fetched.
    NeedsFetch,
    /// Local changes wait to be pushed.
    NeedsPush,
    /// In flight to the remote.
    Pushing,
    Synced,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Corrupt => "corrupt",
            NodeStatus::InConflict => "conflict",
            NodeStatus::NeedsFetch => "fetch",
            NodeStatus::NeedsPush => "push",
            NodeStatus::Pushing => "pushing",
            NodeStatus::Synced => "synced",
        }
    }
}

/// Classify a node.
pub fn classify(node: &Node) -> NodeStatus {
    if is_corrupt(node) {
        NodeStatus::Corrupt
    } else if in_conflict(node) {
        NodeStatus::InConflict
    } else if is_stale_child(node) {
        NodeStatus::NeedsFetch
    } else if node.path.is_document() && needs_push(node) {
        NodeStatus::NeedsPush
    } else if needs_fetch(node) {
        NodeStatus::NeedsFetch
    } else if node.push.is_some() {
        NodeStatus::Pushing
    } else {
        NodeStatus::Synced
    }
}

/// Local edits and a fetched remote version coexist.
pub fn in_conflict(node: &Node) -> bool {
    node.local.is_some()
        && node
            .remote
            .as_ref()
            .is_some_and(|r| r.body.is_some() || r.items_map.is_some())
}

/// The node has no usable common or remote data.
pub fn needs_fetch(node: &Node) -> bool {
    if in_conflict(node) {
        return true;
    }
    let common_empty = node.common.items_map.is_none() && node.common.body.is_none();
    let remote_empty = node
        .remote
        .as_ref()
        .is_some_and(|r| r.items_map.is_none() && r.body.is_none());
    common_empty || remote_empty
}

/// Local changes exist and are not already in flight.
pub fn needs_push(node: &Node) -> bool {
    if in_conflict(node) {
        return false;
    }
    let pending = node.local.is_some() && node.push.is_none();
    if pending && node.local.as_ref().is_some_and(|l| l.body.is_none()) && node.path.is_document() {
        debug!("{} has a local slot without a body", node.path);
    }
    pending
}

/// Common data is older than `max_age` or was never stamped.
pub fn needs_refresh(node: &Node, max_age: Duration) -> bool {
    let max_age = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
    match node.common.timestamp {
        None => true,
        Some(ts) => now_millis() - ts > max_age,
    }
}

/// A remote revision is known but its content was not fetched yet.
pub fn is_stale_child(node: &Node) -> bool {
    node.remote.as_ref().is_some_and(|r| {
        r.revision.is_some() && r.items_map.is_none() && r.body.is_none()
    })
}

pub fn needs_remote_put(node: &Node) -> bool {
    node.local.as_ref().is_some_and(|l| l.content().is_some())
}

pub fn needs_remote_delete(node: &Node) -> bool {
    node.local.as_ref().is_some_and(|l| l.is_delete_marker())
}

/// Whether a listing revision differs from what the node already knows.
pub fn node_changed(node: &Node, revision: &str) -> bool {
    node.common.revision.as_deref() != Some(revision)
        && !node
            .remote
            .as_ref()
            .is_some_and(|r| r.revision.as_deref() == Some(revision))
}

/// Queued and running tasks, keyed by path.
///
/// At most one task exists per path. Waiters are told whether the task
/// completed.
#[derive(Debug, Default)]
pub struct TaskState {
    tasks: BTreeMap<NodePath, Vec<oneshot::Sender<bool>>>,
    running: HashSet<NodePath>,
    time_started: HashMap<NodePath, Instant>,
    /// A sync cycle already reported its end.
    pub done: bool,
}

impl TaskState {
    /// Queue a task for `path`, or attach `waiter` to the existing one.
    pub fn add(&mut self, path: NodePath, waiter: Option<oneshot::Sender<bool>>) {
        let waiters = self.tasks.entry(path).or_default();
        if let Some(waiter) = waiter {
            waiters.push(waiter);
        }
    }

    pub fn has_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, path: &NodePath) -> bool {
        self.tasks.contains_key(path)
    }

    /// Some caller is waiting for the task on `path` to finish.
    pub fn has_waiters(&self, path: &NodePath) -> bool {
        self.tasks.get(path).is_some_and(|waiters| !waiters.is_empty())
    }

    pub fn paths(&self) -> Vec<NodePath> {
        self.tasks.keys().cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn is_running(&self, path: &NodePath) -> bool {
        self.running.contains(path)
    }

    /// Mark up to `limit` queued tasks as running and return their paths.
    pub fn start(&mut self, limit: usize) -> Vec<NodePath> {
        let started: Vec<NodePath> = self
            .tasks
            .keys()
            .filter(|path| !self.running.contains(*path))
            .take(limit)
            .cloned()
            .collect();
        let now = Instant::now();
        for path in &started {
            self.running.insert(path.clone());
            self.time_started.insert(path.clone(), now);
        }
        started
    }

    /// When the running task for `path` started.
    pub fn time_started(&self, path: &NodePath) -> Option<Instant> {
        self.time_started.get(path).copied()
    }

    /// Record the end of a task run.
    ///
    /// A completed task is removed. Waiters are always notified, so a
    /// failed task stays queued without waiters.
    pub fn finish(&mut self, path: &NodePath, completed: bool, keep: bool) {
        self.running.remove(path);
        self.time_started.remove(path);
        let waiters = if completed || !keep {
            self.tasks.remove(path).unwrap_or_default()
        } else {
            self.tasks
                .get_mut(path)
                .map(std::mem::take)
                .unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(completed);
        }
    }

    /// Drop queued tasks whose path lies below another queued task, moving
    /// their waiters to the ancestor. Running tasks are left alone.
    pub fn delete_child_paths(&mut self) {
        let paths = self.paths();
        for path in paths {
            if self.running.contains(&path) {
                continue;
            }
            let ancestor = path
                .paths_from_root()
                .into_iter()
                .skip(1)
                .find(|candidate| self.tasks.contains_key(candidate));
            if let Some(ancestor) = ancestor {
                let waiters = self.tasks.remove(&path).unwrap_or_default();
                if let Some(target) = self.tasks.get_mut(&ancestor) {
                    target.extend(waiters);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::{Body, ItemsMap, Slot};

    fn p(s: &str) -> NodePath {
        NodePath::parse(s).unwrap()
    }

    fn synced_doc(path: &str) -> Node {
        let mut node = Node::bare(p(path));
        node.common = Slot {
            revision: Some("r1".into()),
            timestamp: Some(now_millis()),
            body: Some(Body::from("x")),
            content_type: Some("text/plain".into()),
            ..Slot::default()
        };
        node
    }

    #[test]
    fn test_classify() {
        let node = synced_doc("/a");
        assert_eq!(classify(&node), NodeStatus::Synced);

        let mut local = node.clone();
        local.local = Some(Slot {
            body: Some(Body::from("y")),
            ..Slot::default()
        });
        assert_eq!(classify(&local), NodeStatus::NeedsPush);

        let mut pushing = local.clone();
        pushing.push = pushing.local.clone();
        assert_eq!(classify(&pushing), NodeStatus::Pushing);

        let mut conflict = local.clone();
        conflict.remote = Some(Slot {
            body: Some(Body::from("z")),
            ..Slot::default()
        });
        assert_eq!(classify(&conflict), NodeStatus::InConflict);
        assert!(!needs_push(&conflict));

        let mut stale = node.clone();
        stale.remote = Some(Slot::revision_only("r2", now_millis()));
        assert_eq!(classify(&stale), NodeStatus::NeedsFetch);
        assert!(is_stale_child(&stale));

        let fresh = Node::new(p("/b"));
        assert_eq!(classify(&fresh), NodeStatus::NeedsFetch);
    }

    #[test]
    fn test_folder_is_not_pushed() {
        let mut folder = Node::new(p("/f/"));
        folder.local = Some(Slot {
            items_map: Some(ItemsMap::new()),
            ..Slot::default()
        });
        assert_eq!(classify(&folder), NodeStatus::Synced);
    }

    #[test]
    fn test_needs_refresh() {
        let node = synced_doc("/a");
        assert!(!needs_refresh(&node, Duration::from_secs(10)));

        let mut old = node.clone();
        old.common.timestamp = Some(now_millis() - 20_000);
        assert!(needs_refresh(&old, Duration::from_secs(10)));

        assert!(needs_refresh(&Node::new(p("/b")), Duration::from_secs(10)));
    }

    #[test]
    fn test_node_changed() {
        let mut node = synced_doc("/a");
        assert!(!node_changed(&node, "r1"));
        assert!(node_changed(&node, "r2"));
        node.remote = Some(Slot::revision_only("r2", 0));
        assert!(!node_changed(&node, "r2"));
    }

    #[test]
    fn test_task_waiters() {
        let mut state = TaskState::default();
        let (tx, mut rx) = oneshot::channel();
        state.add(p("/a"), Some(tx));
        state.add(p("/a"), None);
        state.add(p("/b"), None);
        assert_eq!(state.len(), 2);
        assert!(state.has_waiters(&p("/a")));
        assert!(!state.has_waiters(&p("/b")));

        let started = state.start(10);
        assert_eq!(started, vec![p("/a"), p("/b")]);
        assert!(state.start(10).is_empty());
        assert!(state.time_started(&p("/a")).is_some());

        state.finish(&p("/a"), true, false);
        state.finish(&p("/b"), true, false);
        assert!(state.is_empty());
        assert!(!state.has_waiters(&p("/a")));
        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[test]
    fn test_failed_task_stays_queued() {
        let mut state = TaskState::default();
        let (tx, mut rx) = oneshot::channel();
        state.add(p("/a"), Some(tx));
        state.start(1);
        state.finish(&p("/a"), false, true);
        assert!(state.contains(&p("/a")));
        assert!(!state.is_running(&p("/a")));
        assert_eq!(rx.try_recv(), Ok(false));
    }

    #[test]
    fn test_delete_child_paths() {
        let mut state = TaskState::default();
        let (tx, mut rx) = oneshot::channel();
        state.add(p("/a/b/c"), Some(tx));
        state.add(p("/a/"), None);
        state.add(p("/z"), None);

        state.delete_child_paths();
        assert_eq!(state.paths(), vec![p("/a/"), p("/z")]);

        state.start(10);
        state.finish(&p("/a/"), true, false);
        assert_eq!(rx.try_recv(), Ok(true));
    }
}
