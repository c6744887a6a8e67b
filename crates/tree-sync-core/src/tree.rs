//! Tree replica: the local mirror of the remote tree's structure and metadata.
//!
//! Nodes are stored in a flat ordered map keyed by `NodePath`. Because paths
//! order segment-wise, a node's subtree is the contiguous range starting at
//! the node itself, which keeps moves and recursive removes cheap.
//!
//! Change notifications are coalesced by a re-entrant transaction counter:
//! nested `start_transaction`/`finish_transaction` pairs produce a single
//! `SyncEvent::TreeChanged` when the outermost one closes.

use crate::events::{now_millis, EventBus, SyncEvent};
use crate::path::NodePath;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("finish_transaction called with no open transaction")]
    TransactionImbalance,
}

pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Per-node metadata fields (e.g. `loading`).
pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    File,
    Directory,
}

/// A node in the replica.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub kind: NodeKind,
    /// Stat record reported by the remote side, if any
    pub stat: Option<Value>,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// Full contents of the replica at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSnapshot {
    /// Remote root this replica mirrors (set by the initial state)
    pub root_path: Option<String>,
    pub nodes: BTreeMap<NodePath, Node>,
    pub metadata: BTreeMap<NodePath, Metadata>,
}

/// Replica shared between the dispatcher and the work queue.
pub type SharedTree = Arc<Mutex<Tree>>;

/// Mutable, observable tree replica.
pub struct Tree {
    state: TreeSnapshot,
    /// Open transaction count
    depth: usize,
    /// Mutations made since the last change notification
    dirty: bool,
    events: Arc<EventBus>,
}

impl Tree {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            state: TreeSnapshot::default(),
            depth: 0,
            dirty: false,
            events,
        }
    }

    // ========================================================================
    // Read access
    // ========================================================================

    pub fn root_path(&self) -> Option<&str> {
        self.state.root_path.as_deref()
    }

    pub fn get(&self, path: &NodePath) -> Option<&Node> {
        self.state.nodes.get(path)
    }

    pub fn metadata(&self, path: &NodePath) -> Option<&Metadata> {
        self.state.metadata.get(path)
    }

    pub fn nodes(&self) -> &BTreeMap<NodePath, Node> {
        &self.state.nodes
    }

    pub fn len(&self) -> usize {
        self.state.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.nodes.is_empty()
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        self.state.clone()
    }

    /// Number of currently open transactions.
    pub fn transaction_depth(&self) -> usize {
        self.depth
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn start_transaction(&mut self) {
        self.depth += 1;
    }

    /// Close one transaction. Emits the coalesced change notification when the
    /// outermost transaction closes and something changed inside it.
    pub fn finish_transaction(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(ReplicaError::TransactionImbalance);
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.flush();
        }
        Ok(())
    }

    /// Force every open transaction closed. Returns how many were open.
    pub fn reset_transactions(&mut self) -> usize {
        let open = self.depth;
        self.depth = 0;
        self.flush();
        open
    }

    fn commit(&mut self) {
        self.dirty = true;
        if self.depth == 0 {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        self.events.emit(SyncEvent::TreeChanged {
            snapshot: Arc::new(self.state.clone()),
            timestamp: now_millis(),
        });
    }

    fn notify(&self, operation: &str, path: &NodePath, new_path: Option<&NodePath>) {
        self.events.emit(SyncEvent::NodeChanged {
            operation: operation.to_string(),
            path: path.to_string(),
            new_path: new_path.map(|p| p.to_string()),
            timestamp: now_millis(),
        });
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Replace the entire replica content.
    ///
    /// `tree` is a nested object: object values are directories, anything else
    /// is a file. `stat` maps node paths to stat records.
    pub fn set(&mut self, root_path: &str, tree: &Map<String, Value>, stat: &Map<String, Value>) {
        let mut nodes = BTreeMap::new();
        collect_nodes(&NodePath::root(), tree, &mut nodes);
        for (key, value) in stat {
            if let Some(node) = nodes.get_mut(&NodePath::from(key.as_str())) {
                node.stat = Some(value.clone());
            }
        }

        self.state = TreeSnapshot {
            root_path: Some(root_path.to_string()),
            nodes,
            metadata: BTreeMap::new(),
        };
        self.notify("set", &NodePath::from(root_path), None);
        self.commit();
    }

    pub fn add_file(&mut self, path: &NodePath, meta: Metadata) -> Result<()> {
        self.insert(path, NodeKind::File, meta)
    }

    pub fn add_dir(&mut self, path: &NodePath, meta: Metadata) -> Result<()> {
        self.insert(path, NodeKind::Directory, meta)
    }

    /// Like `add_file`, but fails with `NotAFile` instead of replacing a directory.
    pub fn create_file(&mut self, path: &NodePath, meta: Metadata) -> Result<()> {
        self.check_kind(path, NodeKind::File)?;
        self.insert(path, NodeKind::File, meta)
    }

    /// Like `add_dir`, but fails with `NotADirectory` instead of replacing a file.
    pub fn create_dir(&mut self, path: &NodePath, meta: Metadata) -> Result<()> {
        self.check_kind(path, NodeKind::Directory)?;
        self.insert(path, NodeKind::Directory, meta)
    }

    fn check_kind(&self, path: &NodePath, kind: NodeKind) -> Result<()> {
        match self.state.nodes.get(path).map(|node| node.kind) {
            Some(existing) if existing != kind => match kind {
                NodeKind::File => Err(ReplicaError::NotAFile(path.to_string())),
                NodeKind::Directory => Err(ReplicaError::NotADirectory(path.to_string())),
            },
            _ => Ok(()),
        }
    }

    fn insert(&mut self, path: &NodePath, kind: NodeKind, meta: Metadata) -> Result<()> {
        if path.is_root() {
            return Err(ReplicaError::InvalidPath(path.to_string()));
        }
        self.ensure_ancestors(path)?;

        let existing = self
            .state
            .nodes
            .get(path)
            .map(|node| (node.kind, node.stat.clone()));
        let stat = match existing {
            Some((existing_kind, stat)) if existing_kind == kind => stat,
            Some(_) => {
                // Kind changed: a former directory loses its subtree
                self.remove_subtree(path);
                None
            }
            None => None,
        };
        self.state.nodes.insert(path.clone(), Node { kind, stat });
        if !meta.is_empty() {
            self.state
                .metadata
                .entry(path.clone())
                .or_default()
                .extend(meta);
        }

        self.notify("add", path, None);
        self.commit();
        Ok(())
    }

    fn ensure_ancestors(&mut self, path: &NodePath) -> Result<()> {
        for ancestor in path.ancestors() {
            match self.state.nodes.get(&ancestor) {
                Some(node) if !node.is_dir() => {
                    return Err(ReplicaError::NotADirectory(ancestor.to_string()));
                }
                Some(_) => {}
                None => {
                    self.state.nodes.insert(
                        ancestor,
                        Node {
                            kind: NodeKind::Directory,
                            stat: None,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Record a new stat for an existing node.
    pub fn set_stat(&mut self, path: &NodePath, stat: Value) -> Result<()> {
        let node = self
            .state
            .nodes
            .get_mut(path)
            .ok_or_else(|| ReplicaError::NotFound(path.to_string()))?;
        node.stat = Some(stat);
        self.notify("update", path, None);
        self.commit();
        Ok(())
    }

    /// Move a node (and its subtree) to a new path, replacing whatever was there.
    ///
    /// The target may not be the root, lie inside the moved subtree, or be
    /// one of the node's own ancestors.
    pub fn move_node(&mut self, from: &NodePath, to: &NodePath) -> Result<()> {
        if !self.state.nodes.contains_key(from) {
            return Err(ReplicaError::NotFound(from.to_string()));
        }
        if from == to {
            return Ok(());
        }
        if to.is_root() || to.starts_with(from) || from.starts_with(to) {
            return Err(ReplicaError::InvalidPath(to.to_string()));
        }
        self.ensure_ancestors(to)?;
        self.remove_subtree(to);

        let moved = self.remove_subtree(from);
        for (path, node, meta) in moved {
            let Some(new_path) = path.rebase(from, to) else {
                continue;
            };
            if let Some(meta) = meta {
                self.state.metadata.insert(new_path.clone(), meta);
            }
            self.state.nodes.insert(new_path, node);
        }

        self.notify("move", from, Some(to));
        self.commit();
        Ok(())
    }

    pub fn remove_file(&mut self, path: &NodePath) -> Result<()> {
        match self.state.nodes.get(path) {
            None => return Err(ReplicaError::NotFound(path.to_string())),
            Some(node) if node.is_dir() => {
                return Err(ReplicaError::NotAFile(path.to_string()));
            }
            Some(_) => {}
        }
        self.remove_subtree(path);
        self.notify("remove", path, None);
        self.commit();
        Ok(())
    }

    pub fn remove_dir(&mut self, path: &NodePath) -> Result<()> {
        match self.state.nodes.get(path) {
            None => return Err(ReplicaError::NotFound(path.to_string())),
            Some(node) if !node.is_dir() => {
                return Err(ReplicaError::NotADirectory(path.to_string()));
            }
            Some(_) => {}
        }
        self.remove_subtree(path);
        self.notify("remove", path, None);
        self.commit();
        Ok(())
    }

    /// Set one metadata field on an existing node.
    pub fn set_metadata_field(&mut self, path: &NodePath, field: &str, value: Value) -> Result<()> {
        if !self.state.nodes.contains_key(path) {
            return Err(ReplicaError::NotFound(path.to_string()));
        }
        self.state
            .metadata
            .entry(path.clone())
            .or_default()
            .insert(field.to_string(), value);
        self.notify("update", path, None);
        self.commit();
        Ok(())
    }

    /// Remove a field from a node's metadata. Missing nodes and fields are ignored.
    pub fn clear_metadata_field(&mut self, path: &NodePath, field: &str) {
        let Some(meta) = self.state.metadata.get_mut(path) else {
            return;
        };
        if meta.remove(field).is_none() {
            return;
        }
        if meta.is_empty() {
            self.state.metadata.remove(path);
        }
        self.notify("update", path, None);
        self.commit();
    }

    /// Detach `path` and everything below it, returning the removed entries.
    fn remove_subtree(&mut self, path: &NodePath) -> Vec<(NodePath, Node, Option<Metadata>)> {
        let keys: Vec<NodePath> = self
            .state
            .nodes
            .range(path.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(path))
            .cloned()
            .collect();

        keys.into_iter()
            .filter_map(|key| {
                let node = self.state.nodes.remove(&key)?;
                let meta = self.state.metadata.remove(&key);
                Some((key, node, meta))
            })
            .collect()
    }
}

fn collect_nodes(parent: &NodePath, tree: &Map<String, Value>, out: &mut BTreeMap<NodePath, Node>) {
    for (name, value) in tree {
        let path = parent.join(name);
        if path == *parent {
            continue;
        }
        match value {
            Value::Object(children) => {
                out.insert(
                    path.clone(),
                    Node {
                        kind: NodeKind::Directory,
                        stat: None,
                    },
                );
                collect_nodes(&path, children, out);
            }
            _ => {
                out.insert(
                    path,
                    Node {
                        kind: NodeKind::File,
                        stat: None,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recording_tree() -> (Tree, Arc<Mutex<Vec<SyncEvent>>>, crate::Subscription) {
        let bus = Arc::new(EventBus::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let sub = bus.subscribe(move |event| events_clone.lock().unwrap().push(event));
        (Tree::new(bus), events, sub)
    }

    fn change_count(events: &Mutex<Vec<SyncEvent>>) -> usize {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, SyncEvent::TreeChanged { .. }))
            .count()
    }

    fn meta(value: Value) -> Metadata {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_set_builds_nested_nodes() {
        let (mut tree, events, _sub) = recording_tree();
        let contents = json!({ "docs": { "a.md": null, "img": {} }, "b.txt": true });
        let stat = json!({ "/docs/a.md": { "size": 3 } });

        tree.set("/r", contents.as_object().unwrap(), stat.as_object().unwrap());

        assert_eq!(tree.root_path(), Some("/r"));
        assert!(tree.get(&NodePath::from("/docs")).unwrap().is_dir());
        assert!(tree.get(&NodePath::from("/docs/img")).unwrap().is_dir());
        let file = tree.get(&NodePath::from("/docs/a.md")).unwrap();
        assert_eq!(file.kind, NodeKind::File);
        assert_eq!(file.stat, Some(json!({ "size": 3 })));
        assert_eq!(tree.get(&NodePath::from("/b.txt")).unwrap().kind, NodeKind::File);
        assert_eq!(change_count(&events), 1);
    }

    #[test]
    fn test_add_file_creates_ancestors_and_metadata() {
        let (mut tree, _events, _sub) = recording_tree();
        tree.add_file(&NodePath::from("/a/b/c.txt"), meta(json!({ "loading": true })))
            .unwrap();

        assert!(tree.get(&NodePath::from("/a")).unwrap().is_dir());
        assert!(tree.get(&NodePath::from("/a/b")).unwrap().is_dir());
        assert_eq!(
            tree.metadata(&NodePath::from("/a/b/c.txt")).unwrap()["loading"],
            json!(true)
        );
    }

    #[test]
    fn test_add_under_file_fails() {
        let (mut tree, _events, _sub) = recording_tree();
        tree.add_file(&NodePath::from("/a"), Metadata::new()).unwrap();
        let err = tree.add_file(&NodePath::from("/a/b"), Metadata::new()).unwrap_err();
        assert_eq!(err, ReplicaError::NotADirectory("/a".into()));
    }

    #[test]
    fn test_move_rekeys_subtree_and_metadata() {
        let (mut tree, _events, _sub) = recording_tree();
        tree.add_file(&NodePath::from("/src/x/y.txt"), meta(json!({ "loading": true })))
            .unwrap();
        tree.add_file(&NodePath::from("/srcfile"), Metadata::new()).unwrap();

        tree.move_node(&NodePath::from("/src"), &NodePath::from("/dst/inner"))
            .unwrap();

        assert!(tree.get(&NodePath::from("/src")).is_none());
        assert!(tree.get(&NodePath::from("/src/x/y.txt")).is_none());
        assert!(tree.get(&NodePath::from("/dst/inner/x/y.txt")).is_some());
        assert!(tree.metadata(&NodePath::from("/dst/inner/x/y.txt")).is_some());
        // Sibling sharing a name prefix is untouched
        assert!(tree.get(&NodePath::from("/srcfile")).is_some());
    }

    #[test]
    fn test_move_missing_node_fails() {
        let (mut tree, _events, _sub) = recording_tree();
        let err = tree
            .move_node(&NodePath::from("/nope"), &NodePath::from("/x"))
            .unwrap_err();
        assert_eq!(err, ReplicaError::NotFound("/nope".into()));
    }

    #[test]
    fn test_move_into_own_subtree_fails() {
        let (mut tree, _events, _sub) = recording_tree();
        tree.add_dir(&NodePath::from("/a"), Metadata::new()).unwrap();
        let err = tree
            .move_node(&NodePath::from("/a"), &NodePath::from("/a/b"))
            .unwrap_err();
        assert_eq!(err, ReplicaError::InvalidPath("/a/b".into()));
    }

    #[test]
    fn test_move_onto_own_ancestor_fails_and_keeps_tree() {
        let (mut tree, events, _sub) = recording_tree();
        let contents = json!({ "a": { "b": { "keep.txt": null }, "other.txt": null } });
        tree.set("/r", contents.as_object().unwrap(), &Map::new());
        let before = tree.snapshot();

        let err = tree
            .move_node(&NodePath::from("/a/b"), &NodePath::from("/a"))
            .unwrap_err();

        assert_eq!(err, ReplicaError::InvalidPath("/a".into()));
        assert_eq!(tree.snapshot(), before);
        assert_eq!(change_count(&events), 1);
    }

    #[test]
    fn test_create_refuses_to_replace_other_kind() {
        let (mut tree, _events, _sub) = recording_tree();
        tree.add_file(&NodePath::from("/dir/x.txt"), Metadata::new()).unwrap();
        tree.add_file(&NodePath::from("/file"), Metadata::new()).unwrap();

        let err = tree
            .create_file(&NodePath::from("/dir"), meta(json!({ "loading": true })))
            .unwrap_err();
        assert_eq!(err, ReplicaError::NotAFile("/dir".into()));
        assert!(tree.get(&NodePath::from("/dir/x.txt")).is_some());
        assert!(tree.metadata(&NodePath::from("/dir")).is_none());

        let err = tree
            .create_dir(&NodePath::from("/file"), Metadata::new())
            .unwrap_err();
        assert_eq!(err, ReplicaError::NotADirectory("/file".into()));
        assert_eq!(tree.get(&NodePath::from("/file")).unwrap().kind, NodeKind::File);

        // Same kind is fine and merges metadata
        tree.create_dir(&NodePath::from("/dir"), meta(json!({ "loading": true })))
            .unwrap();
        assert!(tree.get(&NodePath::from("/dir/x.txt")).is_some());
    }

    #[test]
    fn test_add_replaces_other_kind() {
        let (mut tree, _events, _sub) = recording_tree();
        tree.add_file(&NodePath::from("/dir/x.txt"), Metadata::new()).unwrap();

        tree.add_file(&NodePath::from("/dir"), Metadata::new()).unwrap();

        assert_eq!(tree.get(&NodePath::from("/dir")).unwrap().kind, NodeKind::File);
        assert!(tree.get(&NodePath::from("/dir/x.txt")).is_none());
    }

    #[test]
    fn test_remove_dir_removes_subtree() {
        let (mut tree, _events, _sub) = recording_tree();
        tree.add_file(&NodePath::from("/d/e/f.txt"), Metadata::new()).unwrap();
        tree.remove_dir(&NodePath::from("/d")).unwrap();
        assert!(tree.is_empty());
    }

    #[test]
    fn test_remove_checks_kind() {
        let (mut tree, _events, _sub) = recording_tree();
        tree.add_dir(&NodePath::from("/d"), Metadata::new()).unwrap();
        tree.add_file(&NodePath::from("/f"), Metadata::new()).unwrap();

        assert_eq!(
            tree.remove_file(&NodePath::from("/d")).unwrap_err(),
            ReplicaError::NotAFile("/d".into())
        );
        assert_eq!(
            tree.remove_dir(&NodePath::from("/f")).unwrap_err(),
            ReplicaError::NotADirectory("/f".into())
        );
    }

    #[test]
    fn test_ungrouped_mutations_notify_each() {
        let (mut tree, events, _sub) = recording_tree();
        tree.add_file(&NodePath::from("/a"), Metadata::new()).unwrap();
        tree.add_file(&NodePath::from("/b"), Metadata::new()).unwrap();
        assert_eq!(change_count(&events), 2);
    }

    #[test]
    fn test_nested_transactions_coalesce() {
        let (mut tree, events, _sub) = recording_tree();

        tree.start_transaction();
        tree.add_file(&NodePath::from("/a"), Metadata::new()).unwrap();
        tree.start_transaction();
        tree.add_file(&NodePath::from("/b"), Metadata::new()).unwrap();
        tree.finish_transaction().unwrap();
        assert_eq!(change_count(&events), 0);
        tree.add_file(&NodePath::from("/c"), Metadata::new()).unwrap();
        tree.finish_transaction().unwrap();

        assert_eq!(change_count(&events), 1);
        assert_eq!(tree.transaction_depth(), 0);
    }

    #[test]
    fn test_empty_transaction_is_silent() {
        let (mut tree, events, _sub) = recording_tree();
        tree.start_transaction();
        tree.finish_transaction().unwrap();
        assert_eq!(change_count(&events), 0);
    }

    #[test]
    fn test_finish_without_start_is_imbalance() {
        let (mut tree, _events, _sub) = recording_tree();
        assert_eq!(
            tree.finish_transaction().unwrap_err(),
            ReplicaError::TransactionImbalance
        );
        assert_eq!(tree.transaction_depth(), 0);
    }

    #[test]
    fn test_reset_transactions_flushes_pending_change() {
        let (mut tree, events, _sub) = recording_tree();
        tree.start_transaction();
        tree.start_transaction();
        tree.add_file(&NodePath::from("/a"), Metadata::new()).unwrap();

        assert_eq!(tree.reset_transactions(), 2);
        assert_eq!(tree.transaction_depth(), 0);
        assert_eq!(change_count(&events), 1);
    }

    #[test]
    fn test_set_metadata_field_requires_node() {
        let (mut tree, _events, _sub) = recording_tree();
        assert!(tree
            .set_metadata_field(&NodePath::from("/x"), "selected", json!(true))
            .is_err());

        tree.add_file(&NodePath::from("/x"), Metadata::new()).unwrap();
        tree.set_metadata_field(&NodePath::from("/x"), "selected", json!(true))
            .unwrap();
        assert_eq!(
            tree.metadata(&NodePath::from("/x")).unwrap()["selected"],
            json!(true)
        );
    }

    #[test]
    fn test_clear_metadata_field_drops_empty_entry() {
        let (mut tree, _events, _sub) = recording_tree();
        tree.add_file(&NodePath::from("/x"), meta(json!({ "loading": true })))
            .unwrap();
        tree.clear_metadata_field(&NodePath::from("/x"), "loading");
        assert!(tree.metadata(&NodePath::from("/x")).is_none());
    }
}
