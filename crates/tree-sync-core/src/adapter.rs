//! Watcher adapter: turns remote filesystem events into work items.
//!
//! The remote side reports events in watcher vocabulary (`add`, `addDir`,
//! `change`, `unlink`, `unlinkDir`). The adapter binds one event against the
//! live replica and returns a work item that applies it when the work queue
//! gets to it.

use crate::action::{FsEvent, FsEventKind};
use crate::tree::{Metadata, ReplicaError, SharedTree, Tree};
use crate::work_queue::WorkItem;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Metadata flag set on nodes created optimistically and not yet confirmed.
pub const LOADING_FIELD: &str = "loading";

/// Translates filesystem events into deferred replica mutations.
pub trait WatcherAdapter: Send + Sync {
    fn translate(&self, tree: &SharedTree, event: FsEvent) -> WorkItem;
}

/// Default adapter for watcher-style event names.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsEventAdapter;

impl WatcherAdapter for FsEventAdapter {
    fn translate(&self, tree: &SharedTree, event: FsEvent) -> WorkItem {
        let tree = Arc::clone(tree);
        Box::pin(async move {
            let mut tree = tree.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = apply_event(&mut tree, &event) {
                warn!(
                    "Failed to apply {} event for {}: {}",
                    event.name.as_str(),
                    event.path,
                    e
                );
            }
        })
    }
}

/// Apply one filesystem event to the replica.
pub fn apply_event(tree: &mut Tree, event: &FsEvent) -> Result<(), ReplicaError> {
    let path = &event.path;
    debug!("Applying {} {}", event.name.as_str(), path);

    match event.name {
        FsEventKind::Add | FsEventKind::AddDir => {
            if event.name == FsEventKind::Add {
                tree.add_file(path, Metadata::new())?;
            } else {
                tree.add_dir(path, Metadata::new())?;
            }
            record_stat(tree, event)?;
            // The authority has the node now
            tree.clear_metadata_field(path, LOADING_FIELD);
        }
        FsEventKind::Change => {
            if tree.get(path).is_none() {
                tree.add_file(path, Metadata::new())?;
            }
            record_stat(tree, event)?;
        }
        FsEventKind::Unlink => tree.remove_file(path)?,
        FsEventKind::UnlinkDir => tree.remove_dir(path)?,
    }
    Ok(())
}

fn record_stat(tree: &mut Tree, event: &FsEvent) -> Result<(), ReplicaError> {
    if event.stat == Value::Null {
        return Ok(());
    }
    tree.set_stat(&event.path, event.stat.clone())
}
