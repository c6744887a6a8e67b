//! TreeSync: keeps the tree replica in step with the remote authority.
//!
//! Inbound actions are applied in delivery order:
//!
//! 1. `initialState` replaces the replica in one step
//! 2. `batch` opens a transaction, applies its actions recursively, closes it
//! 3. `event` is translated into a work item and queued; it mutates the
//!    replica later, under the transaction the work queue opens for its busy
//!    period
//! 4. `response` settles the matching pending request
//!
//! Outbound operations (`run`) apply an optimistic mutation first, then send
//! a `request` carrying a fresh correlation id. The optimistic mutation is
//! never rolled back when the authority rejects the request: the authority
//! reconciles through later `event` or `initialState` actions.

use crate::action::{Action, FsEvent, Request, RequestId, Response};
use crate::adapter::{FsEventAdapter, WatcherAdapter, LOADING_FIELD};
use crate::error::{ProtocolError, Result, SyncError};
use crate::events::{EventBus, Subscription, SyncEvent};
use crate::path::NodePath;
use crate::requests::{Completion, PendingRequests};
use crate::transport::Transport;
use crate::tree::{Metadata, Node, NodeKind, SharedTree, Tree, TreeSnapshot};
use crate::work_queue::{QueueHooks, QueueState, WorkQueue};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Report a structural failure: log it and notify subscribers.
fn report_fatal(events: &EventBus, err: &SyncError) {
    let kind = match err {
        SyncError::Protocol(_) => "protocol",
        SyncError::TransactionImbalance(_) => "transactionImbalance",
        _ => "internal",
    };
    error!("{}", err);
    events.emit_fatal(kind, err.to_string());
}

/// Outbound operation with its arguments validated.
#[derive(Debug, Clone, PartialEq)]
enum Operation {
    WriteFile(NodePath),
    Mkdir(NodePath),
    Rename(NodePath, NodePath),
    Remove(NodePath),
    /// Method without a local counterpart; sent as-is
    Passthrough,
}

impl Operation {
    fn parse(method: &str, args: &[Value]) -> Result<Self> {
        let path_arg = |index: usize| -> Result<NodePath> {
            args.get(index)
                .and_then(Value::as_str)
                .map(NodePath::from)
                .ok_or_else(|| SyncError::InvalidArguments {
                    method: method.to_string(),
                    reason: format!("argument {} must be a path string", index),
                })
        };

        match method {
            "writeFile" => Ok(Operation::WriteFile(path_arg(0)?)),
            "mkdir" => Ok(Operation::Mkdir(path_arg(0)?)),
            "rename" => Ok(Operation::Rename(path_arg(0)?, path_arg(1)?)),
            "remove" => Ok(Operation::Remove(path_arg(0)?)),
            _ => Ok(Operation::Passthrough),
        }
    }
}

fn loading() -> Metadata {
    let mut meta = Metadata::new();
    meta.insert(LOADING_FIELD.to_string(), Value::Bool(true));
    meta
}

/// Client-side synchronizer for one remote tree.
///
/// Must be created inside a Tokio runtime (the work queue runs on its own task).
/// Event subscribers are called while the replica is locked; they receive
/// snapshots and must not call back into this synchronizer's tree accessors.
pub struct TreeSync<T: Transport> {
    transport: T,
    tree: SharedTree,
    events: Arc<EventBus>,
    requests: Mutex<PendingRequests>,
    queue: WorkQueue,
    adapter: Box<dyn WatcherAdapter>,
}

impl<T: Transport> TreeSync<T> {
    pub fn new(transport: T) -> Self {
        Self::with_adapter(transport, FsEventAdapter)
    }

    pub fn with_adapter(transport: T, adapter: impl WatcherAdapter + 'static) -> Self {
        let events = Arc::new(EventBus::new());
        let tree: SharedTree = Arc::new(Mutex::new(Tree::new(Arc::clone(&events))));

        let start_tree = Arc::clone(&tree);
        let finish_tree = Arc::clone(&tree);
        let finish_events = Arc::clone(&events);
        let queue = WorkQueue::new(QueueHooks::new(
            move |_pending| lock(&start_tree).start_transaction(),
            move || {
                let finished = lock(&finish_tree).finish_transaction();
                if let Err(e) = finished {
                    let err = SyncError::TransactionImbalance(format!("work queue finish: {}", e));
                    report_fatal(&finish_events, &err);
                }
            },
        ));

        Self {
            transport,
            tree,
            events,
            requests: Mutex::new(PendingRequests::new()),
            queue,
            adapter: Box::new(adapter),
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Decode and apply one raw message from the transport.
    ///
    /// Failures are reported as `SyncEvent::Fatal` and returned; the
    /// synchronizer stays usable for the next message.
    pub fn handle_message(&self, data: &[u8]) -> Result<()> {
        match Action::decode(data) {
            Ok(action) => self.dispatch(action),
            Err(e) => {
                let err = SyncError::from(e);
                report_fatal(&self.events, &err);
                Err(err)
            }
        }
    }

    /// Apply raw messages from `inbound` until the stream ends.
    pub async fn process_inbound<S>(&self, mut inbound: S)
    where
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        while let Some(data) = inbound.next().await {
            // Already reported as a fatal event
            let _ = self.handle_message(&data);
        }
        debug!("Inbound stream ended");
    }

    /// Apply one decoded action.
    ///
    /// Every failure inside a batch is reported; the first one is returned.
    /// A failing action does not stop the rest of its batch.
    pub fn dispatch(&self, action: Action) -> Result<()> {
        let mut failures = Vec::new();
        {
            let mut tree = lock(&self.tree);
            self.perform(&mut tree, action, &mut failures);
        }

        for failure in &failures {
            report_fatal(&self.events, failure);
        }
        match failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn perform(&self, tree: &mut Tree, action: Action, failures: &mut Vec<SyncError>) {
        match action {
            Action::InitialState(initial) => {
                info!("Loading initial tree at {}", initial.root_path);
                tree.set(&initial.root_path, &initial.state.tree, &initial.state.stat);
            }
            Action::Batch(actions) => {
                info!("Executing batch => {}", actions.len());
                tree.start_transaction();
                for action in actions {
                    self.perform(tree, action, failures);
                }
                if let Err(e) = tree.finish_transaction() {
                    failures.push(SyncError::TransactionImbalance(format!("batch finish: {}", e)));
                }
            }
            Action::Event(event) => {
                if let Err(e) = self.enqueue(event) {
                    failures.push(e);
                }
            }
            Action::Response(response) => {
                if let Err(e) = self.settle(response) {
                    failures.push(e.into());
                }
            }
            outbound @ (Action::Request(_) | Action::WatchPath { .. }) => {
                failures.push(ProtocolError::UnexpectedInbound(outbound.kind().to_string()).into());
            }
        }
    }

    fn enqueue(&self, event: FsEvent) -> Result<()> {
        debug!("task => {} {}", event.name.as_str(), event.path);
        let item = self.adapter.translate(&self.tree, event);
        self.queue.push(item)?;
        Ok(())
    }

    fn settle(&self, response: Response) -> std::result::Result<(), ProtocolError> {
        let mut requests = lock(&self.requests);
        if response.error {
            requests.reject(response.id, response.payload)
        } else {
            requests.resolve(response.id, response.payload)
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Apply the optimistic mutation for `method`, send the request, and
    /// return the handle that settles when the response arrives.
    ///
    /// `writeFile`, `mkdir`, `rename` and `remove` have optimistic mutations;
    /// any other method is sent without touching the replica. If the
    /// optimistic mutation cannot be applied (e.g. renaming a node the
    /// replica does not know) the request is still sent.
    pub fn run(&self, method: &str, args: Vec<Value>) -> Result<Completion> {
        let operation = Operation::parse(method, &args)?;
        self.apply_optimistic(&operation);

        let (id, completion) = lock(&self.requests).issue(method, &args);
        let request = Action::Request(Request {
            id,
            method_name: method.to_string(),
            args,
        });
        if let Err(e) = self.transport.send(request) {
            lock(&self.requests).withdraw(id);
            return Err(e.into());
        }
        debug!("Sent request {} ({})", id, method);
        Ok(completion)
    }

    fn apply_optimistic(&self, operation: &Operation) {
        let mut tree = lock(&self.tree);
        let applied = match operation {
            Operation::WriteFile(path) => tree.create_file(path, loading()),
            Operation::Mkdir(path) => tree.create_dir(path, loading()),
            Operation::Rename(from, to) => tree.move_node(from, to),
            Operation::Remove(path) => match tree.get(path).map(|node| node.kind) {
                Some(NodeKind::Directory) => tree.remove_dir(path),
                Some(NodeKind::File) => tree.remove_file(path),
                None => Ok(()),
            },
            Operation::Passthrough => Ok(()),
        };
        if let Err(e) = applied {
            warn!("Optimistic update skipped for {:?}: {}", operation, e);
        }
    }

    pub fn write_file(&self, path: &str) -> Result<Completion> {
        self.run("writeFile", vec![json!(path)])
    }

    pub fn mkdir(&self, path: &str) -> Result<Completion> {
        self.run("mkdir", vec![json!(path)])
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<Completion> {
        self.run("rename", vec![json!(old_path), json!(new_path)])
    }

    pub fn remove(&self, path: &str) -> Result<Completion> {
        self.run("remove", vec![json!(path)])
    }

    /// Ask the remote side to watch `path`. Not correlated with any response.
    pub fn watch_path(&self, path: &str) -> Result<()> {
        self.transport.send(Action::WatchPath {
            path: path.to_string(),
        })?;
        Ok(())
    }

    // ========================================================================
    // Manual transactions and metadata
    // ========================================================================

    /// Open a transaction; changes until the matching `finish_operation`
    /// produce a single change notification.
    pub fn start_operation(&self) {
        lock(&self.tree).start_transaction();
    }

    pub fn finish_operation(&self) -> Result<()> {
        let finished = lock(&self.tree).finish_transaction();
        finished.map_err(|e| {
            let err = SyncError::TransactionImbalance(format!("finish_operation: {}", e));
            report_fatal(&self.events, &err);
            err
        })
    }

    /// Set a local metadata field (e.g. `selected`, `expanded`) on a node.
    pub fn update_node_metadata(&self, path: &str, field: &str, value: Value) -> Result<()> {
        lock(&self.tree).set_metadata_field(&NodePath::from(path), field, value)?;
        Ok(())
    }

    // ========================================================================
    // Read access and notifications
    // ========================================================================

    pub fn tree(&self) -> TreeSnapshot {
        lock(&self.tree).snapshot()
    }

    pub fn root_path(&self) -> Option<String> {
        lock(&self.tree).root_path().map(str::to_string)
    }

    pub fn node(&self, path: &str) -> Option<Node> {
        lock(&self.tree).get(&NodePath::from(path)).cloned()
    }

    pub fn metadata(&self, path: &str) -> Option<Metadata> {
        lock(&self.tree).metadata(&NodePath::from(path)).cloned()
    }

    /// Run `f` against the live replica.
    pub fn with_tree<R>(&self, f: impl FnOnce(&Tree) -> R) -> R {
        let tree = lock(&self.tree);
        f(&*tree)
    }

    /// Subscribe to change, node and fatal notifications.
    pub fn subscribe(&self, callback: impl Fn(SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    /// `(id, method)` of every request still awaiting a response.
    pub fn pending_requests(&self) -> Vec<(RequestId, String)> {
        lock(&self.requests).summary()
    }

    /// Drop every pending request; their completions yield `Abandoned`.
    ///
    /// For owners whose connection is gone and will never deliver responses.
    pub fn abandon_pending(&self) -> usize {
        let abandoned = lock(&self.requests).abandon_all();
        if abandoned > 0 {
            info!("Abandoned {} pending request(s)", abandoned);
        }
        abandoned
    }

    pub fn queue_state(&self) -> QueueState {
        self.queue.state()
    }

    /// Wait until every queued event has been applied.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Drain the work queue, stop it, and check transaction balance.
    ///
    /// Requests still pending are abandoned. Transactions left open are
    /// force-closed and reported as `TransactionImbalance`.
    pub async fn shutdown(&self) -> Result<()> {
        self.queue.close().await;

        self.abandon_pending();

        let open = lock(&self.tree).reset_transactions();
        if open > 0 {
            let err = SyncError::TransactionImbalance(format!(
                "{} transaction(s) still open at shutdown",
                open
            ));
            report_fatal(&self.events, &err);
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use serde_json::json;

    #[test]
    fn test_operation_parse_validates_paths() {
        assert_eq!(
            Operation::parse("rename", &[json!("/a"), json!("/b")]).unwrap(),
            Operation::Rename(NodePath::from("/a"), NodePath::from("/b"))
        );
        assert!(matches!(
            Operation::parse("rename", &[json!("/a")]),
            Err(SyncError::InvalidArguments { .. })
        ));
        assert!(matches!(
            Operation::parse("writeFile", &[json!(42)]),
            Err(SyncError::InvalidArguments { .. })
        ));
        assert_eq!(
            Operation::parse("copy", &[]).unwrap(),
            Operation::Passthrough
        );
    }

    #[tokio::test]
    async fn test_invalid_arguments_send_nothing() {
        let (transport, mut rx) = ChannelTransport::new();
        let sync = TreeSync::new(transport);

        assert!(sync.run("mkdir", vec![]).is_err());
        assert!(rx.try_recv().is_err());
        assert!(sync.pending_requests().is_empty());
        assert!(sync.tree().nodes.is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_withdraws_request() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        let sync = TreeSync::new(transport);

        let err = sync.write_file("/a.txt").unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        assert!(sync.pending_requests().is_empty());
        // Optimistic mutation is kept
        assert!(sync.node("/a.txt").is_some());
    }

    #[tokio::test]
    async fn test_passthrough_method_leaves_tree_alone() {
        let (transport, mut rx) = ChannelTransport::new();
        let sync = TreeSync::new(transport);

        let completion = sync.run("copy", vec![json!("/a"), json!("/b")]).unwrap();
        assert!(sync.tree().nodes.is_empty());
        assert!(matches!(rx.try_recv().unwrap(), Action::Request(r) if r.id == completion.id()));
    }

    #[tokio::test]
    async fn test_inbound_request_is_protocol_error() {
        let (transport, _rx) = ChannelTransport::new();
        let sync = TreeSync::new(transport);

        let err = sync
            .dispatch(Action::WatchPath { path: "/x".into() })
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::UnexpectedInbound(kind)) if kind == "watchPath"
        ));
    }

    #[tokio::test]
    async fn test_update_node_metadata() {
        let (transport, _rx) = ChannelTransport::new();
        let sync = TreeSync::new(transport);

        assert!(sync.update_node_metadata("/x", "expanded", json!(true)).is_err());
        sync.mkdir("/x").unwrap();
        sync.update_node_metadata("/x", "expanded", json!(true)).unwrap();

        let meta = sync.metadata("/x").unwrap();
        assert_eq!(meta["expanded"], json!(true));
        assert_eq!(meta["loading"], json!(true));
    }
}
