//! tree-sync-core: Client-side replica of a remote file tree.
//!
//! This crate provides:
//! - The action protocol exchanged with the remote authority
//! - A tree replica with re-entrant transactions and coalesced change notifications
//! - A serial work queue for applying filesystem events in order
//! - Correlation of outbound requests with their responses
//! - `TreeSync`, which ties these together behind a `Transport`

pub mod action;
pub mod adapter;
pub mod error;
pub mod events;
pub mod path;
pub mod requests;
pub mod sync;
pub mod transport;
pub mod tree;
pub mod work_queue;

pub use action::{Action, FsEvent, FsEventKind, InitialState, Request, RequestId, Response, TreeState};
pub use adapter::{FsEventAdapter, WatcherAdapter};
pub use error::{OperationError, ProtocolError, SyncError};
pub use events::{EventBus, Subscription, SyncEvent};
pub use path::NodePath;
pub use requests::{Completion, PendingRequests};
pub use sync::TreeSync;
pub use transport::{ChannelTransport, Transport, TransportError};
pub use tree::{Metadata, Node, NodeKind, ReplicaError, SharedTree, Tree, TreeSnapshot};
pub use work_queue::{QueueHooks, QueueState, WorkItem, WorkQueue};
