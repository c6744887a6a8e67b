//! Event infrastructure for tree-sync-core.
//!
//! Provides `SyncEvent` for change notifications and `EventBus` for subscriptions.
//! Callbacks may be invoked from the dispatcher or from the work queue task, so the
//! bus is `Send + Sync` and shared through `Arc`.

use crate::tree::TreeSnapshot;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the replica and the synchronizer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// The replica changed. Emitted once per outermost transaction, or once per
    /// mutation made outside any transaction.
    TreeChanged {
        /// Replica contents after the change.
        snapshot: Arc<TreeSnapshot>,
        /// When the change was committed, in milliseconds since Unix epoch.
        timestamp: f64,
    },
    /// A single node mutation, emitted immediately (not coalesced).
    NodeChanged {
        /// Operation: "add", "remove", "move", "update" or "set".
        operation: String,
        /// Path affected by the operation.
        path: String,
        /// New path (for move operations only).
        #[serde(rename = "newPath")]
        new_path: Option<String>,
        /// When the mutation occurred, in milliseconds since Unix epoch.
        timestamp: f64,
    },
    /// Structural failure the owner of the synchronizer must know about.
    ///
    /// Processing continues after a fatal notification.
    Fatal {
        /// Error class: "protocol", "transactionImbalance" or "internal"
        /// (transport and work queue failures).
        kind: String,
        /// Human-readable description.
        message: String,
        /// When the failure was observed, in milliseconds since Unix epoch.
        timestamp: f64,
    },
}

/// Current time in milliseconds since Unix epoch.
pub(crate) fn now_millis() -> f64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing sync events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Clone the callback list to prevent deadlock if a callback calls subscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    /// Emit a `Fatal` event.
    pub(crate) fn emit_fatal(&self, kind: &str, message: String) {
        self.emit(SyncEvent::Fatal {
            kind: kind.to_string(),
            message,
            timestamp: now_millis(),
        });
    }
}
