//! Serialized execution of deferred work items.
//!
//! Items run on a dedicated Tokio task, strictly one at a time and in push
//! order. The queue reports its busy periods through two hooks: `on_start`
//! when it leaves the idle state (with the number of queued items) and
//! `on_finish` when it drains. Every busy period gets exactly one pair.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// A deferred unit of work.
pub type WorkItem = BoxFuture<'static, ()>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Work queue is closed")]
pub struct QueueClosed;

/// Lifecycle callbacks for busy periods.
pub struct QueueHooks {
    pub on_start: Box<dyn Fn(usize) + Send + Sync>,
    pub on_finish: Box<dyn Fn() + Send + Sync>,
}

impl QueueHooks {
    pub fn new(
        on_start: impl Fn(usize) + Send + Sync + 'static,
        on_finish: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_start: Box::new(on_start),
            on_finish: Box::new(on_finish),
        }
    }

    /// Hooks that do nothing.
    pub fn noop() -> Self {
        Self::new(|_| {}, || {})
    }
}

/// Observable queue state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueState {
    /// Items pushed but not yet completed (including the running one)
    pub queued: usize,
    /// Between `on_start` and `on_finish`
    pub busy: bool,
}

impl QueueState {
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && !self.busy
    }
}

/// FIFO work queue with at most one item in flight.
///
/// Must be created inside a Tokio runtime.
pub struct WorkQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<WorkItem>>>,
    state: Arc<watch::Sender<QueueState>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueue {
    pub fn new(hooks: QueueHooks) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(QueueState::default());
        let state = Arc::new(state);

        let worker = tokio::spawn(Self::run(rx, Arc::clone(&state), hooks));

        Self {
            tx: Mutex::new(Some(tx)),
            state,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue an item. Never blocks.
    pub fn push(&self, item: WorkItem) -> Result<(), QueueClosed> {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let tx = guard.as_ref().ok_or(QueueClosed)?;

        self.state.send_modify(|s| s.queued += 1);
        if tx.send(item).is_err() {
            self.state
                .send_modify(|s| s.queued = s.queued.saturating_sub(1));
            return Err(QueueClosed);
        }
        Ok(())
    }

    pub fn state(&self) -> QueueState {
        *self.state.borrow()
    }

    /// Wait until every pushed item has run and `on_finish` has fired.
    pub async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        // Err only if the worker is gone, in which case nothing is left to wait for
        let _ = rx.wait_for(QueueState::is_idle).await;
    }

    /// Stop accepting items, let the worker drain what is queued, then join it.
    pub async fn close(&self) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(tx);

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Work queue worker failed: {}", e);
            }
        }
    }

    async fn run(
        mut rx: mpsc::UnboundedReceiver<WorkItem>,
        state: Arc<watch::Sender<QueueState>>,
        hooks: QueueHooks,
    ) {
        while let Some(first) = rx.recv().await {
            let pending = state.borrow().queued;
            state.send_modify(|s| s.busy = true);
            debug!("tasks => {}", pending);
            (hooks.on_start)(pending);

            let mut next = Some(first);
            while let Some(item) = next.take() {
                if AssertUnwindSafe(item).catch_unwind().await.is_err() {
                    error!("Work item panicked; continuing with the next item");
                }
                state.send_modify(|s| s.queued = s.queued.saturating_sub(1));
                next = rx.try_recv().ok();
            }

            (hooks.on_finish)();
            state.send_modify(|s| s.busy = false);
        }
        debug!("Work queue closed");
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            worker.abort();
        }
    }
}
