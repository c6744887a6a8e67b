//! Pending-request correlation.
//!
//! Every outbound request gets an id that is unique for the lifetime of the
//! process. The pending map itself belongs to one synchronizer instance, so
//! independent synchronizers never see each other's entries.

use crate::action::RequestId;
use crate::error::{OperationError, ProtocolError};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> RequestId {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

type Outcome = Result<Value, OperationError>;

/// An in-flight request awaiting its response.
pub struct PendingRequest {
    /// Method name, kept for diagnostics
    pub method: String,
    /// Arguments, kept for diagnostics
    pub args: Vec<Value>,
    tx: oneshot::Sender<Outcome>,
}

/// Handle the caller awaits for the outcome of a request.
///
/// Resolves to the response payload, `OperationError::Rejected` with the
/// payload of an error response, or `OperationError::Abandoned` if the
/// request was dropped without a response.
#[derive(Debug)]
pub struct Completion {
    id: RequestId,
    rx: oneshot::Receiver<Outcome>,
}

impl Completion {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for Completion {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(OperationError::Abandoned)))
    }
}

/// Pending requests keyed by id.
#[derive(Default)]
pub struct PendingRequests {
    entries: HashMap<RequestId, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id and register a pending entry for it.
    pub fn issue(&mut self, method: &str, args: &[Value]) -> (RequestId, Completion) {
        let id = next_request_id();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                args: args.to_vec(),
                tx,
            },
        );
        (id, Completion { id, rx })
    }

    /// Complete the request successfully with `payload`.
    pub fn resolve(&mut self, id: RequestId, payload: Value) -> Result<(), ProtocolError> {
        self.complete(id, Ok(payload))
    }

    /// Fail the request with `payload`.
    pub fn reject(&mut self, id: RequestId, payload: Value) -> Result<(), ProtocolError> {
        self.complete(id, Err(OperationError::Rejected(payload)))
    }

    fn complete(&mut self, id: RequestId, outcome: Outcome) -> Result<(), ProtocolError> {
        let pending = self
            .entries
            .remove(&id)
            .ok_or(ProtocolError::UnknownRequest(id))?;
        debug!(
            "Request {} ({}) {}",
            id,
            pending.method,
            if outcome.is_ok() { "resolved" } else { "rejected" }
        );
        if pending.tx.send(outcome).is_err() {
            debug!("Completion for request {} was dropped before the response", id);
        }
        Ok(())
    }

    /// Remove an entry without completing it. Its completion yields `Abandoned`.
    pub fn withdraw(&mut self, id: RequestId) -> Option<PendingRequest> {
        self.entries.remove(&id)
    }

    /// Drop every entry. Returns how many were pending.
    pub fn abandon_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(id, method)` of every pending request, ordered by id.
    pub fn summary(&self) -> Vec<(RequestId, String)> {
        let mut summary: Vec<_> = self
            .entries
            .iter()
            .map(|(id, pending)| (*id, pending.method.clone()))
            .collect();
        summary.sort_by_key(|(id, _)| *id);
        summary
    }
}
