//! Error types shared by the synchronizer.

use crate::action::RequestId;
use crate::transport::TransportError;
use crate::tree::ReplicaError;
use crate::work_queue::QueueClosed;
use serde_json::Value;
use thiserror::Error;

/// Failures in the message stream itself. Never tied to a single request.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Response for unknown request id {0}")]
    UnknownRequest(RequestId),

    #[error("Malformed action: {0}")]
    Malformed(String),

    #[error("Unexpected inbound action: {0}")]
    UnexpectedInbound(String),
}

/// Failure of one outbound operation, delivered to its completion handle only.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OperationError {
    /// The remote authority answered with `error: true`.
    #[error("Operation rejected: {0}")]
    Rejected(Value),

    /// The synchronizer went away before a response arrived.
    #[error("Operation abandoned before a response arrived")]
    Abandoned,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),

    #[error("Transaction imbalance: {0}")]
    TransactionImbalance(String),

    #[error("Invalid arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SyncError>;
