//! Transport trait for the outbound half of the message channel.
//!
//! Implementations:
//! - `ChannelTransport` - Tokio channel, for tests and in-process embedding
//! - `WebSocketTransport` (in tree-sync-client) - JSON text frames over WebSocket
//!
//! Inbound messages are not pulled through this trait: whoever owns the
//! connection feeds them to `TreeSync::handle_message` in delivery order.

use crate::action::Action;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Outbound side of the connection to the remote authority.
///
/// `send` must not block: it is called from inside a synchronous dispatcher
/// turn. Implementations queue the action and deliver it in call order.
pub trait Transport: Send + Sync {
    fn send(&self, action: Action) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, action: Action) -> Result<()> {
        (**self).send(action)
    }
}

/// Transport backed by an unbounded Tokio channel.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Action>,
}

impl ChannelTransport {
    /// Create a transport and the receiver that observes everything it sends.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Action>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, action: Action) -> Result<()> {
        self.tx.send(action).map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_transport_preserves_order() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.send(Action::WatchPath { path: "/a".into() }).unwrap();
        transport.send(Action::WatchPath { path: "/b".into() }).unwrap();

        assert_eq!(rx.try_recv().unwrap(), Action::WatchPath { path: "/a".into() });
        assert_eq!(rx.try_recv().unwrap(), Action::WatchPath { path: "/b".into() });
    }

    #[test]
    fn test_channel_transport_reports_closed() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        let err = transport
            .send(Action::WatchPath { path: "/a".into() })
            .unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }
}
