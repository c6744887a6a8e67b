//! WebSocket connection to the remote authority.
//!
//! The stream is split into two tasks: a writer that drains outbound actions
//! as JSON text frames, and a reader that forwards every data frame as raw
//! bytes. The synchronizer only sees the `Transport` side and a byte stream.

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use tree_sync_core::{Action, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Outbound {
    Action(Action),
    Close,
}

/// `Transport` backed by the writer task of a WebSocket connection.
#[derive(Clone)]
pub struct WebSocketTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl WebSocketTransport {
    /// Send a close frame after everything already queued, then stop writing.
    pub fn close(&self) {
        // Writer already gone means the socket is closed anyway
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Transport for WebSocketTransport {
    fn send(&self, action: Action) -> std::result::Result<(), TransportError> {
        self.tx
            .send(Outbound::Action(action))
            .map_err(|_| TransportError::Closed)
    }
}

/// Raw inbound frames. Ends when the connection closes.
pub struct Inbound {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl Stream for Inbound {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Inbound {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Open a connection to the authority at `config.url`.
pub async fn connect(config: &ClientConfig) -> Result<(WebSocketTransport, Inbound)> {
    let (ws_stream, _) = connect_async(config.url.as_str())
        .await
        .map_err(|source| ClientError::Connect {
            url: config.url.clone(),
            source,
        })?;
    info!("Connected to {}", config.url);

    let (write, read) = ws_stream.split();

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write, out_rx));

    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_loop(read, in_tx, config.max_message_size));

    Ok((
        WebSocketTransport { tx: out_tx },
        Inbound { rx: in_rx, reader },
    ))
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Action(action) => {
                let kind = action.kind();
                if let Err(e) = write.send(Message::Text(action.encode())).await {
                    error!("Failed to send {} action: {}", kind, e);
                    break;
                }
                debug!("Sent {} action", kind);
            }
            Outbound::Close => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }
    debug!("Writer stopped");
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    max_message_size: usize,
) {
    loop {
        let data = match read.next().await {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) => {
                debug!("Received close frame");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                debug!("Connection closed");
                break;
            }
            Some(Err(e)) => {
                error!("WebSocket error: {}", e);
                break;
            }
            None => {
                debug!("Stream ended");
                break;
            }
        };

        if data.len() > max_message_size {
            warn!(
                "Message exceeds max size ({} > {}), dropping",
                data.len(),
                max_message_size
            );
            continue;
        }
        if tx.send(data).is_err() {
            break;
        }
    }
    info!("Connection to authority closed");
}
