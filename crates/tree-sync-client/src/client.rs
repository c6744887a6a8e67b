//! A synchronizer wired to a live WebSocket connection.

use crate::config::ClientConfig;
use crate::connection::{self, WebSocketTransport};
use crate::error::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tree_sync_core::{OperationError, TreeSync};

pub struct Client {
    session: String,
    sync: Arc<TreeSync<WebSocketTransport>>,
    inbound: JoinHandle<()>,
    /// Flips to `true` once the authority connection is gone
    closed: watch::Receiver<bool>,
}

impl Client {
    /// Connect, start applying inbound actions, and request the configured watches.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let session = uuid::Uuid::new_v4().to_string();
        let (transport, inbound) = connection::connect(config).await?;
        let sync = Arc::new(TreeSync::new(transport));

        let (closed_tx, closed) = watch::channel(false);
        let reader_sync = Arc::clone(&sync);
        let inbound = tokio::spawn(async move {
            reader_sync.process_inbound(inbound).await;
            // No responses can arrive once the connection is gone
            reader_sync.abandon_pending();
            let _ = closed_tx.send(true);
        });

        for path in &config.watch_paths {
            sync.watch_path(path)?;
            debug!("[{}] Watching {}", session, path);
        }
        info!("[{}] Session started", session);

        Ok(Self {
            session,
            sync,
            inbound,
            closed,
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn sync(&self) -> &TreeSync<WebSocketTransport> {
        &self.sync
    }

    /// Issue one operation and wait for the authority's answer.
    ///
    /// Fails with `OperationError::Abandoned` if the connection closes first.
    pub async fn run(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        info!("[{}] {} {:?}", self.session, method, args);
        let completion = self.sync.run(method, args)?;
        let id = completion.id();
        let mut closed = self.closed.clone();

        tokio::select! {
            outcome = completion => Ok(outcome?),
            // Err means the reader task is gone too
            _ = closed.wait_for(|closed| *closed) => {
                debug!("[{}] Connection closed before response to {}", self.session, id);
                Err(OperationError::Abandoned.into())
            }
        }
    }

    /// Resolves once the authority closes the connection.
    pub async fn closed(&mut self) {
        let _ = self.closed.wait_for(|closed| *closed).await;
    }

    /// Close the connection and shut the synchronizer down.
    pub async fn shutdown(self) -> Result<()> {
        self.sync.transport().close();
        let result = self.sync.shutdown().await;
        self.inbound.abort();
        info!("[{}] Session ended", self.session);
        Ok(result?)
    }
}
