//! tree-sync-client: WebSocket client for a remote file tree.
//!
//! Thin library layer under the `tree-sync` binary, exposed so integration
//! tests can drive a client against a local authority.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;

pub use client::Client;
pub use config::{ClientConfig, ConfigError};
pub use connection::{Inbound, WebSocketTransport};
pub use error::ClientError;
