//! Client configuration.

use thiserror::Error;

/// Default authority address.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:8080";

/// Environment variable consulted when no URL is given explicitly.
pub const URL_ENV: &str = "TREE_SYNC_URL";

/// Maximum inbound frame size (50MB).
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid authority URL {0:?}: expected ws:// or wss://")]
    InvalidUrl(String),

    #[error("Watch path must be absolute, got {0:?}")]
    RelativeWatchPath(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Resolved client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// WebSocket address of the remote authority
    pub url: String,
    /// Paths to request watching for right after connecting
    pub watch_paths: Vec<String>,
    /// Frames larger than this are dropped
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            watch_paths: Vec::new(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    /// Defaults, with the URL taken from `TREE_SYNC_URL` when set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(url) = lookup(URL_ENV).filter(|url| !url.is_empty()) {
            config = config.with_url(url)?;
        }
        Ok(config)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl(url));
        }
        self.url = url;
        Ok(self)
    }

    pub fn with_watch_paths(mut self, paths: Vec<String>) -> Result<Self> {
        if let Some(relative) = paths.iter().find(|p| !p.starts_with('/')) {
            return Err(ConfigError::RelativeWatchPath(relative.clone()));
        }
        self.watch_paths = paths;
        Ok(self)
    }
}
