//! Error types for the notification engine's collaborator boundaries.
//!
//! None of these ever escape the router: they are logged and degraded around.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("blocking store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("host UI failed to render: {0}")]
    Render(String),

    #[error("local notification delivery failed: {0}")]
    Delivery(String),

    #[error("push transport failed: {0}")]
    Push(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("subscription to {query} failed: {reason}")]
    Subscribe { query: &'static str, reason: String },

    #[error("feed io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lookup failure for the mute filter. Callers fail open on it.
#[derive(Debug, Error)]
#[error("mute lookup failed: {0}")]
pub struct MuteLookupError(pub String);
