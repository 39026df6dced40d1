//! rendezvous-notify: the async side of the notification engine.
//! Listens for match and message documents, deduplicates them across
//! listeners and restarts, and decides between an in-app render and a
//! delayed local notification.

pub mod content;
pub mod dedup;
pub mod error;
pub mod host;
pub mod listener;
pub mod recorder;
pub mod router;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod sources;
pub mod store;

pub use rendezvous_core::types;
