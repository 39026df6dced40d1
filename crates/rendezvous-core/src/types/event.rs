use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discriminant of a [`NormalizedEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Match,
    Message,
}

/// A domain event that may deserve a user-visible notification.
///
/// Built by the listener from a raw database document, consumed by value by
/// the router. Fields are never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedEvent {
    Match {
        id: String,
        created_at: DateTime<Utc>,
        /// True when the current session created the match.
        is_initiator: bool,
        counterpart_session_id: String,
        counterpart_display_name: String,
    },
    Message {
        id: String,
        created_at: DateTime<Utc>,
        sender_session_id: String,
        sender_display_name: String,
        content_preview: String,
    },
}

impl NormalizedEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NormalizedEvent::Match { .. } => EventKind::Match,
            NormalizedEvent::Message { .. } => EventKind::Message,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            NormalizedEvent::Match { id, .. } | NormalizedEvent::Message { id, .. } => id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            NormalizedEvent::Match { created_at, .. }
            | NormalizedEvent::Message { created_at, .. } => *created_at,
        }
    }

    /// Session id of the other participant: the match counterpart or the
    /// message sender. This is also the conversation to open on press.
    pub fn other_session_id(&self) -> &str {
        match self {
            NormalizedEvent::Match {
                counterpart_session_id,
                ..
            } => counterpart_session_id,
            NormalizedEvent::Message {
                sender_session_id, ..
            } => sender_session_id,
        }
    }

    pub fn other_display_name(&self) -> &str {
        match self {
            NormalizedEvent::Match {
                counterpart_display_name,
                ..
            } => counterpart_display_name,
            NormalizedEvent::Message {
                sender_display_name,
                ..
            } => sender_display_name,
        }
    }
}
