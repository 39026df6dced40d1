use crate::types::{Collection, NormalizedEvent, RawDocument, SessionContext};

/// A live query the listener keeps open for the current session.
/// Actual subscriptions live in rendezvous-notify.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LiveQuery {
    /// Matches this session created.
    MatchesAsInitiator { event_id: String, session_id: String },
    /// Matches another attendee created with this session.
    MatchesAsCounterpart { event_id: String, session_id: String },
    /// Messages addressed to this profile.
    MessagesTo { event_id: String, profile_id: String },
}

impl LiveQuery {
    /// The three queries a session listens on.
    pub fn for_session(ctx: &SessionContext) -> [LiveQuery; 3] {
        [
            LiveQuery::MatchesAsInitiator {
                event_id: ctx.event_id.clone(),
                session_id: ctx.session_id.clone(),
            },
            LiveQuery::MatchesAsCounterpart {
                event_id: ctx.event_id.clone(),
                session_id: ctx.session_id.clone(),
            },
            LiveQuery::MessagesTo {
                event_id: ctx.event_id.clone(),
                profile_id: ctx.profile_id.clone(),
            },
        ]
    }

    pub fn collection(&self) -> Collection {
        match self {
            LiveQuery::MatchesAsInitiator { .. } | LiveQuery::MatchesAsCounterpart { .. } => {
                Collection::Matches
            }
            LiveQuery::MessagesTo { .. } => Collection::Messages,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            LiveQuery::MatchesAsInitiator { .. } => "matches_as_initiator",
            LiveQuery::MatchesAsCounterpart { .. } => "matches_as_counterpart",
            LiveQuery::MessagesTo { .. } => "messages_to_me",
        }
    }

    /// Whether `doc` belongs to this query's result set.
    pub fn matches(&self, doc: &RawDocument) -> bool {
        if doc.collection != self.collection() {
            return false;
        }
        let (event_id, field, expected) = match self {
            LiveQuery::MatchesAsInitiator {
                event_id,
                session_id,
            } => (event_id, "initiator_session_id", session_id),
            LiveQuery::MatchesAsCounterpart {
                event_id,
                session_id,
            } => (event_id, "counterpart_session_id", session_id),
            LiveQuery::MessagesTo {
                event_id,
                profile_id,
            } => (event_id, "recipient_profile_id", profile_id),
        };
        doc.str_field("event_id") == Some(event_id.as_str())
            && doc.str_field(field) == Some(expected.as_str())
    }
}

/// An event tagged with the session epoch it was observed under.
///
/// The router drops anything whose epoch no longer matches the live session.
#[derive(Debug, Clone)]
pub struct ScopedEvent {
    pub epoch: u64,
    pub event: NormalizedEvent,
}
