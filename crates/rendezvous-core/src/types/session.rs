use serde::{Deserialize, Serialize};

/// Identity of the signed-in attendee for the current live event.
///
/// Every dedup key and every live query is derived from this value, so a
/// change of context invalidates anything computed from the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionContext {
    /// Per-event attendee session. Matches and messages reference this id.
    pub session_id: String,
    /// Long-lived profile id; messages are addressed to it.
    pub profile_id: String,
    /// The party, wedding, or conference the session belongs to.
    pub event_id: String,
}

impl SessionContext {
    pub fn new(
        session_id: impl Into<String>,
        profile_id: impl Into<String>,
        event_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            profile_id: profile_id.into(),
            event_id: event_id.into(),
        }
    }
}
