//! Canonical keys for "the same real-world notification-worthy occurrence".
//!
//! Both participants' clients must derive the same key for one occurrence,
//! so participant pairs are sorted before formatting.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{EventKind, NormalizedEvent};

pub const MATCH_KEY_PREFIX: &str = "match_notification_";
pub const MESSAGE_KEY_PREFIX: &str = "message_notification_";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kind encoded in the key prefix, if it is one of ours.
    pub fn kind(&self) -> Option<EventKind> {
        if self.0.starts_with(MATCH_KEY_PREFIX) {
            Some(EventKind::Match)
        } else if self.0.starts_with(MESSAGE_KEY_PREFIX) {
            Some(EventKind::Message)
        } else {
            None
        }
    }

    /// Rebuild a key read back from storage. Returns `None` for foreign keys.
    pub fn parse(raw: &str) -> Option<Self> {
        let key = DedupKey(raw.to_string());
        key.kind().map(|_| key)
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DedupKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Key for a match between two sessions, independent of argument order.
pub fn match_key(session_a: &str, session_b: &str) -> DedupKey {
    let (lo, hi) = sorted_pair(session_a, session_b);
    DedupKey(format!("{MATCH_KEY_PREFIX}{lo}_{hi}"))
}

/// Key for a message between two sessions carrying `preview`.
///
/// Only the normalized preview is hashed. Messages longer than the preview
/// cap that agree on its first part map to the same key, and the second one
/// is suppressed inside the message window.
pub fn message_key(session_a: &str, session_b: &str, preview: &str) -> DedupKey {
    let (lo, hi) = sorted_pair(session_a, session_b);
    DedupKey(format!(
        "{MESSAGE_KEY_PREFIX}{lo}_{hi}_{}",
        content_hash(preview)
    ))
}

/// Key for `event` as observed by `own_session_id`.
pub fn key_for(event: &NormalizedEvent, own_session_id: &str) -> DedupKey {
    match event {
        NormalizedEvent::Match {
            counterpart_session_id,
            ..
        } => match_key(own_session_id, counterpart_session_id),
        NormalizedEvent::Message {
            sender_session_id,
            content_preview,
            ..
        } => message_key(own_session_id, sender_session_id, content_preview),
    }
}

/// Stable hex digest of message text. Surrounding whitespace is ignored so a
/// trailing newline from one client does not defeat dedup.
pub fn content_hash(preview: &str) -> String {
    format!("{:x}", md5::compute(preview.trim().as_bytes()))
}

fn sorted_pair(a: &str, b: &str) -> (String, String) {
    let (a, b) = (escape_id(a), escape_id(b));
    if a <= b { (a, b) } else { (b, a) }
}

/// Escape `%` and `_` so the `_` separator stays unambiguous.
fn escape_id(id: &str) -> String {
    id.replace('%', "%25").replace('_', "%5F")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    #[test]
    fn match_key_has_expected_shape() {
        assert_eq!(
            match_key("sess-b", "sess-a").as_str(),
            "match_notification_sess-a_sess-b"
        );
    }

    #[test]
    fn underscores_cannot_forge_a_different_pair() {
        // "a_b" + "c" must not collide with "a" + "b_c".
        assert_ne!(match_key("a_b", "c"), match_key("a", "b_c"));
    }

    #[test]
    fn message_key_depends_on_content() {
        let k1 = message_key("a", "b", "see you at the bar");
        let k2 = message_key("a", "b", "see you at the door");
        assert_ne!(k1, k2);
        assert_eq!(k1, message_key("b", "a", "see you at the bar\n"));
    }

    #[test]
    fn long_messages_sharing_the_preview_share_a_key() {
        use crate::normalize::{PREVIEW_MAX_CHARS, preview};
        let head = "x".repeat(PREVIEW_MAX_CHARS);
        let a = preview(&format!("{head} first ending"));
        let b = preview(&format!("{head} second ending"));
        assert_eq!(message_key("s1", "s2", &a), message_key("s1", "s2", &b));
        assert_ne!(
            message_key("s1", "s2", &preview("short one")),
            message_key("s1", "s2", &preview("short two"))
        );
    }

    #[test]
    fn key_for_uses_own_session_and_other_participant() {
        let incoming = NormalizedEvent::Match {
            id: "m1".into(),
            created_at: Utc::now(),
            is_initiator: false,
            counterpart_session_id: "sess-init".into(),
            counterpart_display_name: "Ari".into(),
        };
        let outgoing = NormalizedEvent::Match {
            id: "m1".into(),
            created_at: Utc::now(),
            is_initiator: true,
            counterpart_session_id: "sess-me".into(),
            counterpart_display_name: "Sam".into(),
        };
        assert_eq!(key_for(&incoming, "sess-me"), key_for(&outgoing, "sess-init"));
    }

    #[test]
    fn parse_recognizes_prefixes() {
        let key = match_key("x", "y");
        assert_eq!(DedupKey::parse(key.as_str()), Some(key));
        assert_eq!(
            DedupKey::parse("message_notification_a_b_00").and_then(|k| k.kind()),
            Some(EventKind::Message)
        );
        assert_eq!(DedupKey::parse("theme_preference"), None);
    }

    proptest! {
        #[test]
        fn match_key_is_commutative(a in "[a-zA-Z0-9_%-]{1,24}", b in "[a-zA-Z0-9_%-]{1,24}") {
            prop_assert_eq!(match_key(&a, &b), match_key(&b, &a));
        }

        #[test]
        fn message_key_is_commutative(
            a in "[a-z0-9_]{1,16}",
            b in "[a-z0-9_]{1,16}",
            text in ".{0,64}",
        ) {
            prop_assert_eq!(message_key(&a, &b, &text), message_key(&b, &a, &text));
        }

        #[test]
        fn distinct_pairs_give_distinct_match_keys(
            a in "[a-z_]{1,8}",
            b in "[a-z_]{1,8}",
            c in "[a-z_]{1,8}",
        ) {
            let mut left = [a.clone(), b.clone()];
            let mut right = [a.clone(), c.clone()];
            left.sort();
            right.sort();
            prop_assume!(left != right);
            prop_assert_ne!(match_key(&a, &b), match_key(&a, &c));
        }
    }
}
