//! User-facing copy for each presentation of an event.

use rendezvous_core::types::NormalizedEvent;

/// Title/body pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text {
    pub title: String,
    pub body: String,
}

/// The initiator's "it's a match" alert.
pub fn match_alert(counterpart_name: &str) -> Text {
    Text {
        title: format!("It's a match with {counterpart_name}!"),
        body: "You both liked each other. Start the conversation?".into(),
    }
}

/// In-app banner for an incoming match or message.
pub fn toast(event: &NormalizedEvent) -> Text {
    match event {
        NormalizedEvent::Match {
            counterpart_display_name,
            ..
        } => Text {
            title: format!("New match: {counterpart_display_name}"),
            body: "Tap to say hi.".into(),
        },
        NormalizedEvent::Message {
            sender_display_name,
            content_preview,
            ..
        } => Text {
            title: sender_display_name.clone(),
            body: message_body(content_preview),
        },
    }
}

/// Local notification shown while the app is in the background.
pub fn local(event: &NormalizedEvent) -> Text {
    match event {
        NormalizedEvent::Match {
            counterpart_display_name,
            ..
        } => Text {
            title: "It's a match!".into(),
            body: format!("{counterpart_display_name} liked you back."),
        },
        NormalizedEvent::Message {
            sender_display_name,
            content_preview,
            ..
        } => Text {
            title: format!("Message from {sender_display_name}"),
            body: message_body(content_preview),
        },
    }
}

fn message_body(preview: &str) -> String {
    if preview.is_empty() {
        "Sent you a message".into()
    } else {
        preview.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn empty_message_gets_placeholder_body() {
        let ev = NormalizedEvent::Message {
            id: "m".into(),
            created_at: Utc::now(),
            sender_session_id: "s".into(),
            sender_display_name: "Kim".into(),
            content_preview: String::new(),
        };
        assert_eq!(toast(&ev).body, "Sent you a message");
        assert_eq!(local(&ev).title, "Message from Kim");
    }

    #[test]
    fn match_alert_names_the_counterpart() {
        assert!(match_alert("Dana").title.contains("Dana"));
    }
}
