//! Raw database document → [`NormalizedEvent`].
//!
//! Pure functions; the listener calls these for every observed record.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::types::{Collection, NormalizedEvent, RawDocument, SessionContext};

/// Message previews longer than this are cut at a char boundary.
pub const PREVIEW_MAX_CHARS: usize = 160;

const UNKNOWN_NAME: &str = "Someone";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("{collection:?} document {doc_id} is missing field `{field}`")]
    MissingField {
        collection: Collection,
        doc_id: String,
        field: &'static str,
    },

    #[error("document {doc_id} has an unreadable created_at: {detail}")]
    InvalidTimestamp { doc_id: String, detail: String },

    #[error("match {doc_id} does not involve session {session_id}")]
    NotAParticipant { doc_id: String, session_id: String },

    #[error("message {doc_id} was sent by the current session")]
    SelfAuthored { doc_id: String },
}

/// Normalize `doc` from the point of view of `ctx`.
pub fn normalize(
    doc: &RawDocument,
    ctx: &SessionContext,
) -> Result<NormalizedEvent, NormalizeError> {
    let created_at = created_at(doc)?;
    match doc.collection {
        Collection::Matches => normalize_match(doc, ctx, created_at),
        Collection::Messages => normalize_message(doc, ctx, created_at),
    }
}

fn normalize_match(
    doc: &RawDocument,
    ctx: &SessionContext,
    created_at: DateTime<Utc>,
) -> Result<NormalizedEvent, NormalizeError> {
    let initiator = required(doc, "initiator_session_id")?;
    let counterpart = required(doc, "counterpart_session_id")?;

    let (is_initiator, other, other_name_field) = if initiator == ctx.session_id {
        (true, counterpart, "counterpart_name")
    } else if counterpart == ctx.session_id {
        (false, initiator, "initiator_name")
    } else {
        return Err(NormalizeError::NotAParticipant {
            doc_id: doc.id.clone(),
            session_id: ctx.session_id.clone(),
        });
    };

    Ok(NormalizedEvent::Match {
        id: doc.id.clone(),
        created_at,
        is_initiator,
        counterpart_session_id: other.to_string(),
        counterpart_display_name: display_name(doc, other_name_field),
    })
}

fn normalize_message(
    doc: &RawDocument,
    ctx: &SessionContext,
    created_at: DateTime<Utc>,
) -> Result<NormalizedEvent, NormalizeError> {
    let sender = required(doc, "sender_session_id")?;
    if sender == ctx.session_id {
        return Err(NormalizeError::SelfAuthored {
            doc_id: doc.id.clone(),
        });
    }
    let content = doc
        .str_field("content")
        .or_else(|| doc.str_field("text"))
        .unwrap_or_default();

    Ok(NormalizedEvent::Message {
        id: doc.id.clone(),
        created_at,
        sender_session_id: sender.to_string(),
        sender_display_name: display_name(doc, "sender_name"),
        content_preview: preview(content),
    })
}

fn required<'a>(doc: &'a RawDocument, field: &'static str) -> Result<&'a str, NormalizeError> {
    match doc.str_field(field) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(NormalizeError::MissingField {
            collection: doc.collection,
            doc_id: doc.id.clone(),
            field,
        }),
    }
}

fn display_name(doc: &RawDocument, field: &str) -> String {
    match doc.str_field(field).map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => UNKNOWN_NAME.to_string(),
    }
}

/// Collapse whitespace and cap the length of message text.
pub fn preview(content: &str) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= PREVIEW_MAX_CHARS {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(PREVIEW_MAX_CHARS - 1).collect();
    format!("{cut}\u{2026}")
}

fn created_at(doc: &RawDocument) -> Result<DateTime<Utc>, NormalizeError> {
    let value = doc
        .data
        .get("created_at")
        .ok_or_else(|| NormalizeError::MissingField {
            collection: doc.collection,
            doc_id: doc.id.clone(),
            field: "created_at",
        })?;
    parse_timestamp(value).map_err(|detail| NormalizeError::InvalidTimestamp {
        doc_id: doc.id.clone(),
        detail,
    })
}

/// Accepts epoch milliseconds, RFC 3339 strings, and `{seconds, nanoseconds}`
/// objects (with or without a leading underscore on the field names).
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::Number(n) => {
            let ms = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| format!("not a millisecond count: {n}"))?;
            Utc.timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| format!("out of range: {ms}"))
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("{s:?}: {e}")),
        Value::Object(obj) => {
            let seconds = obj
                .get("seconds")
                .or_else(|| obj.get("_seconds"))
                .and_then(Value::as_i64)
                .ok_or_else(|| "object timestamp without seconds".to_string())?;
            let nanos = obj
                .get("nanoseconds")
                .or_else(|| obj.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let nanos = u32::try_from(nanos).map_err(|_| format!("nanoseconds {nanos}"))?;
            Utc.timestamp_opt(seconds, nanos)
                .single()
                .ok_or_else(|| format!("out of range: {seconds}s {nanos}ns"))
        }
        other => Err(format!("unsupported type: {other}")),
    }
}

/// Whether a record created at `created_at` is recent enough to notify about.
/// Records from the near future (clock skew) count as fresh.
pub fn is_fresh(created_at: DateTime<Utc>, now: DateTime<Utc>, grace: Duration) -> bool {
    now.signed_duration_since(created_at) <= grace
}
