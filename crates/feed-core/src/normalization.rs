use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{
    error::FeedError,
    types::{FeedEvent, Message, RemoteEvent, RowChange, SendAck},
};

/// Internal helper describing a send result before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Send was persisted under a backend message ID.
    Success { message_id: String },
    /// Send failed; the composer input can be restored.
    Failure {
        error: FeedError,
        restored_input: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct MessageRow {
    id: String,
    conversation_id: String,
    sender_id: String,
    #[serde(default)]
    body: Option<String>,
    created_at: String,
    #[serde(default)]
    deleted_at: Option<String>,
}

/// Convert a row change into a reconciler event.
///
/// `DELETE` and unknown change types yield `None`: deletion is soft and
/// arrives as an update.
pub fn normalize_row_change(change: &RowChange) -> Result<Option<RemoteEvent>, FeedError> {
    match change.event_type.to_ascii_uppercase().as_str() {
        "INSERT" => Ok(Some(RemoteEvent::insert(message_from_row(&change.record)?))),
        "UPDATE" => Ok(Some(RemoteEvent::update(message_from_row(&change.record)?))),
        other => {
            debug!(event_type = %other, "ignoring row change type");
            Ok(None)
        }
    }
}

/// Decode one message row.
pub fn message_from_row(record: &serde_json::Value) -> Result<Message, FeedError> {
    let row = MessageRow::deserialize(record)
        .map_err(|err| FeedError::malformed_row(err.to_string()))?;
    let deleted_at_ms = row
        .deleted_at
        .as_deref()
        .map(parse_timestamp_ms)
        .transpose()?;

    Ok(Message {
        id: row.id,
        conversation_id: row.conversation_id,
        sender_id: row.sender_id,
        body: if deleted_at_ms.is_some() { None } else { row.body },
        created_at_ms: parse_timestamp_ms(&row.created_at)?,
        deleted_at_ms,
    })
}

/// Encode a message using the row shape delivered by the transport.
pub fn message_to_row(message: &Message) -> serde_json::Value {
    json!({
        "id": message.id,
        "conversation_id": message.conversation_id,
        "sender_id": message.sender_id,
        "body": message.body,
        "created_at": format_timestamp_ms(message.created_at_ms),
        "deleted_at": message.deleted_at_ms.map(format_timestamp_ms),
    })
}

/// Parse an RFC 3339 timestamp into milliseconds since Unix epoch.
pub fn parse_timestamp_ms(value: &str) -> Result<u64, FeedError> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .map_err(|err| FeedError::malformed_row(format!("invalid timestamp '{value}': {err}")))?;
    u64::try_from(parsed.timestamp_millis()).map_err(|_| {
        FeedError::malformed_row(format!("timestamp '{value}' predates the Unix epoch"))
    })
}

/// Format milliseconds since Unix epoch as RFC 3339 (UTC, millisecond precision).
pub fn format_timestamp_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// Convert a send outcome to a stable `FeedEvent::SendAck`.
pub fn normalize_send_outcome(
    local_id: impl Into<String>,
    conversation_id: impl Into<String>,
    outcome: SendOutcome,
) -> FeedEvent {
    let local_id = local_id.into();
    let conversation_id = conversation_id.into();
    match outcome {
        SendOutcome::Success { message_id } => FeedEvent::SendAck(SendAck {
            local_id,
            conversation_id,
            message_id: Some(message_id),
            error_code: None,
            restored_input: None,
        }),
        SendOutcome::Failure {
            error,
            restored_input,
        } => FeedEvent::SendAck(SendAck {
            local_id,
            conversation_id,
            message_id: None,
            error_code: Some(error.code),
            restored_input,
        }),
    }
}

/// Convert a fetch error into a `FetchFailed` event.
pub fn normalize_fetch_error(conversation_id: Option<String>, error: FeedError) -> FeedEvent {
    FeedEvent::FetchFailed {
        conversation_id,
        code: error.code,
        message: error.message,
    }
}
