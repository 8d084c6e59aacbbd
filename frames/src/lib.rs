//! Shared message model and JSON codec for the realtime channel.
//!
//! This crate owns the wire representation used by the `livewire` client and
//! its CLI. Payloads stay flexible (`serde_json::Value`); every frame on the
//! socket is one UTF-8 JSON document of the shape
//! `{ "type", "payload", "timestamp", "userId"? }`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type reserved for keep-alive frames.
pub const HEARTBEAT: &str = "heartbeat";

/// Error returned by [`decode_message`] and [`encode_message`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text was not valid JSON or did not match the message shape.
    #[error("invalid message json: {0}")]
    Json(#[from] serde_json::Error),
    /// The `type` field was present but empty; it is the dispatch key.
    #[error("message type must not be empty")]
    EmptyType,
}

/// A single message on the realtime wire protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Dispatch key, e.g. `"cursor:move"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Arbitrary JSON payload; opaque to the transport.
    #[serde(default)]
    pub payload: Value,
    /// Milliseconds since the Unix epoch when the message was created.
    pub timestamp: i64,
    /// Originating user, when the server stamps one.
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Message {
    /// Create a message stamped with the current time.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self { kind: kind.into(), payload, timestamp: now_ms(), user_id: None }
    }

    /// Create a `heartbeat` message carrying `{timestamp}`.
    #[must_use]
    pub fn heartbeat() -> Self {
        let ts = now_ms();
        Self { kind: HEARTBEAT.to_owned(), payload: serde_json::json!({ "timestamp": ts }), timestamp: ts, user_id: None }
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Same message with a fresh timestamp. Used when a message is re-sent.
    #[must_use]
    pub fn restamped(&self) -> Self {
        Self { timestamp: now_ms(), ..self.clone() }
    }

    /// String field of an object payload.
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Encode a message as a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if serialization fails and
/// [`CodecError::EmptyType`] if the message has no type.
pub fn encode_message(message: &Message) -> Result<String, CodecError> {
    if message.kind.is_empty() {
        return Err(CodecError::EmptyType);
    }
    Ok(serde_json::to_string(message)?)
}

/// Decode a JSON text frame into a message.
///
/// # Errors
///
/// Returns [`CodecError::Json`] for malformed text or a missing `type` /
/// `timestamp`, and [`CodecError::EmptyType`] for an empty `type`.
pub fn decode_message(text: &str) -> Result<Message, CodecError> {
    let message: Message = serde_json::from_str(text)?;
    if message.kind.is_empty() {
        return Err(CodecError::EmptyType);
    }
    Ok(message)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
