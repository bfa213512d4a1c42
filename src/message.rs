//! Wire envelope codec.
//!
//! Every frame on the socket is a JSON text message holding a 5-element array:
//!
//! ```text
//! [join_ref, ref, topic, event, payload]
//! ```
//!
//! `join_ref` and `ref` are strings or `null`; `topic` and `event` are
//! strings; `payload` is any JSON value. Protocol event names are mapped to
//! [`Event`] variants here, at the decode boundary, and matched exhaustively
//! everywhere else.
//!
//! Decoding never panics: malformed input is reported as [`Error::Decode`] and
//! the receive loop drops the frame. Round trips are value-equivalent, not
//! byte-identical (object key order and number formatting may change).

use serde_json::{json, Value};

use crate::constants::{
    EVENT_CLOSE, EVENT_ERROR, EVENT_HEARTBEAT, EVENT_JOIN, EVENT_LEAVE, EVENT_REPLY,
    PHOENIX_TOPIC,
};
use crate::error::{Error, Result};

/// Event name carried by an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Event {
    /// `phx_join`: request to join a topic.
    Join,
    /// `phx_reply`: reply to a request, correlated by ref.
    Reply,
    /// `phx_error`: the server-side channel crashed.
    Error,
    /// `phx_close`: the server closed the channel.
    Close,
    /// `phx_leave`: request to leave a topic.
    Leave,
    /// `heartbeat`: socket liveness probe.
    Heartbeat,
    /// Any application-defined event.
    Custom(String),
}

impl Event {
    /// Wire name of this event.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Join => EVENT_JOIN,
            Self::Reply => EVENT_REPLY,
            Self::Error => EVENT_ERROR,
            Self::Close => EVENT_CLOSE,
            Self::Leave => EVENT_LEAVE,
            Self::Heartbeat => EVENT_HEARTBEAT,
            Self::Custom(name) => name,
        }
    }

    /// Returns `true` for events reserved by the protocol.
    pub fn is_protocol(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl From<&str> for Event {
    fn from(name: &str) -> Self {
        match name {
            EVENT_JOIN => Self::Join,
            EVENT_REPLY => Self::Reply,
            EVENT_ERROR => Self::Error,
            EVENT_CLOSE => Self::Close,
            EVENT_LEAVE => Self::Leave,
            EVENT_HEARTBEAT => Self::Heartbeat,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for Event {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol envelope. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Ref of the join session this message belongs to.
    pub join_ref: Option<String>,
    /// Request ref used for reply correlation.
    pub msg_ref: Option<String>,
    /// Topic, e.g. `"room:lobby"`.
    pub topic: String,
    /// Event name.
    pub event: Event,
    /// Arbitrary JSON payload.
    pub payload: Value,
}

impl Message {
    /// Create a message with no refs.
    pub fn new(topic: impl Into<String>, event: impl Into<Event>, payload: Value) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Set the join ref.
    #[must_use]
    pub fn with_join_ref(mut self, join_ref: Option<String>) -> Self {
        self.join_ref = join_ref;
        self
    }

    /// Set the request ref.
    #[must_use]
    pub fn with_ref(mut self, msg_ref: impl Into<String>) -> Self {
        self.msg_ref = Some(msg_ref.into());
        self
    }

    /// Heartbeat envelope for the `phoenix` topic.
    pub fn heartbeat(msg_ref: impl Into<String>) -> Self {
        Self::new(PHOENIX_TOPIC, Event::Heartbeat, json!({})).with_ref(msg_ref)
    }

    /// Serialize to the array form.
    pub fn encode(&self) -> String {
        json!([
            self.join_ref,
            self.msg_ref,
            self.topic,
            self.event.as_str(),
            self.payload
        ])
        .to_string()
    }

    /// Parse the array form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the text is not JSON, not a 5-element
    /// array, or has a non-string topic/event or a non-scalar ref.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::Decode(format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Build a message from an already-parsed JSON value.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Message::decode`].
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Array(items) = value else {
            return Err(Error::Decode("envelope is not an array".into()));
        };
        let items: [Value; 5] = items.try_into().map_err(|items: Vec<Value>| {
            Error::Decode(format!("envelope must have 5 elements, got {}", items.len()))
        })?;
        let [join_ref, msg_ref, topic, event, payload] = items;

        let Value::String(topic) = topic else {
            return Err(Error::Decode("topic is not a string".into()));
        };
        let Value::String(event) = event else {
            return Err(Error::Decode("event is not a string".into()));
        };

        Ok(Self {
            join_ref: decode_ref(join_ref, "join_ref")?,
            msg_ref: decode_ref(msg_ref, "ref")?,
            topic,
            event: Event::from(event),
            payload,
        })
    }

    /// Interpret this message as a reply, if it is one.
    pub fn reply(&self) -> Option<Reply> {
        if self.event == Event::Reply {
            Reply::from_payload(&self.payload)
        } else {
            None
        }
    }
}

/// Refs are strings on the wire; numeric refs from lenient servers are
/// stringified.
fn decode_ref(value: Value, field: &str) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(Error::Decode(format!("{field} has unexpected type: {other}"))),
    }
}

/// Longest prefix of `text` that fits in `max` bytes without splitting a char.
pub(crate) fn preview(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let end = text
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= max)
        .last()
        .unwrap_or(0);
    &text[..end]
}

/// Encode an envelope to text.
pub fn encode(message: &Message) -> String {
    message.encode()
}

/// Decode text to an envelope, returning `None` for malformed frames.
pub fn decode(text: &str) -> Option<Message> {
    match Message::decode(text) {
        Ok(message) => Some(message),
        Err(e) => {
            log::warn!(
                "[Codec] Dropping frame: {} ({})",
                e,
                preview(text, 100)
            );
            None
        }
    }
}

/// Status of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// The request succeeded.
    Ok,
    /// The request failed, timed out or could not be sent.
    Error,
}

impl ReplyStatus {
    /// Wire name of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// Reply to a join, leave or `push_await`.
///
/// Local failures (timeout, not joined, not connected) are error replies whose
/// response is `{"reason": ...}`, so callers check the status instead of
/// handling a separate error path.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Outcome of the request.
    pub status: ReplyStatus,
    /// Server-supplied (or locally synthesized) response body.
    pub response: Value,
}

/// Reason attached to locally synthesized timeout replies.
pub const REASON_TIMEOUT: &str = "timeout";
/// Reason attached when a push is attempted on an unjoined channel.
pub const REASON_NOT_JOINED: &str = "not joined";
/// Reason attached when there is no live transport.
pub const REASON_NOT_CONNECTED: &str = "not connected";
/// Reason attached when the socket was torn down while waiting.
pub const REASON_CLOSED: &str = "closed";

impl Reply {
    /// Successful reply.
    pub fn ok(response: Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            response,
        }
    }

    /// Error reply.
    pub fn error(response: Value) -> Self {
        Self {
            status: ReplyStatus::Error,
            response,
        }
    }

    /// Error reply carrying `{"reason": reason}`.
    pub fn reason(reason: &str) -> Self {
        Self::error(json!({ "reason": reason }))
    }

    /// Error reply for a request whose deadline passed.
    pub fn timeout() -> Self {
        Self::reason(REASON_TIMEOUT)
    }

    /// Parse `{"status": "ok"|"error", "response": ...}`.
    ///
    /// A missing response is treated as an empty object.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let status = match payload.get("status")?.as_str()? {
            "ok" => ReplyStatus::Ok,
            "error" => ReplyStatus::Error,
            _ => return None,
        };
        let response = payload.get("response").cloned().unwrap_or_else(|| json!({}));
        Some(Self { status, response })
    }

    /// Returns `true` if the status is `ok`.
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// The `reason` field of an error response, if any.
    pub fn reason_str(&self) -> Option<&str> {
        self.response.get("reason").and_then(Value::as_str)
    }
}
