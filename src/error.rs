//! Error taxonomy for socket, channel and codec operations.
//!
//! Background loops never return these outward; they are broadcast as
//! [`SocketEvent::Error`](crate::socket::SocketEvent) or delivered to channel
//! error observers. Awaiting calls surface them as error-status replies that
//! carry a `reason` string in their response.

use serde_json::Value;

/// Errors that can occur while talking to a channel server.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The transport failed to establish.
    Connect(String),
    /// An established transport was lost (read error, server close,
    /// heartbeat timeout).
    ConnectionLost(String),
    /// The server replied to a join with an error status.
    Join(Value),
    /// No join reply arrived before the deadline.
    JoinTimeout,
    /// The server-side channel crashed (`phx_error`).
    Crashed(Value),
    /// No reply to a `push_await` arrived before the deadline.
    PushTimeout,
    /// The channel is not joined, so the push was not sent.
    NotJoined,
    /// There is no live transport to write to.
    NotConnected,
    /// The channel gave up rejoining. Terminal for that channel only.
    RejoinAttemptsExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
    /// A malformed frame was received and discarded.
    Decode(String),
    /// The endpoint URL could not be used.
    InvalidUrl(String),
    /// A configuration value is out of range.
    InvalidConfig(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "Connection failed: {msg}"),
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {msg}"),
            Self::Join(response) => write!(f, "Join rejected: {response}"),
            Self::JoinTimeout => write!(f, "Join timed out"),
            Self::Crashed(payload) => write!(f, "Channel crashed on server: {payload}"),
            Self::PushTimeout => write!(f, "Push timed out"),
            Self::NotJoined => write!(f, "Channel not joined"),
            Self::NotConnected => write!(f, "Socket not connected"),
            Self::RejoinAttemptsExhausted { attempts } => {
                write!(f, "Rejoin gave up after {attempts} attempts")
            }
            Self::Decode(msg) => write!(f, "Malformed frame: {msg}"),
            Self::InvalidUrl(msg) => write!(f, "Invalid endpoint URL: {msg}"),
            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

/// Result alias for fallible phx-client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(Error::JoinTimeout.to_string(), "Join timed out");
        assert_eq!(
            Error::RejoinAttemptsExhausted { attempts: 5 }.to_string(),
            "Rejoin gave up after 5 attempts"
        );
        assert_eq!(
            Error::Join(serde_json::json!({"reason": "unauthorized"})).to_string(),
            r#"Join rejected: {"reason":"unauthorized"}"#
        );
    }
}
