//! Protocol names and default timings for phx-client.
//!
//! This module centralizes the wire vocabulary and every tunable default so
//! they can be found in one place. All timing values here are only defaults:
//! [`SocketConfig`](crate::config::SocketConfig) carries the effective values.
//!
//! # Categories
//!
//! - **Protocol**: reserved event names, topics and the version marker
//! - **Heartbeat & Timeouts**: liveness probe cadence and per-call deadlines
//! - **Backoff**: socket reconnect and channel rejoin schedules

use std::time::Duration;

// ============================================================================
// Protocol
// ============================================================================

/// Protocol version sent as the `vsn` query parameter.
///
/// `2.0.0` selects the array envelope `[join_ref, ref, topic, event, payload]`.
pub const PROTOCOL_VERSION: &str = "2.0.0";

/// Path segment appended to the endpoint URL.
pub const WEBSOCKET_PATH: &str = "websocket";

/// Topic used for socket-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Wire name of the join request event.
pub const EVENT_JOIN: &str = "phx_join";
/// Wire name of the reply event.
pub const EVENT_REPLY: &str = "phx_reply";
/// Wire name of the server-side channel crash event.
pub const EVENT_ERROR: &str = "phx_error";
/// Wire name of the channel close event.
pub const EVENT_CLOSE: &str = "phx_close";
/// Wire name of the leave request event.
pub const EVENT_LEAVE: &str = "phx_leave";
/// Wire name of the heartbeat event.
pub const EVENT_HEARTBEAT: &str = "heartbeat";

/// Default event carrying a full presence snapshot.
pub const PRESENCE_STATE_EVENT: &str = "presence_state";
/// Default event carrying an incremental presence diff.
pub const PRESENCE_DIFF_EVENT: &str = "presence_diff";

// ============================================================================
// Heartbeat & Timeouts
// ============================================================================

/// Interval between heartbeats.
///
/// A heartbeat still unacknowledged when the next tick fires means the
/// connection is dead.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for a channel join reply.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a `push_await` reply.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for establishing the WebSocket (TCP + TLS + upgrade).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded wait for a graceful close on explicit disconnect.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Backoff
// ============================================================================

/// First socket reconnect delay; doubled per consecutive failure.
pub const RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Upper bound for the socket reconnect delay. Reconnection itself is unbounded.
pub const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// First channel rejoin delay; doubled per attempt.
pub const REJOIN_BASE: Duration = Duration::from_secs(1);

/// Upper bound for the channel rejoin delay.
pub const REJOIN_MAX: Duration = Duration::from_secs(30);

/// Rejoin attempts a channel makes before giving up for good.
pub const MAX_REJOIN_ATTEMPTS: u32 = 5;

/// Capacity of the socket event broadcast buffer.
///
/// Slow subscribers lag (and skip) rather than stall the receive loop.
pub const EVENT_BUFFER: usize = 256;
