//! phx-client - Phoenix Channels client.
//!
//! A realtime pub/sub client speaking the Phoenix Channels V2 wire protocol
//! over a single WebSocket.
//!
//! # Architecture
//!
//! - **Socket** - owns the transport, heartbeats, reconnects with backoff,
//!   correlates replies and routes frames to channels
//! - **Channel** - one topic; join/leave state machine, pushes, event
//!   callbacks, bounded automatic rejoin
//! - **Presence** - derived online state for a channel from full-state and
//!   diff events
//! - **Codec** - the `[join_ref, ref, topic, event, payload]` envelope
//!
//! # Modules
//!
//! - [`socket`] - connection lifecycle and routing
//! - [`channel`] - topic subscriptions
//! - [`presence`] - presence tracking
//! - [`message`] - wire envelope and replies
//! - [`config`] - socket configuration loading
//!
//! # Example
//!
//! ```ignore
//! let config = SocketConfig::builder().url("https://example.com/socket").build()?;
//! let socket = Socket::new(config)?;
//! socket.connect();
//!
//! let channel = socket.channel("room:lobby", json!({}));
//! let presence = Presence::new(&channel);
//! presence.on_sync(|state| println!("{} online", state.len()));
//!
//! let reply = channel.join(Duration::from_secs(10)).await;
//! ```

pub mod backoff;
pub mod channel;
pub mod config;
pub mod constants;
pub mod error;
pub mod message;
pub mod observers;
pub mod presence;
pub mod socket;
pub mod ws;

// Re-export commonly used types
pub use channel::{Channel, ChannelState};
pub use config::SocketConfig;
pub use error::{Error, Result};
pub use message::{Event, Message, Reply, ReplyStatus};
pub use observers::ObserverId;
pub use presence::{Presence, PresenceEntry, PresenceJoin, PresenceLeave, PresenceMeta, PresenceState};
pub use socket::{ConnectionState, Socket, SocketEvent};
