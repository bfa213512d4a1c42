//! Socket: one multiplexed WebSocket connection shared by many channels.
//!
//! The socket owns the transport, the message-ref counter, the pending-reply
//! table and the channel registry. A background supervisor task
//! (see [`connection`]) keeps the transport alive: it connects, heartbeats,
//! routes inbound frames and reconnects with exponential backoff.
//!
//! # Architecture
//!
//! ```text
//! Socket (Clone, Arc<SocketInner>)
//!     │
//!     ├── supervisor task ── connect ── session ──┬── send loop      (outbound FIFO -> ws)
//!     │        ▲                                  ├── receive loop   (ws -> replies / channels)
//!     │        └──── backoff ◄── session lost ────┴── heartbeat loop
//!     │
//!     ├── channels: topic -> Channel
//!     └── pending:  ref   -> oneshot::Sender<Reply>
//! ```
//!
//! State changes are published on a `watch` (current value) and, together
//! with errors and inbound messages, on a `broadcast` stream of
//! [`SocketEvent`]s.
//!
//! Rust guideline compliant 2025-01

mod connection;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::channel::{Channel, ChannelState};
use crate::config::SocketConfig;
use crate::constants::EVENT_BUFFER;
use crate::error::{Error, Result};
use crate::message::{Event, Message, Reply, REASON_CLOSED};
use crate::observers::lock;

use connection::{Outbound, Supervisor};

/// Connection lifecycle of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    #[default]
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport open; heartbeats running.
    Connected,
    /// Transport lost; waiting out the backoff before the next attempt.
    Reconnecting,
    /// `disconnect` in progress.
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Notification published on [`Socket::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A connect attempt failed, the transport was lost or a frame was
    /// malformed.
    Error(Error),
    /// A frame arrived (after reply resolution and channel routing).
    Message(Message),
}

/// Outcome of waiting on a registered reply.
#[derive(Debug)]
pub(crate) enum ReplyOutcome {
    /// The server answered.
    Received(Reply),
    /// The deadline passed; the entry has been removed.
    TimedOut,
    /// The entry was dropped by a disconnect.
    Dropped,
}

impl ReplyOutcome {
    /// Collapse into a reply, synthesizing `timeout`/`closed` errors.
    pub(crate) fn into_reply(self) -> Reply {
        match self {
            Self::Received(reply) => reply,
            Self::TimedOut => Reply::timeout(),
            Self::Dropped => Reply::reason(REASON_CLOSED),
        }
    }
}

/// Shared socket state. Channels hold a `Weak` to this.
pub(crate) struct SocketInner {
    config: SocketConfig,
    endpoint: String,
    ref_counter: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<SocketEvent>,
    channels: Mutex<HashMap<String, Channel>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    pending_heartbeat: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    supervisor: Mutex<Option<Supervisor>>,
    /// Cancelled when the last [`Socket`] handle is dropped. Parent of every
    /// supervisor and rejoin-timer token.
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SocketInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketInner")
            .field("endpoint", &self.endpoint)
            .field("state", &*self.state_tx.borrow())
            .field("channels", &lock(&self.channels).len())
            .field("pending", &lock(&self.pending).len())
            .finish_non_exhaustive()
    }
}

impl SocketInner {
    pub(crate) fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Next message ref: `"1"`, `"2"`, ...
    pub(crate) fn make_ref(&self) -> String {
        (self.ref_counter.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Update the state, publishing a change event if it differs.
    fn set_state(&self, state: ConnectionState) {
        self.transition(state, None);
    }

    /// Like [`SocketInner::set_state`], but a no-op once `cancel` fired.
    /// Returns `false` if the transition was refused.
    ///
    /// The check runs under the state lock, so nothing the supervisor
    /// publishes can land after `disconnect` cancelled it and moved to
    /// `Closing`.
    fn set_state_unless_cancelled(&self, state: ConnectionState, cancel: &CancellationToken) -> bool {
        self.transition(state, Some(cancel))
    }

    fn transition(&self, state: ConnectionState, cancel: Option<&CancellationToken>) -> bool {
        let mut applied = true;
        self.state_tx.send_if_modified(|current| {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                applied = false;
                return false;
            }
            if *current == state {
                return false;
            }
            log::debug!("[Socket] State {} -> {}", current, state);
            *current = state;
            // Emitted under the state lock so the event stream keeps watch order.
            self.emit(SocketEvent::StateChanged(state));
            true
        });
        applied
    }

    fn emit(&self, event: SocketEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    /// Queue an envelope on the live transport.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] if there is no live transport.
    pub(crate) fn push(&self, message: Message) -> Result<()> {
        let outbound = lock(&self.outbound);
        let Some(tx) = outbound.as_ref() else {
            return Err(Error::NotConnected);
        };
        log::trace!(
            "[Socket] -> {} {} ref={:?}",
            message.topic,
            message.event,
            message.msg_ref
        );
        tx.send(Outbound::Text(message.encode()))
            .map_err(|_closed| Error::NotConnected)
    }

    fn send_outbound(&self, frame: Outbound) -> bool {
        lock(&self.outbound)
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Register a pending reply for `msg_ref`. Must happen before the
    /// request is pushed so a fast reply cannot race the registration.
    pub(crate) fn register_reply(&self, msg_ref: &str) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(msg_ref.to_string(), tx);
        rx
    }

    /// Drop a pending entry whose request never made it onto the wire.
    pub(crate) fn forget_reply(&self, msg_ref: &str) {
        lock(&self.pending).remove(msg_ref);
    }

    /// Wait for the reply registered under `msg_ref`.
    ///
    /// On timeout the entry is removed, so a late reply is ignored.
    pub(crate) async fn await_reply(
        &self,
        msg_ref: &str,
        rx: oneshot::Receiver<Reply>,
        timeout: Duration,
    ) -> ReplyOutcome {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => ReplyOutcome::Received(reply),
            Ok(Err(_dropped)) => ReplyOutcome::Dropped,
            Err(_elapsed) => {
                self.forget_reply(msg_ref);
                log::debug!("[Socket] Reply {} timed out after {:?}", msg_ref, timeout);
                ReplyOutcome::TimedOut
            }
        }
    }

    /// Resolve a pending reply. Returns `false` if nothing was waiting.
    fn resolve_reply(&self, msg_ref: &str, reply: Reply) -> bool {
        let Some(tx) = lock(&self.pending).remove(msg_ref) else {
            return false;
        };
        // Receiver may have given up in the same instant.
        let _ = tx.send(reply);
        true
    }

    /// Remove `channel` from the registry if it is still the registered
    /// instance for its topic.
    pub(crate) fn remove_channel(&self, channel: &Channel) {
        let mut channels = lock(&self.channels);
        if channels
            .get(channel.topic())
            .is_some_and(|existing| existing.same_channel(channel))
        {
            channels.remove(channel.topic());
            log::debug!("[Socket] Removed channel {}", channel.topic());
        }
    }

    fn channel_for(&self, topic: &str) -> Option<Channel> {
        lock(&self.channels).get(topic).cloned()
    }

    fn channels_snapshot(&self) -> Vec<Channel> {
        lock(&self.channels).values().cloned().collect()
    }

    /// Re-issue joins for every channel that was joining, joined or errored
    /// when the previous transport went away.
    fn rejoin_channels(&self) {
        for channel in self.channels_snapshot() {
            if matches!(
                channel.state(),
                ChannelState::Joining | ChannelState::Joined | ChannelState::Errored
            ) {
                log::info!("[Socket] Rejoining {}", channel.topic());
                channel.rejoin_after_connect();
            }
        }
    }

    /// Route one inbound text frame.
    ///
    /// Order: heartbeat reply, pending reply, channel by topic. Every frame
    /// except heartbeat acknowledgements is then published as
    /// [`SocketEvent::Message`].
    fn handle_frame(&self, text: &str) {
        let message = match Message::decode(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!(
                    "[Socket] Dropping malformed frame: {} ({})",
                    e,
                    crate::message::preview(text, 100)
                );
                self.emit(SocketEvent::Error(e));
                return;
            }
        };
        log::trace!(
            "[Socket] <- {} {} ref={:?} join_ref={:?}",
            message.topic,
            message.event,
            message.msg_ref,
            message.join_ref
        );

        if let Some(msg_ref) = message.msg_ref.as_deref() {
            if message.event == Event::Reply {
                let mut heartbeat = lock(&self.pending_heartbeat);
                if heartbeat.as_deref() == Some(msg_ref) {
                    *heartbeat = None;
                    return;
                }
            }
            if let Some(reply) = message.reply() {
                if self.resolve_reply(msg_ref, reply) {
                    self.emit(SocketEvent::Message(message));
                    return;
                }
            }
        }

        match self.channel_for(&message.topic) {
            Some(channel) => channel.dispatch(&message),
            None => log::debug!(
                "[Socket] No channel for topic {} (event {})",
                message.topic,
                message.event
            ),
        }
        self.emit(SocketEvent::Message(message));
    }

    /// Fail every waiting request. Dropping the senders wakes the receivers
    /// with [`ReplyOutcome::Dropped`].
    fn fail_pending(&self) {
        let dropped: Vec<_> = lock(&self.pending).drain().collect();
        if !dropped.is_empty() {
            log::debug!("[Socket] Failing {} pending replies", dropped.len());
        }
    }
}

/// Handle to a socket. Cheap to clone; the connection shuts down when the
/// last handle is dropped.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
    _shutdown: Arc<DropGuard>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.inner, f)
    }
}

impl Socket {
    /// Create a socket. Nothing connects until [`Socket::connect`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidUrl`] or [`Error::InvalidConfig`] if `config` does
    /// not validate.
    pub fn new(config: SocketConfig) -> Result<Self> {
        config.validate()?;
        let endpoint = crate::ws::endpoint_url(&config.url, &config.vsn, &config.params)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let shutdown = CancellationToken::new();

        let inner = Arc::new(SocketInner {
            config,
            endpoint,
            ref_counter: AtomicU64::new(0),
            state_tx,
            events_tx,
            channels: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            pending_heartbeat: Mutex::new(None),
            outbound: Mutex::new(None),
            supervisor: Mutex::new(None),
            shutdown: shutdown.clone(),
        });

        Ok(Self {
            inner,
            _shutdown: Arc::new(shutdown.drop_guard()),
        })
    }

    /// Start the connection supervisor. No-op if it is already running.
    ///
    /// Returns immediately; watch [`Socket::state`] or
    /// [`Socket::wait_for_state`] to observe progress.
    pub fn connect(&self) {
        let mut supervisor = lock(&self.inner.supervisor);
        if supervisor.as_ref().is_some_and(|s| !s.is_finished()) {
            log::debug!("[Socket] connect() ignored, supervisor already running");
            return;
        }
        *supervisor = Some(Supervisor::spawn(&self.inner));
    }

    /// Close the connection and tear down every channel.
    ///
    /// Cancels any pending reconnect, stops heartbeats, attempts a graceful
    /// close bounded by the configured close timeout, fails every pending
    /// reply, and closes and forgets all channels. Ends in
    /// [`ConnectionState::Disconnected`].
    pub async fn disconnect(&self) {
        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(supervisor) = &supervisor {
            supervisor.cancel();
        }
        self.inner.set_state(ConnectionState::Closing);

        let channels: Vec<Channel> = lock(&self.inner.channels)
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in &channels {
            channel.cancel_rejoin();
        }

        if let Some(supervisor) = supervisor {
            supervisor.shutdown(self.inner.config.close_timeout).await;
        }
        *lock(&self.inner.outbound) = None;
        *lock(&self.inner.pending_heartbeat) = None;
        self.inner.fail_pending();

        for channel in &channels {
            channel.mark_closed();
        }
        self.inner.set_state(ConnectionState::Disconnected);
        log::info!("[Socket] Disconnected from {}", self.inner.endpoint);
    }

    /// Get or create the channel for `topic`.
    ///
    /// A second call for the same topic returns the existing channel and
    /// ignores `params`.
    pub fn channel(&self, topic: &str, params: Value) -> Channel {
        lock(&self.inner.channels)
            .entry(topic.to_string())
            .or_insert_with(|| Channel::new(topic, params, &self.inner))
            .clone()
    }

    /// Topics of every registered channel.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.inner.channels).keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Next unique message ref.
    pub fn make_ref(&self) -> String {
        self.inner.make_ref()
    }

    /// Send a raw envelope.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] if there is no live transport. Nothing is
    /// buffered across reconnects.
    pub fn push(&self, message: Message) -> Result<()> {
        self.inner.push(message)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Returns `true` while the transport is open.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Subscribe to state changes, errors and inbound messages.
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Watch the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the socket reaches `state`. Returns `false` on timeout.
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.inner.state_tx.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|current| *current == state)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Resolved WebSocket endpoint (scheme upgraded, `vsn` and params in the
    /// query).
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Configuration this socket was built with.
    pub fn config(&self) -> &SocketConfig {
        &self.inner.config
    }
}
