//! Channel: one topic subscription multiplexed over a [`Socket`].
//!
//! # Lifecycle
//!
//! ```text
//!            join()                 ok reply
//! Closed ──────────────► Joining ──────────────► Joined
//!   ▲                      │  ▲                    │
//!   │        error/timeout │  │ rejoin timer       │ phx_error
//!   │                      ▼  │  (bounded)         ▼
//!   │                    Errored ◄─────────────────┘
//!   │
//!   └──── leave() / phx_close / socket teardown ◄── Leaving
//! ```
//!
//! Each join attempt gets a fresh join ref. Inbound frames carrying a
//! different join ref belong to an earlier session and are dropped.
//!
//! # Usage
//!
//! ```ignore
//! let channel = socket.channel("room:lobby", json!({"token": "abc"}));
//! channel.on("new_msg", |payload| println!("{payload}"));
//! let reply = channel.join(Duration::from_secs(10)).await;
//! assert!(reply.is_ok());
//! let reply = channel.push_await("ping", json!({}), Duration::from_secs(5)).await;
//! ```
//!
//! [`Socket`]: crate::socket::Socket
//!
//! Rust guideline compliant 2025-01

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::message::{Event, Message, Reply, REASON_CLOSED, REASON_NOT_CONNECTED, REASON_NOT_JOINED};
use crate::observers::{lock, EventCallbacks, ObserverId, Observers};
use crate::socket::{ReplyOutcome, SocketInner};

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    /// Not joined. Initial and terminal state.
    #[default]
    Closed,
    /// Join sent (or deferred until the socket connects).
    Joining,
    /// Server accepted the join.
    Joined,
    /// Leave sent, waiting for the reply.
    Leaving,
    /// Join rejected or timed out, or the server-side channel crashed.
    Errored,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Joining => "joining",
            Self::Joined => "joined",
            Self::Leaving => "leaving",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Per-join bookkeeping.
#[derive(Debug, Default)]
struct Session {
    /// Ref of the current join attempt; `None` while closed.
    join_ref: Option<String>,
    /// Response of the last accepted join.
    join_response: Value,
    /// Reply that put the channel into `Errored`, handed to `join` callers.
    failure: Option<Reply>,
}

#[derive(Debug)]
struct Rejoin {
    backoff: Backoff,
    timer: Option<CancellationToken>,
}

struct ChannelInner {
    topic: String,
    params: Value,
    socket: Weak<SocketInner>,
    join_timeout: Duration,
    shutdown: CancellationToken,
    state_tx: watch::Sender<ChannelState>,
    session: Mutex<Session>,
    rejoin: Mutex<Rejoin>,
    bindings: EventCallbacks<Value>,
    error_observers: Observers<Error>,
    close_observers: Observers<()>,
}

impl std::fmt::Debug for ChannelInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.topic)
            .field("state", &*self.state_tx.borrow())
            .field("join_ref", &lock(&self.session).join_ref)
            .finish_non_exhaustive()
    }
}

impl ChannelInner {
    fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ChannelState) -> ChannelState {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            log::debug!("[Channel {}] State {} -> {}", self.topic, previous, state);
        }
        previous
    }

    fn join_ref(&self) -> Option<String> {
        lock(&self.session).join_ref.clone()
    }

    fn cancel_rejoin(&self) {
        if let Some(timer) = lock(&self.rejoin).timer.take() {
            timer.cancel();
        }
    }

    /// Start a join attempt with a fresh join ref and return that ref.
    ///
    /// If the socket has no live transport the join is not sent. The attempt
    /// still times out after `timeout`, and the socket re-issues the join once
    /// it connects.
    fn send_join(self: &Arc<Self>, timeout: Duration) -> Option<String> {
        let Some(socket) = self.socket.upgrade() else {
            log::warn!("[Channel {}] Socket dropped, cannot join", self.topic);
            return None;
        };

        let join_ref = socket.make_ref();
        {
            let mut session = lock(&self.session);
            session.join_ref = Some(join_ref.clone());
            session.failure = None;
        }
        self.set_state(ChannelState::Joining);

        let reply_rx = socket.register_reply(&join_ref);
        let message = Message::new(self.topic.as_str(), Event::Join, self.params.clone())
            .with_join_ref(Some(join_ref.clone()))
            .with_ref(join_ref.as_str());
        if let Err(e) = socket.push(message) {
            socket.forget_reply(&join_ref);
            drop(socket);
            log::debug!("[Channel {}] Join deferred: {}", self.topic, e);
            let channel = Arc::clone(self);
            let attempt = join_ref.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = channel.shutdown.cancelled() => {}
                    () = tokio::time::sleep(timeout) => {
                        channel.finish_join(&attempt, ReplyOutcome::TimedOut);
                    }
                }
            });
            return Some(join_ref);
        }
        log::info!("[Channel {}] Joining (join_ref {})", self.topic, join_ref);

        let channel = Arc::clone(self);
        let attempt = join_ref.clone();
        tokio::spawn(async move {
            let outcome = socket.await_reply(&attempt, reply_rx, timeout).await;
            drop(socket);
            channel.finish_join(&attempt, outcome);
        });
        Some(join_ref)
    }

    /// Apply the outcome of the join attempt `join_ref`. Outcomes of
    /// superseded attempts are ignored.
    fn finish_join(self: &Arc<Self>, join_ref: &str, outcome: ReplyOutcome) {
        if self.join_ref().as_deref() != Some(join_ref) || self.state() != ChannelState::Joining {
            log::debug!("[Channel {}] Ignoring stale join result for {}", self.topic, join_ref);
            return;
        }

        match outcome {
            ReplyOutcome::Received(reply) if reply.is_ok() => {
                lock(&self.session).join_response = reply.response;
                lock(&self.rejoin).backoff.reset();
                self.set_state(ChannelState::Joined);
                log::info!("[Channel {}] Joined", self.topic);
            }
            ReplyOutcome::Received(reply) => {
                log::warn!("[Channel {}] Join rejected: {}", self.topic, reply.response);
                let error = Error::Join(reply.response.clone());
                lock(&self.session).failure = Some(reply);
                self.set_state(ChannelState::Errored);
                self.error_observers.notify(&error);
                self.schedule_rejoin();
            }
            ReplyOutcome::TimedOut => {
                log::warn!("[Channel {}] Join timed out", self.topic);
                lock(&self.session).failure = Some(Reply::timeout());
                self.set_state(ChannelState::Errored);
                self.error_observers.notify(&Error::JoinTimeout);
                self.schedule_rejoin();
            }
            // Socket teardown; `mark_closed` handles the state.
            ReplyOutcome::Dropped => {}
        }
    }

    /// Arm the rejoin timer, or give up once the attempt budget is spent.
    fn schedule_rejoin(self: &Arc<Self>) {
        let mut rejoin = lock(&self.rejoin);
        if let Some(timer) = rejoin.timer.take() {
            timer.cancel();
        }

        let Some(delay) = rejoin.backoff.next_delay() else {
            let attempts = rejoin.backoff.attempts();
            drop(rejoin);
            log::warn!(
                "[Channel {}] Giving up after {} rejoin attempts",
                self.topic,
                attempts
            );
            self.error_observers
                .notify(&Error::RejoinAttemptsExhausted { attempts });
            return;
        };
        let attempt = rejoin.backoff.attempts();
        let timer = self.shutdown.child_token();
        rejoin.timer = Some(timer.clone());
        drop(rejoin);

        log::info!(
            "[Channel {}] Rejoin attempt {} in {:?}",
            self.topic,
            attempt,
            delay
        );
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = timer.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if channel.state() == ChannelState::Errored {
                        channel.send_join(channel.join_timeout);
                    }
                }
            }
        });
    }

    /// Transition to `Closed`, firing close observers once.
    fn mark_closed(&self) {
        self.cancel_rejoin();
        lock(&self.session).join_ref = None;
        if self.set_state(ChannelState::Closed) != ChannelState::Closed {
            log::info!("[Channel {}] Closed", self.topic);
            self.close_observers.notify(&());
        }
    }

    /// Wait for the in-flight join attempt to settle.
    async fn await_join(&self, timeout: Duration) -> Reply {
        let mut state_rx = self.state_tx.subscribe();
        let state = match tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| *state != ChannelState::Joining),
        )
        .await
        {
            Ok(Ok(state)) => *state,
            Ok(Err(_closed)) => return Reply::reason(REASON_CLOSED),
            Err(_elapsed) => return Reply::timeout(),
        };
        match state {
            ChannelState::Joined => Reply::ok(lock(&self.session).join_response.clone()),
            ChannelState::Errored => lock(&self.session)
                .failure
                .clone()
                .unwrap_or_else(|| Reply::reason("join failed")),
            ChannelState::Closed | ChannelState::Leaving | ChannelState::Joining => {
                Reply::reason(REASON_CLOSED)
            }
        }
    }

    fn dispatch(self: &Arc<Self>, message: &Message) {
        if let Some(incoming) = message.join_ref.as_deref() {
            if self.join_ref().as_deref() != Some(incoming) {
                log::debug!(
                    "[Channel {}] Dropping {} from stale join_ref {}",
                    self.topic,
                    message.event,
                    incoming
                );
                return;
            }
        }

        match message.event {
            Event::Close => self.mark_closed(),
            Event::Error => {
                if matches!(self.state(), ChannelState::Joined | ChannelState::Joining) {
                    log::warn!("[Channel {}] Server-side channel crashed", self.topic);
                    self.set_state(ChannelState::Errored);
                    self.error_observers
                        .notify(&Error::Crashed(message.payload.clone()));
                    self.schedule_rejoin();
                }
            }
            _ => {}
        }

        self.bindings.emit(message.event.as_str(), &message.payload);
    }
}

/// Handle to a channel. Cheap to clone; all clones share state.
#[derive(Clone, Debug)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(topic: &str, params: Value, socket: &Arc<SocketInner>) -> Self {
        let config = socket.config();
        let (state_tx, _) = watch::channel(ChannelState::Closed);
        Self {
            inner: Arc::new(ChannelInner {
                topic: topic.to_string(),
                params,
                socket: Arc::downgrade(socket),
                join_timeout: config.join_timeout,
                shutdown: socket.shutdown_token().child_token(),
                state_tx,
                session: Mutex::new(Session::default()),
                rejoin: Mutex::new(Rejoin {
                    backoff: Backoff::bounded(
                        config.rejoin_base,
                        config.rejoin_max,
                        config.max_rejoin_attempts,
                    ),
                    timer: None,
                }),
                bindings: EventCallbacks::new(),
                error_observers: Observers::new("channel_error"),
                close_observers: Observers::new("channel_close"),
            }),
        }
    }

    /// Join the topic, waiting up to `timeout` for the server's reply.
    ///
    /// Already joined: returns the stored join response immediately. A join
    /// already in flight is awaited rather than duplicated. Joining from
    /// `Errored` (including after the rejoin budget ran out) starts over with
    /// a fresh attempt budget.
    ///
    /// A rejected join returns the server's error reply and a missed deadline
    /// returns `{"reason": "timeout"}`; both leave the channel `Errored` with
    /// a rejoin scheduled. This holds while the socket is disconnected too.
    pub async fn join(&self, timeout: Duration) -> Reply {
        let inner = &self.inner;
        let started = match inner.state() {
            ChannelState::Joined => {
                return Reply::ok(lock(&inner.session).join_response.clone());
            }
            ChannelState::Joining => None,
            ChannelState::Closed | ChannelState::Errored | ChannelState::Leaving => {
                inner.cancel_rejoin();
                lock(&inner.rejoin).backoff.reset();
                inner.send_join(timeout)
            }
        };
        let reply = inner.await_join(timeout).await;

        // Our own attempt ran out of time: settle it now instead of racing
        // the background waiter.
        if let Some(join_ref) = started {
            if inner.state() == ChannelState::Joining {
                inner.finish_join(&join_ref, ReplyOutcome::TimedOut);
            }
        }
        reply
    }

    /// Leave the topic.
    ///
    /// The channel ends `Closed` and is removed from its socket whether the
    /// server acknowledged, refused or the deadline passed. Leaving a closed
    /// channel is a no-op.
    pub async fn leave(&self, timeout: Duration) -> Reply {
        let inner = &self.inner;
        if inner.state() == ChannelState::Closed {
            return Reply::ok(json!({}));
        }
        inner.cancel_rejoin();
        inner.set_state(ChannelState::Leaving);

        let socket = inner.socket.upgrade();
        let reply = match &socket {
            Some(socket) => {
                let leave_ref = socket.make_ref();
                let reply_rx = socket.register_reply(&leave_ref);
                let message = Message::new(inner.topic.as_str(), Event::Leave, json!({}))
                    .with_join_ref(inner.join_ref())
                    .with_ref(leave_ref.as_str());
                match socket.push(message) {
                    Ok(()) => socket
                        .await_reply(&leave_ref, reply_rx, timeout)
                        .await
                        .into_reply(),
                    Err(_not_connected) => {
                        socket.forget_reply(&leave_ref);
                        Reply::reason(REASON_NOT_CONNECTED)
                    }
                }
            }
            None => Reply::reason(REASON_NOT_CONNECTED),
        };

        log::info!("[Channel {}] Left ({})", inner.topic, reply.status.as_str());
        inner.mark_closed();
        if let Some(socket) = socket {
            socket.remove_channel(self);
        }
        reply
    }

    /// Fire-and-forget push.
    ///
    /// # Errors
    ///
    /// [`Error::NotJoined`] unless the channel is joined, or
    /// [`Error::NotConnected`] without a live transport. Nothing is queued
    /// for later delivery.
    pub fn push(&self, event: impl Into<Event>, payload: Value) -> Result<()> {
        let event = event.into();
        let inner = &self.inner;
        if inner.state() != ChannelState::Joined {
            log::debug!("[Channel {}] Dropping push '{}': not joined", inner.topic, event);
            return Err(Error::NotJoined);
        }
        let socket = inner.socket.upgrade().ok_or(Error::NotConnected)?;
        let message = Message::new(inner.topic.as_str(), event, payload)
            .with_join_ref(inner.join_ref())
            .with_ref(socket.make_ref());
        socket.push(message)
    }

    /// Push and wait for the correlated reply.
    ///
    /// Local failures are error replies: `not joined`, `not connected`,
    /// `timeout` (the pending entry is discarded), or `closed` when the socket
    /// is torn down mid-wait.
    pub async fn push_await(
        &self,
        event: impl Into<Event>,
        payload: Value,
        timeout: Duration,
    ) -> Reply {
        let event = event.into();
        let inner = &self.inner;
        if inner.state() != ChannelState::Joined {
            return Reply::reason(REASON_NOT_JOINED);
        }
        let Some(socket) = inner.socket.upgrade() else {
            return Reply::reason(REASON_NOT_CONNECTED);
        };

        let push_ref = socket.make_ref();
        let reply_rx = socket.register_reply(&push_ref);
        let message = Message::new(inner.topic.as_str(), event.clone(), payload)
            .with_join_ref(inner.join_ref())
            .with_ref(push_ref.as_str());
        if socket.push(message).is_err() {
            socket.forget_reply(&push_ref);
            return Reply::reason(REASON_NOT_CONNECTED);
        }

        let outcome = socket.await_reply(&push_ref, reply_rx, timeout).await;
        if let ReplyOutcome::TimedOut = outcome {
            log::warn!(
                "[Channel {}] {}: '{}' after {:?}",
                inner.topic,
                Error::PushTimeout,
                event,
                timeout
            );
        }
        outcome.into_reply()
    }

    /// Register a callback for an inbound event. Protocol events
    /// (`phx_close`, `phx_error`, uncorrelated `phx_reply`) are delivered
    /// too, after the channel has handled them.
    pub fn on(&self, event: &str, callback: impl Fn(&Value) + Send + Sync + 'static) -> ObserverId {
        self.inner.bindings.register(event, callback)
    }

    /// Remove an event callback. Returns `false` if it was not registered.
    pub fn off(&self, event: &str, id: ObserverId) -> bool {
        self.inner.bindings.unregister(event, id)
    }

    /// Register an error observer: rejected or timed-out joins, server
    /// crashes, an exhausted rejoin budget.
    pub fn on_error(&self, callback: impl Fn(&Error) + Send + Sync + 'static) -> ObserverId {
        self.inner.error_observers.register(callback)
    }

    /// Register a close observer.
    pub fn on_close(&self, callback: impl Fn(&()) + Send + Sync + 'static) -> ObserverId {
        self.inner.close_observers.register(callback)
    }

    /// Remove an error or close observer.
    pub fn off_observer(&self, id: ObserverId) -> bool {
        self.inner.error_observers.unregister(id) || self.inner.close_observers.unregister(id)
    }

    /// Topic name.
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Join parameters.
    pub fn params(&self) -> &Value {
        &self.inner.params
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// Watch the lifecycle state.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    /// Ref of the current join attempt.
    pub fn join_ref(&self) -> Option<String> {
        self.inner.join_ref()
    }

    /// Returns `true` if both handles refer to the same channel.
    pub fn same_channel(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn dispatch(&self, message: &Message) {
        self.inner.dispatch(message);
    }

    /// Re-issue the join on a fresh transport with a fresh rejoin budget.
    pub(crate) fn rejoin_after_connect(&self) {
        self.inner.cancel_rejoin();
        lock(&self.inner.rejoin).backoff.reset();
        self.inner.send_join(self.inner.join_timeout);
    }

    pub(crate) fn cancel_rejoin(&self) {
        self.inner.cancel_rejoin();
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.mark_closed();
    }
}
