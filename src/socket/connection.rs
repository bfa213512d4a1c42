//! Connection supervisor.
//!
//! One task per connected socket. Each iteration opens a transport, runs a
//! session until it is lost, then sleeps out the reconnect backoff. A session
//! is three loops raced in a single `select!`:
//!
//! - **send**: drains the outbound FIFO onto the WebSocket;
//! - **receive**: decodes frames and hands them to [`SocketInner::handle_frame`];
//! - **heartbeat**: pushes a `heartbeat` every interval and declares the
//!   connection dead if the previous one was never acknowledged.
//!
//! Whichever loop finishes first ends the session with a [`SessionExit`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{ConnectionState, SocketEvent, SocketInner};
use crate::backoff::Backoff;
use crate::error::Error;
use crate::message::Message;
use crate::observers::lock;
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Frame queued for the send loop.
#[derive(Debug)]
pub(super) enum Outbound {
    /// Encoded envelope.
    Text(String),
    /// Answer to a server ping.
    Pong(Vec<u8>),
}

/// Why a session ended.
#[derive(Debug)]
enum SessionExit {
    /// `disconnect` or the last socket handle went away.
    Shutdown,
    /// The transport died; reconnect.
    Lost(String),
}

/// Handle to the running supervisor task.
#[derive(Debug)]
pub(super) struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Supervisor {
    pub(super) fn spawn(inner: &Arc<SocketInner>) -> Self {
        let cancel = inner.shutdown_token().child_token();
        let handle = tokio::spawn(run_connection_loop(Arc::clone(inner), cancel.clone()));
        Self { cancel, handle }
    }

    pub(super) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop any pending reconnect. The task winds down on its own.
    pub(super) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the task and wait for it to close the transport.
    ///
    /// The session itself bounds the graceful close by `close_timeout`; the
    /// extra second covers a supervisor stuck elsewhere before it is aborted.
    pub(super) async fn shutdown(mut self, close_timeout: Duration) {
        self.cancel.cancel();
        let limit = close_timeout + Duration::from_secs(1);
        if tokio::time::timeout(limit, &mut self.handle).await.is_err() {
            log::warn!("[Socket] Supervisor did not stop within {:?}, aborting", limit);
            self.handle.abort();
        }
    }
}

async fn run_connection_loop(inner: Arc<SocketInner>, cancel: CancellationToken) {
    let config = inner.config();
    let mut backoff = Backoff::unbounded(config.reconnect_base, config.reconnect_max);

    loop {
        if !inner.set_state_unless_cancelled(ConnectionState::Connecting, &cancel) {
            log::info!("[Socket] Shutdown requested, exiting connection loop");
            return;
        }
        log::info!("[Socket] Connecting to {}", inner.endpoint);

        let attempt = tokio::select! {
            () = cancel.cancelled() => return,
            result = ws::connect(&inner.endpoint, config.connect_timeout) => result,
        };

        match attempt {
            Ok((writer, reader)) => {
                backoff.reset();
                match run_session(&inner, writer, reader, &cancel).await {
                    SessionExit::Shutdown => return,
                    SessionExit::Lost(reason) => {
                        log::warn!("[Socket] Connection lost: {}", reason);
                        inner.emit(SocketEvent::Error(Error::ConnectionLost(reason)));
                        inner.set_state_unless_cancelled(ConnectionState::Reconnecting, &cancel);
                    }
                }
            }
            Err(e) => {
                log::warn!("[Socket] Connection failed: {:#}", e);
                inner.emit(SocketEvent::Error(Error::Connect(format!("{e:#}"))));
                inner.set_state_unless_cancelled(ConnectionState::Disconnected, &cancel);
            }
        }

        let delay = backoff.next_delay().unwrap_or(config.reconnect_max);
        log::info!(
            "[Socket] Reconnecting in {:?} (attempt {})",
            delay,
            backoff.attempts()
        );
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Drive one live transport until it is lost or shutdown is requested.
async fn run_session(
    inner: &Arc<SocketInner>,
    mut writer: WsWriter,
    mut reader: WsReader,
    cancel: &CancellationToken,
) -> SessionExit {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    *lock(&inner.outbound) = Some(outbound_tx);
    *lock(&inner.pending_heartbeat) = None;
    inner.set_state_unless_cancelled(ConnectionState::Connected, cancel);
    log::info!("[Socket] Connected to {}", inner.endpoint);

    inner.rejoin_channels();

    let exit = tokio::select! {
        () = cancel.cancelled() => SessionExit::Shutdown,
        exit = send_loop(&mut writer, &mut outbound_rx) => exit,
        exit = receive_loop(inner, &mut reader) => exit,
        exit = heartbeat_loop(inner, inner.config().heartbeat_interval) => exit,
    };

    *lock(&inner.outbound) = None;
    *lock(&inner.pending_heartbeat) = None;

    if let SessionExit::Shutdown = exit {
        let close_timeout = inner.config().close_timeout;
        let graceful = async {
            // Flush what was queued before the cancel (typically leaves).
            while let Ok(frame) = outbound_rx.try_recv() {
                if send_frame(&mut writer, frame).await.is_err() {
                    break;
                }
            }
            writer.close().await
        };
        match tokio::time::timeout(close_timeout, graceful).await {
            Ok(Ok(())) => log::debug!("[Socket] Closed transport cleanly"),
            Ok(Err(e)) => log::debug!("[Socket] Close handshake failed: {:#}", e),
            Err(_elapsed) => log::warn!("[Socket] Close timed out after {:?}", close_timeout),
        }
    }

    exit
}

async fn send_frame(writer: &mut WsWriter, frame: Outbound) -> anyhow::Result<()> {
    match frame {
        Outbound::Text(text) => writer.send_text(text).await,
        Outbound::Pong(data) => writer.send_pong(data).await,
    }
}

async fn send_loop(
    writer: &mut WsWriter,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> SessionExit {
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(e) = send_frame(writer, frame).await {
            return SessionExit::Lost(format!("{e:#}"));
        }
    }
    SessionExit::Lost("outbound queue closed".to_string())
}

async fn receive_loop(inner: &SocketInner, reader: &mut WsReader) -> SessionExit {
    loop {
        match reader.recv().await {
            Some(Ok(WsMessage::Text(text))) => inner.handle_frame(&text),
            Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => inner.handle_frame(&text),
                Err(e) => log::warn!("[Socket] Dropping non-UTF-8 binary frame: {}", e),
            },
            Some(Ok(WsMessage::Ping(data))) => {
                inner.send_outbound(Outbound::Pong(data));
            }
            Some(Ok(WsMessage::Pong(_))) => {}
            Some(Ok(WsMessage::Close { code, reason })) => {
                log::info!("[Socket] Connection closed by server ({} {})", code, reason);
                return SessionExit::Lost(format!("closed by server ({code})"));
            }
            Some(Err(e)) => return SessionExit::Lost(format!("{e:#}")),
            None => return SessionExit::Lost("stream ended".to_string()),
        }
    }
}

/// Send a heartbeat every `interval`. If the previous heartbeat is still
/// unacknowledged when the next one is due, the connection is dead.
async fn heartbeat_loop(inner: &SocketInner, interval: Duration) -> SessionExit {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let heartbeat_ref = {
            let mut pending = lock(&inner.pending_heartbeat);
            if let Some(stale) = pending.take() {
                log::warn!("[Socket] Heartbeat {} was never acknowledged", stale);
                return SessionExit::Lost("heartbeat timeout".to_string());
            }
            let heartbeat_ref = inner.make_ref();
            *pending = Some(heartbeat_ref.clone());
            heartbeat_ref
        };

        log::trace!("[Socket] Sending heartbeat {}", heartbeat_ref);
        if inner.push(Message::heartbeat(heartbeat_ref)).is_err() {
            return SessionExit::Lost("outbound queue closed".to_string());
        }
    }
}
