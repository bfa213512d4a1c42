//! End-to-end tests against an in-process Phoenix-protocol server.
//!
//! The server speaks just enough of the V2 wire format to exercise the
//! client: it acknowledges heartbeats, accepts or rejects joins, answers
//! `ping` pushes, echoes `shout` broadcasts, closes channels on leave and
//! seeds presence for `presence:*` topics. Tests can make it ignore
//! heartbeats or drop every live connection without a close handshake.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use phx_client::{
    Channel, ChannelState, ConnectionState, Error, Presence, Socket, SocketConfig, SocketEvent,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::WebSocketStream;

const WAIT: Duration = Duration::from_secs(5);

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

#[derive(Default)]
struct Behavior {
    ignore_heartbeats: AtomicBool,
    reject_joins: AtomicBool,
}

struct TestServer {
    addr: SocketAddr,
    behavior: Arc<Behavior>,
    connections: Arc<AtomicUsize>,
    frames: Arc<Mutex<Vec<Value>>>,
    sever_tx: broadcast::Sender<()>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let behavior = Arc::new(Behavior::default());
        let connections = Arc::new(AtomicUsize::new(0));
        let frames = Arc::new(Mutex::new(Vec::new()));
        let (sever_tx, _) = broadcast::channel(4);

        let (b, c, f, s) = (
            Arc::clone(&behavior),
            Arc::clone(&connections),
            Arc::clone(&frames),
            sever_tx.clone(),
        );
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                c.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(ws, Arc::clone(&b), Arc::clone(&f), s.subscribe()));
            }
        });

        Self {
            addr,
            behavior,
            connections,
            frames,
            sever_tx,
        }
    }

    fn url(&self) -> String {
        format!("http://{}/socket", self.addr)
    }

    /// Drop every live connection without a close frame.
    fn sever(&self) {
        let _ = self.sever_tx.send(());
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every received envelope with the given event name.
    fn frames_for(&self, event: &str) -> Vec<Value> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame[3] == event)
            .cloned()
            .collect()
    }
}

async fn serve(
    mut ws: WebSocketStream<TcpStream>,
    behavior: Arc<Behavior>,
    frames: Arc<Mutex<Vec<Value>>>,
    mut sever_rx: broadcast::Receiver<()>,
) {
    loop {
        let frame = tokio::select! {
            _ = sever_rx.recv() => return,
            frame = ws.next() => frame,
        };
        let text = match frame {
            Some(Ok(WsFrame::Text(text))) => text,
            Some(Ok(WsFrame::Close(_)) | Err(_)) | None => return,
            Some(Ok(_)) => continue,
        };
        let Ok(Value::Array(parts)) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        frames.lock().unwrap().push(Value::Array(parts.clone()));
        let Ok([join_ref, msg_ref, topic, event, payload]) = <[Value; 5]>::try_from(parts) else {
            continue;
        };

        let reply = |status: &str, response: Value| {
            json!([join_ref, msg_ref, topic, "phx_reply", {"status": status, "response": response}])
        };
        let mut out = Vec::new();
        match event.as_str().unwrap_or_default() {
            "heartbeat" => {
                if !behavior.ignore_heartbeats.load(Ordering::SeqCst) {
                    out.push(reply("ok", json!({})));
                }
            }
            "phx_join" => {
                if behavior.reject_joins.load(Ordering::SeqCst) {
                    out.push(reply("error", json!({"reason": "unauthorized"})));
                } else {
                    out.push(reply("ok", json!({"joined": topic})));
                    if topic.as_str().is_some_and(|t| t.starts_with("presence:")) {
                        out.push(json!([join_ref, null, topic, "presence_state", {
                            "alice": {"metas": [{"phx_ref": "a1", "device": "web"}]},
                            "bob": {"metas": [{"phx_ref": "b1"}]}
                        }]));
                        out.push(json!([join_ref, null, topic, "presence_diff", {
                            "joins": {"carol": {"metas": [{"phx_ref": "c1"}]}},
                            "leaves": {"bob": {"metas": [{"phx_ref": "b1"}]}}
                        }]));
                    }
                }
            }
            "phx_leave" => {
                out.push(reply("ok", json!({})));
                out.push(json!([join_ref, null, topic, "phx_close", {}]));
            }
            "ping" => out.push(reply("ok", json!({"pong": payload}))),
            "shout" => out.push(json!([join_ref, null, topic, "shout", payload])),
            "slow" => {}
            _ => out.push(reply("ok", json!({}))),
        }

        for value in out {
            if ws.send(WsFrame::Text(value.to_string())).await.is_err() {
                return;
            }
        }
    }
}

fn config(url: &str) -> SocketConfig {
    SocketConfig::builder()
        .url(url)
        .reconnect_backoff(ms(20), ms(100))
        .rejoin_backoff(ms(20), ms(100), 3)
        .join_timeout(Duration::from_secs(2))
        .push_timeout(Duration::from_secs(2))
        .connect_timeout(Duration::from_secs(2))
        .close_timeout(ms(500))
        .build()
        .unwrap()
}

async fn connected_socket(config: SocketConfig) -> Socket {
    let socket = Socket::new(config).unwrap();
    socket.connect();
    assert!(socket.wait_for_state(ConnectionState::Connected, WAIT).await);
    socket
}

async fn wait_for_channel(channel: &Channel, state: ChannelState) -> bool {
    let mut rx = channel.watch_state();
    let reached = matches!(
        tokio::time::timeout(WAIT, rx.wait_for(|current| *current == state)).await,
        Ok(Ok(_))
    );
    reached
}

/// Collect state transitions until `last` is reached.
async fn states_until(
    events: &mut broadcast::Receiver<SocketEvent>,
    last: ConnectionState,
) -> Vec<ConnectionState> {
    let mut states = Vec::new();
    let collect = async {
        loop {
            match events.recv().await {
                Ok(SocketEvent::StateChanged(state)) => {
                    states.push(state);
                    if state == last {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    };
    tokio::time::timeout(WAIT, collect)
        .await
        .expect("state transition timed out");
    states
}

#[tokio::test]
async fn test_join_and_push_await_round_trip() {
    let server = TestServer::start().await;
    let socket = connected_socket(config(&server.url())).await;

    let channel = socket.channel("room:1", json!({"token": "abc"}));
    let reply = channel.join(Duration::from_secs(2)).await;
    assert!(reply.is_ok(), "join failed: {reply:?}");
    assert_eq!(reply.response, json!({"joined": "room:1"}));
    assert_eq!(channel.state(), ChannelState::Joined);

    let joins = server.frames_for("phx_join");
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0][0], joins[0][1], "join_ref equals ref on join");
    assert_eq!(joins[0][4], json!({"token": "abc"}));

    let reply = channel
        .push_await("ping", json!({"n": 1}), Duration::from_secs(2))
        .await;
    assert!(reply.is_ok());
    assert_eq!(reply.response, json!({"pong": {"n": 1}}));

    let pings = server.frames_for("ping");
    assert_eq!(pings[0][0], joins[0][0], "push carries the join ref");

    socket.disconnect().await;
    assert_eq!(socket.state(), ConnectionState::Disconnected);
    assert_eq!(channel.state(), ChannelState::Closed);
}

#[tokio::test]
async fn test_push_await_times_out_without_reply() {
    let server = TestServer::start().await;
    let socket = connected_socket(config(&server.url())).await;
    let channel = socket.channel("room:1", json!({}));
    assert!(channel.join(Duration::from_secs(2)).await.is_ok());

    let reply = channel.push_await("slow", json!({}), ms(100)).await;
    assert!(!reply.is_ok());
    assert_eq!(reply.reason_str(), Some("timeout"));

    // The socket is still healthy afterwards.
    let reply = channel.push_await("ping", json!({}), Duration::from_secs(2)).await;
    assert!(reply.is_ok());
    socket.disconnect().await;
}

#[tokio::test]
async fn test_inbound_events_reach_callbacks() {
    let server = TestServer::start().await;
    let socket = connected_socket(config(&server.url())).await;
    let channel = socket.channel("room:1", json!({}));

    let (tx, mut rx) = mpsc::unbounded_channel();
    channel.on("shout", move |payload| {
        let _ = tx.send(payload.clone());
    });
    channel.on("shout", |_| panic!("misbehaving callback"));
    assert!(channel.join(Duration::from_secs(2)).await.is_ok());

    channel.push("shout", json!({"body": "hi"})).unwrap();
    let payload = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(payload, json!({"body": "hi"}));
    socket.disconnect().await;
}

#[tokio::test]
async fn test_rejected_join_moves_channel_to_errored() {
    let server = TestServer::start().await;
    server.behavior.reject_joins.store(true, Ordering::SeqCst);
    let socket = connected_socket(config(&server.url())).await;
    let channel = socket.channel("room:secret", json!({}));

    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = Arc::clone(&errors);
    channel.on_error(move |error| e.lock().unwrap().push(error.clone()));

    let reply = channel.join(Duration::from_secs(2)).await;
    assert!(!reply.is_ok());
    assert_eq!(reply.reason_str(), Some("unauthorized"));
    assert_eq!(
        errors.lock().unwrap()[0],
        Error::Join(json!({"reason": "unauthorized"}))
    );

    // Three automatic rejoins (20ms, 40ms, 80ms), all rejected, then give up.
    let exhausted = async {
        loop {
            if errors
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, Error::RejoinAttemptsExhausted { attempts: 3 }))
            {
                return;
            }
            tokio::time::sleep(ms(10)).await;
        }
    };
    tokio::time::timeout(WAIT, exhausted).await.unwrap();
    assert_eq!(server.frames_for("phx_join").len(), 4);
    assert_eq!(channel.state(), ChannelState::Errored);

    // An explicit join starts a fresh budget.
    server.behavior.reject_joins.store(false, Ordering::SeqCst);
    assert!(channel.join(Duration::from_secs(2)).await.is_ok());
    socket.disconnect().await;
}

#[tokio::test]
async fn test_leave_closes_and_unregisters() {
    let server = TestServer::start().await;
    let socket = connected_socket(config(&server.url())).await;
    let channel = socket.channel("room:1", json!({}));
    assert!(channel.join(Duration::from_secs(2)).await.is_ok());

    let closes = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&closes);
    channel.on_close(move |()| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    let reply = channel.leave(Duration::from_secs(2)).await;
    assert!(reply.is_ok());
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(socket.topics().is_empty());

    // The server's trailing phx_close belongs to the finished session.
    tokio::time::sleep(ms(100)).await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    // A new channel for the topic is a fresh instance.
    let again = socket.channel("room:1", json!({}));
    assert!(!again.same_channel(&channel));
    socket.disconnect().await;
}

#[tokio::test]
async fn test_heartbeat_timeout_triggers_reconnect() {
    let server = TestServer::start().await;
    server.behavior.ignore_heartbeats.store(true, Ordering::SeqCst);
    let mut config = config(&server.url());
    config.heartbeat_interval = ms(50);

    let socket = connected_socket(config).await;
    let mut events = socket.subscribe();

    let states = states_until(&mut events, ConnectionState::Reconnecting).await;
    assert_eq!(states, vec![ConnectionState::Reconnecting]);
    assert!(server.frames_for("heartbeat").len() >= 1);

    server.behavior.ignore_heartbeats.store(false, Ordering::SeqCst);
    assert!(socket.wait_for_state(ConnectionState::Connected, WAIT).await);
    assert!(server.connections() >= 2);
    socket.disconnect().await;
}

#[tokio::test]
async fn test_severed_connection_reconnects_and_rejoins() {
    let server = TestServer::start().await;
    let socket = connected_socket(config(&server.url())).await;
    let lobby = socket.channel("room:lobby", json!({}));
    let other = socket.channel("room:other", json!({}));
    assert!(lobby.join(Duration::from_secs(2)).await.is_ok());
    assert!(other.join(Duration::from_secs(2)).await.is_ok());
    let first_join_ref = lobby.join_ref();

    let mut events = socket.subscribe();
    server.sever();

    let states = states_until(&mut events, ConnectionState::Connected).await;
    assert_eq!(
        states,
        vec![
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );
    assert_eq!(server.connections(), 2);

    assert!(wait_for_channel(&lobby, ChannelState::Joined).await);
    assert!(wait_for_channel(&other, ChannelState::Joined).await);
    assert_ne!(lobby.join_ref(), first_join_ref, "rejoin uses a fresh join ref");
    assert_eq!(server.frames_for("phx_join").len(), 4);

    let reply = lobby.push_await("ping", json!({}), Duration::from_secs(2)).await;
    assert!(reply.is_ok());
    socket.disconnect().await;
}

#[tokio::test]
async fn test_connect_failure_keeps_retrying() {
    // Reserve a port, then free it so nothing is listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let socket = Socket::new(config(&format!("http://{addr}/socket"))).unwrap();
    let mut events = socket.subscribe();
    socket.connect();

    let mut connect_errors = 0;
    let mut attempts = 0;
    let watch = async {
        while connect_errors < 2 || attempts < 2 {
            match events.recv().await {
                Ok(SocketEvent::Error(Error::Connect(_))) => connect_errors += 1,
                Ok(SocketEvent::StateChanged(ConnectionState::Connecting)) => attempts += 1,
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    };
    tokio::time::timeout(WAIT, watch).await.unwrap();

    socket.disconnect().await;
    assert_eq!(socket.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_stops_reconnecting() {
    let server = TestServer::start().await;
    let socket = connected_socket(config(&server.url())).await;
    socket.disconnect().await;

    tokio::time::sleep(ms(200)).await;
    assert_eq!(server.connections(), 1);
    assert_eq!(socket.state(), ConnectionState::Disconnected);

    // A disconnected socket can connect again.
    socket.connect();
    assert!(socket.wait_for_state(ConnectionState::Connected, WAIT).await);
    assert_eq!(server.connections(), 2);
    socket.disconnect().await;
}

#[tokio::test]
async fn test_presence_tracks_server_state() {
    let server = TestServer::start().await;
    let socket = connected_socket(config(&server.url())).await;
    let channel = socket.channel("presence:lobby", json!({}));
    let presence = Presence::new(&channel);

    let (tx, mut rx) = mpsc::unbounded_channel();
    presence.on_sync(move |state| {
        let _ = tx.send(state.keys().cloned().collect::<Vec<_>>());
    });
    let leaves = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&leaves);
    presence.on_leave(move |leave| l.lock().unwrap().push(leave.key.clone()));

    assert!(channel.join(Duration::from_secs(2)).await.is_ok());

    let first = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, vec!["alice", "bob"]);
    let second = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(second, vec!["alice", "carol"]);

    assert_eq!(presence.online_keys(), vec!["alice", "carol"]);
    assert_eq!(presence.connection_count("alice"), 1);
    assert_eq!(presence.connection_count("bob"), 0);
    assert_eq!(
        presence.get("alice").unwrap().metas[0].fields["device"],
        json!("web")
    );
    assert_eq!(*leaves.lock().unwrap(), vec!["bob"]);

    presence.dispose();
    socket.disconnect().await;
}

#[tokio::test]
async fn test_concurrent_joins_share_one_attempt() {
    let server = TestServer::start().await;
    let socket = connected_socket(config(&server.url())).await;
    let channel = socket.channel("room:1", json!({}));

    let (first, second) = tokio::join!(
        channel.join(Duration::from_secs(2)),
        channel.join(Duration::from_secs(2))
    );
    assert!(first.is_ok(), "first join failed: {first:?}");
    assert_eq!(first, second);

    let joins: Vec<Value> = server
        .frames_for("phx_join")
        .into_iter()
        .filter(|frame| frame[2] == "room:1")
        .collect();
    assert_eq!(joins.len(), 1);
    socket.disconnect().await;
}

#[tokio::test]
async fn test_join_before_connect_errors_then_joins_on_connect() {
    let server = TestServer::start().await;
    let socket = Socket::new(config(&server.url())).unwrap();
    let channel = socket.channel("room:1", json!({}));

    let reply = channel.join(ms(50)).await;
    assert_eq!(reply.reason_str(), Some("timeout"));
    assert_eq!(channel.state(), ChannelState::Errored);
    assert!(server.frames_for("phx_join").is_empty());

    socket.connect();
    assert!(wait_for_channel(&channel, ChannelState::Joined).await);
    assert!(channel
        .push_await("ping", json!({}), Duration::from_secs(2))
        .await
        .is_ok());
    socket.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_during_backoff_publishes_nothing_after_closing() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    for _ in 0..5 {
        let socket = Socket::new(config(&format!("http://{addr}/socket"))).unwrap();
        let mut events = socket.subscribe();
        socket.connect();

        let failed = async {
            loop {
                if let Ok(SocketEvent::Error(Error::Connect(_))) = events.recv().await {
                    return;
                }
            }
        };
        tokio::time::timeout(WAIT, failed).await.unwrap();
        socket.disconnect().await;
        tokio::time::sleep(ms(50)).await;

        let mut after_closing = Vec::new();
        let mut closing_seen = false;
        while let Ok(event) = events.try_recv() {
            if let SocketEvent::StateChanged(state) = event {
                if closing_seen {
                    after_closing.push(state);
                }
                closing_seen |= state == ConnectionState::Closing;
            }
        }
        assert!(closing_seen);
        assert_eq!(after_closing, vec![ConnectionState::Disconnected]);
    }
}
