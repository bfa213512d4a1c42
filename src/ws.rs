//! WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves, plus construction of the socket endpoint URL. The
//! [`Socket`](crate::socket::Socket) is the only consumer; channels never
//! touch the transport directly.
//!
//! # Endpoint URL
//!
//! ```text
//! https://example.com/socket?token=a b
//!   -> wss://example.com/socket/websocket?token=a%20b&vsn=2.0.0
//! ```
//!
//! The scheme is upgraded (`http` -> `ws`, `https` -> `wss`), `/websocket`
//! is appended to the path, and the query always carries the protocol
//! version plus the caller's parameters, each component percent-escaped.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::constants::WEBSOCKET_PATH;
use crate::error::Error;

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame (fragments already reassembled).
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text))
            .await
            .context("WebSocket send_text failed")
    }

    /// Send a pong frame in response to a ping.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    /// Send a close frame, flush, and close the sink.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Raw `Frame` variants are skipped internally.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text.to_string())));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsMessage::Binary(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(Ok(WsMessage::Ping(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Pong(data))) => {
                    return Some(Ok(WsMessage::Pong(data.to_vec())));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

/// Connect to a WebSocket URL, giving up after `timeout`.
///
/// Returns split (writer, reader) halves for independent use in
/// `tokio::select!` loops.
pub async fn connect(url: &str, timeout: Duration) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    let (ws_stream, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
        .await
        .with_context(|| format!("WebSocket connect timed out after {timeout:?}"))?
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Build the WebSocket endpoint URL from a caller-supplied URL.
///
/// `http`/`https` are upgraded to `ws`/`wss`; `ws`/`wss` pass through. Any
/// other scheme is rejected. Existing query pairs on `url` are kept in front
/// of the generated ones.
pub fn endpoint_url(
    url: &str,
    vsn: &str,
    params: &BTreeMap<String, String>,
) -> std::result::Result<String, Error> {
    let mut parsed =
        url::Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;

    let scheme = match parsed.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::InvalidUrl(format!(
                "{url}: unsupported scheme '{other}'"
            )))
        }
    };
    parsed
        .set_scheme(scheme)
        .map_err(|()| Error::InvalidUrl(format!("{url}: cannot switch scheme to {scheme}")))?;

    let path = format!("{}/{}", parsed.path().trim_end_matches('/'), WEBSOCKET_PATH);
    parsed.set_path(&path);

    let mut pairs: Vec<String> = parsed
        .query()
        .filter(|q| !q.is_empty())
        .map(|q| vec![q.to_string()])
        .unwrap_or_default();
    pairs.extend(
        params
            .iter()
            .filter(|(key, _)| key.as_str() != "vsn")
            .map(|(key, value)| format!("{}={}", urlencoding::encode(key), urlencoding::encode(value))),
    );
    pairs.push(format!("vsn={}", urlencoding::encode(vsn)));
    parsed.set_query(Some(&pairs.join("&")));

    Ok(parsed.into())
}
