//! In-memory transport for driving the client without a real socket.
//!
//! [`MockTransport::channel_pair`] returns the transport for the client and a [`MockServer`]
//! handle. Every successful `connect` yields a fresh [`MockConnection`] on the server side, so
//! tests can accept handshakes, answer commands, push publications and drop sockets across
//! reconnects.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Sink;
use http::HeaderMap;
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};

use crate::core::{ClientError, ClientResult, WsFrame, into_ws_frame};
use crate::session::CONNECT_COMMAND_ID;
use crate::transport::{WsConnectRequest, WsTransport, WsTransportConnectFuture};

/// Client id the mock server hands out in connect replies.
pub const MOCK_CLIENT_ID: &str = "mock-client";

struct Shared {
    connections_tx: mpsc::UnboundedSender<MockConnection>,
    fail_next: AtomicU32,
    connect_count: AtomicU32,
    last_request: Mutex<Option<(String, HeaderMap)>>,
}

/// Write faults injected into one connection's writer.
#[derive(Default)]
struct WriteFaults {
    stalled: AtomicBool,
    failing: AtomicBool,
}

/// Transport backed by in-memory channels.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    /// Build a transport + server control pair.
    pub fn channel_pair() -> (Self, MockServer) {
        let (connections_tx, connections_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            connections_tx,
            fail_next: AtomicU32::new(0),
            connect_count: AtomicU32::new(0),
            last_request: Mutex::new(None),
        });
        (
            Self {
                shared: shared.clone(),
            },
            MockServer {
                connections_rx,
                shared,
            },
        )
    }
}

impl WsTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(&self, request: WsConnectRequest) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let shared = self.shared.clone();
        Box::pin(async move {
            shared.connect_count.fetch_add(1, Ordering::SeqCst);
            *shared.last_request.lock().await = Some((request.url.clone(), request.header.clone()));

            let refused = shared
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(ClientError::transport("mock_connect", "connection refused"));
            }

            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let faults = Arc::new(WriteFaults::default());
            shared
                .connections_tx
                .send(MockConnection {
                    outbound_rx: sent_rx,
                    inbound_tx: Some(inbound_tx),
                    faults: faults.clone(),
                })
                .map_err(|_| ClientError::transport("mock_connect", "mock server dropped"))?;
            Ok((
                MockReader { rx: inbound_rx },
                MockWriter {
                    sent_tx: Some(sent_tx),
                    faults,
                },
            ))
        })
    }
}

/// Server-side control handle paired with [`MockTransport`].
pub struct MockServer {
    connections_rx: mpsc::UnboundedReceiver<MockConnection>,
    shared: Arc<Shared>,
}

impl MockServer {
    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        self.shared.fail_next.store(n, Ordering::SeqCst);
    }

    /// Connection attempts seen so far, refused ones included.
    pub fn connect_count(&self) -> u32 {
        self.shared.connect_count.load(Ordering::SeqCst)
    }

    /// URL and headers of the most recent connection attempt.
    pub async fn last_request(&self) -> Option<(String, HeaderMap)> {
        self.shared.last_request.lock().await.clone()
    }

    /// Wait for the next accepted connection.
    pub async fn next_connection(&mut self, timeout: Duration) -> Option<MockConnection> {
        tokio::time::timeout(timeout, self.connections_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Error surface for operations on [`MockConnection`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MockServerError {
    /// The inbound socket side was intentionally dropped.
    SocketDropped,
    /// The client side is no longer reading.
    ChannelClosed,
}

impl std::fmt::Display for MockServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockServerError::SocketDropped => f.write_str("mock socket already dropped"),
            MockServerError::ChannelClosed => f.write_str("mock client channel is closed"),
        }
    }
}

impl std::error::Error for MockServerError {}

#[derive(Deserialize)]
struct RawCommand {
    id: u32,
    method: String,
    #[serde(default)]
    params: Option<RawParams>,
}

#[derive(Deserialize)]
struct RawParams {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    data: Option<sonic_rs::Value>,
}

/// Command decoded from a frame the client wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCommand {
    pub id: u32,
    pub method: String,
    pub channel: Option<String>,
    pub token: Option<String>,
    /// Publish payload re-encoded as compact JSON.
    pub data: Option<String>,
}

/// Decode a client command frame. Non-text frames and malformed payloads yield `None`.
pub fn decode_command(frame: &WsFrame) -> Option<MockCommand> {
    let WsFrame::Text(bytes) = frame else {
        return None;
    };
    let raw: RawCommand = sonic_rs::from_slice(bytes).ok()?;
    let params = raw.params;
    let (channel, token, data) = match params {
        Some(params) => (
            params.channel,
            params.token,
            params.data.and_then(|value| sonic_rs::to_string(&value).ok()),
        ),
        None => (None, None, None),
    };
    Some(MockCommand {
        id: raw.id,
        method: raw.method,
        channel,
        token,
        data,
    })
}

/// One accepted connection, seen from the server.
pub struct MockConnection {
    outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
    inbound_tx: Option<mpsc::UnboundedSender<WsFrame>>,
    faults: Arc<WriteFaults>,
}

impl MockConnection {
    /// Next frame written by the client. `None` on timeout or once the client closed its side.
    pub async fn recv_outbound(&mut self, timeout: Duration) -> Option<WsFrame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next command written by the client, skipping control frames.
    pub async fn recv_command(&mut self, timeout: Duration) -> Option<MockCommand> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = self.recv_outbound(remaining).await?;
            if frame.is_control() {
                continue;
            }
            if let Some(command) = decode_command(&frame) {
                return Some(command);
            }
        }
    }

    /// Next command with the given method, skipping others (keepalive pings, for instance).
    pub async fn recv_method(&mut self, method: &str, timeout: Duration) -> Option<MockCommand> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let command = self.recv_command(remaining).await?;
            if command.method == method {
                return Some(command);
            }
        }
    }

    /// Wait for the connect command and answer it successfully.
    pub async fn accept_handshake(&mut self, timeout: Duration) -> Option<MockCommand> {
        let command = self.recv_method("connect", timeout).await?;
        debug_assert_eq!(command.id, CONNECT_COMMAND_ID);
        self.send_text(format!(
            r#"{{"id":{},"result":{{"client":"{MOCK_CLIENT_ID}"}}}}"#,
            command.id
        ))
        .ok()?;
        Some(command)
    }

    pub fn reply_ok(&self, id: u32) -> Result<(), MockServerError> {
        self.send_text(format!(r#"{{"id":{id},"result":{{}}}}"#))
    }

    pub fn reply_error(&self, id: u32, code: u32, message: &str) -> Result<(), MockServerError> {
        self.send_text(format!(
            r#"{{"id":{id},"error":{{"code":{code},"message":"{message}"}}}}"#
        ))
    }

    /// Push a publication; `data` must be JSON.
    pub fn push_publication(&self, channel: &str, data: &str) -> Result<(), MockServerError> {
        self.send_text(format!(
            r#"{{"push":{{"channel":"{channel}","data":{data}}}}}"#
        ))
    }

    pub fn push_disconnect(&self, code: u32, reason: &str, reconnect: bool) -> Result<(), MockServerError> {
        self.send_text(format!(
            r#"{{"push":{{"disconnect":{{"code":{code},"reason":"{reason}","reconnect":{reconnect}}}}}}}"#
        ))
    }

    /// Push an inbound frame to the client.
    pub fn send_inbound(&self, frame: WsFrame) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(frame).map_err(|_| MockServerError::ChannelClosed)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), MockServerError> {
        self.send_inbound(into_ws_frame(text.into()))
    }

    pub fn close(&self, code: u16, reason: &'static str) -> Result<(), MockServerError> {
        self.send_inbound(WsFrame::close(code, Bytes::from_static(reason.as_bytes())))
    }

    /// Make every later client write on this connection hang. Closing still succeeds.
    pub fn stall_writes(&self) {
        self.faults.stalled.store(true, Ordering::SeqCst);
    }

    /// Make every later client write on this connection fail with a transport error.
    pub fn fail_writes(&self) {
        self.faults.failing.store(true, Ordering::SeqCst);
    }

    /// Simulate a server-side socket drop by ending the client's read stream.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }
}

/// Reader side for [`MockTransport`].
pub struct MockReader {
    rx: mpsc::UnboundedReceiver<WsFrame>,
}

impl futures_util::Stream for MockReader {
    type Item = ClientResult<WsFrame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.rx).poll_recv(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Writer side for [`MockTransport`]. Closing it ends the server's outbound stream.
pub struct MockWriter {
    sent_tx: Option<mpsc::UnboundedSender<WsFrame>>,
    faults: Arc<WriteFaults>,
}

impl Sink<WsFrame> for MockWriter {
    type Error = ClientError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // A stalled writer is never woken; the caller's write deadline ends the wait.
        if self.faults.stalled.load(Ordering::SeqCst) {
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        if self.faults.failing.load(Ordering::SeqCst) {
            return Err(ClientError::transport("mock_transport_write", "write failed"));
        }
        let Some(tx) = self.get_mut().sent_tx.as_ref() else {
            return Err(ClientError::transport("mock_transport_write", "writer closed"));
        };
        tx.send(item)
            .map_err(|_| ClientError::transport("mock_transport_write", "mock outbound channel closed"))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().sent_tx = None;
        Poll::Ready(Ok(()))
    }
}
