//! One physical connection: handshake, read loop, serialized writes and keepalive.
//!
//! A [`ConnectionSession`] is created per successful open and never reused. Its duties report
//! through a single terminal latch so the owner sees exactly one
//! [`SessionEvent::Disconnected`] whatever fails first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::protocol::{
    Command, DISCONNECT_CODE_EXPIRED, ERROR_CODE_TOKEN_EXPIRED, Inbound, ServerDisconnect,
    code_allows_reconnect, connect_client_id, decode_frame, encode_command,
};
use crate::core::{ClientError, ClientResult, KeepAlive, WsCloseFrame, WsConfig, WsFrame};
use crate::transport::{WsConnectRequest, WsTransport};

pub mod writer;

use writer::{SessionWriter, WriterWrite};

/// Request id of the connect command; every later command uses the ids after it.
pub const CONNECT_COMMAND_ID: u32 = 1;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed locally through [`ConnectionSession::close`].
    Closed,
    /// The server closed the socket, ended the stream or sent a disconnect advice.
    Remote {
        code: Option<u32>,
        reason: String,
        reconnect: bool,
    },
    /// A read, write or keepalive deadline elapsed.
    Timeout,
    /// The server reported expired connection credentials.
    Expired,
    /// The transport or codec failed.
    Failed(ClientError),
}

impl DisconnectReason {
    pub(crate) fn from_close(frame: Option<WsCloseFrame>) -> Self {
        match frame {
            Some(frame) if u32::from(frame.code) == DISCONNECT_CODE_EXPIRED => Self::Expired,
            Some(frame) => Self::Remote {
                code: Some(u32::from(frame.code)),
                reason: frame.reason_lossy(),
                reconnect: code_allows_reconnect(u32::from(frame.code)),
            },
            None => Self::Remote {
                code: None,
                reason: "remote closed".to_string(),
                reconnect: true,
            },
        }
    }

    pub(crate) fn from_advice(advice: ServerDisconnect) -> Self {
        if advice.is_expired() {
            return Self::Expired;
        }
        Self::Remote {
            code: Some(advice.code),
            reconnect: advice.allows_reconnect(),
            reason: advice.reason,
        }
    }

    /// Sentinel error reported to callers for this reason.
    pub fn to_error(&self) -> ClientError {
        match self {
            Self::Closed => ClientError::ClientClosed,
            Self::Remote { .. } => ClientError::ClientDisconnected,
            Self::Timeout => ClientError::Timeout,
            Self::Expired => ClientError::ClientExpired,
            Self::Failed(err) => err.clone(),
        }
    }

    pub fn allows_reconnect(&self) -> bool {
        match self {
            Self::Closed | Self::Expired => false,
            Self::Remote { reconnect, .. } => *reconnect,
            Self::Timeout => true,
            Self::Failed(err) => err.is_retryable(),
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Remote {
                code: Some(code),
                reason,
                ..
            } => write!(f, "remote closed: code={code} reason={reason}"),
            Self::Remote { reason, .. } => write!(f, "remote closed: {reason}"),
            Self::Timeout => f.write_str("timeout"),
            Self::Expired => f.write_str("expired"),
            Self::Failed(err) => write!(f, "{err}"),
        }
    }
}

/// Events a running session reports to its owner, in production order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Inbound(Inbound),
    Disconnected(DisconnectReason),
}

/// First-failure-wins terminal signal shared by the session duties.
pub(crate) struct TerminalLatch {
    session: u64,
    fired: AtomicBool,
    shutdown: watch::Sender<bool>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl TerminalLatch {
    fn new(
        session: u64,
        shutdown: watch::Sender<bool>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            session,
            fired: AtomicBool::new(false),
            shutdown,
            events,
        }
    }

    /// Returns `false` when another duty already ended the session.
    pub(crate) fn fail(&self, reason: DisconnectReason) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            debug!(session = self.session, reason = %reason, "discarding secondary session failure");
            return false;
        }
        if reason == DisconnectReason::Closed {
            info!(session = self.session, "session closed");
        } else {
            warn!(session = self.session, reason = %reason, "session terminated");
        }
        self.shutdown.send_replace(true);
        let _ = self.events.send(SessionEvent::Disconnected(reason));
        true
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Per-session timing, taken from [`WsConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
}

impl SessionConfig {
    /// Idle time after which the keepalive loop gives up on the connection: one ping
    /// interval for the ping to go out plus one read-timeout window for any answer.
    pub fn stale_after(&self) -> Duration {
        self.ping_interval.saturating_add(self.read_timeout)
    }
}

impl From<&WsConfig> for SessionConfig {
    fn from(cfg: &WsConfig) -> Self {
        Self {
            read_timeout: cfg.read_timeout,
            write_timeout: cfg.write_timeout,
            ping_interval: cfg.ping_interval,
        }
    }
}

/// A connection that completed the handshake but has no running duties yet.
pub struct OpenedSession<T: WsTransport> {
    reader: T::Reader,
    writer: T::Writer,
    client_id: Option<String>,
}

impl<T: WsTransport> OpenedSession<T> {
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

impl<T: WsTransport> std::fmt::Debug for OpenedSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSession")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Dial and run the connect handshake with `handshake_timeout` as a hard deadline.
///
/// Transport failures are returned unchanged; an elapsed deadline is [`ClientError::Timeout`]
/// and an expired connect token is [`ClientError::ClientExpired`]. A server that closes or
/// sends a disconnect advice forbidding reconnects yields [`ClientError::ClientDisconnected`].
pub async fn open<T: WsTransport>(
    transport: &T,
    request: WsConnectRequest,
    token: Option<String>,
    handshake_timeout: Duration,
) -> ClientResult<OpenedSession<T>> {
    match tokio::time::timeout(handshake_timeout, handshake(transport, request, token)).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout),
    }
}

async fn handshake<T: WsTransport>(
    transport: &T,
    request: WsConnectRequest,
    token: Option<String>,
) -> ClientResult<OpenedSession<T>> {
    let url = request.url.clone();
    let (mut reader, mut writer) = transport.connect(request).await?;
    debug!(connection = %url, "transport connected; sending connect command");
    writer
        .send(encode_command(CONNECT_COMMAND_ID, &Command::Connect { token })?)
        .await?;

    loop {
        let frame = match reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return Err(err),
            None => {
                return Err(ClientError::transport(
                    "handshake",
                    "connection closed before connect reply",
                ));
            }
        };
        match frame {
            WsFrame::Close(close) => {
                return Err(handshake_refused(DisconnectReason::from_close(close)));
            }
            WsFrame::Ping(payload) => {
                writer.send(WsFrame::Pong(payload)).await?;
                continue;
            }
            WsFrame::Pong(_) => continue,
            WsFrame::Text(_) | WsFrame::Binary(_) => {}
        }

        match decode_frame(&frame)? {
            Some(Inbound::Reply(reply)) if reply.id == CONNECT_COMMAND_ID => {
                return match reply.outcome {
                    Ok(result) => Ok(OpenedSession {
                        reader,
                        writer,
                        client_id: connect_client_id(result.as_ref()),
                    }),
                    Err(err) if err.code == ERROR_CODE_TOKEN_EXPIRED => {
                        Err(ClientError::ClientExpired)
                    }
                    Err(err) => Err(err.into()),
                };
            }
            Some(Inbound::Disconnect(advice)) => {
                return Err(handshake_refused(DisconnectReason::from_advice(advice)));
            }
            _ => debug!(connection = %url, "ignoring frame received before connect reply"),
        }
    }
}

/// Error for a server that ends the connection before answering the connect command.
fn handshake_refused(reason: DisconnectReason) -> ClientError {
    match reason {
        DisconnectReason::Expired => ClientError::ClientExpired,
        other if !other.allows_reconnect() => other.to_error(),
        other => ClientError::transport("handshake", other),
    }
}

/// Running session: writer actor, read loop and keepalive loop.
pub struct ConnectionSession<T: WsTransport> {
    id: u64,
    client_id: Option<String>,
    next_id: Arc<AtomicU32>,
    latch: Arc<TerminalLatch>,
    writer: ActorRef<SessionWriter<T::Writer>>,
    reader_task: Option<JoinHandle<()>>,
    ping_task: Option<JoinHandle<()>>,
}

impl<T: WsTransport> ConnectionSession<T> {
    /// Start the duties of an opened connection. Events are delivered to `events` in the
    /// order the read loop produced them, ending with exactly one `Disconnected`.
    pub fn start(
        id: u64,
        opened: OpenedSession<T>,
        cfg: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let OpenedSession {
            reader,
            writer,
            client_id,
        } = opened;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let latch = Arc::new(TerminalLatch::new(id, shutdown_tx, events.clone()));
        let keepalive = Arc::new(KeepAlive::new(cfg.ping_interval, cfg.stale_after()));
        let next_id = Arc::new(AtomicU32::new(CONNECT_COMMAND_ID + 1));

        let writer = SessionWriter::spawn(SessionWriter::new(
            writer,
            cfg.write_timeout,
            shutdown_rx.clone(),
            latch.clone(),
        ));

        let reader_task = tokio::spawn(read_loop(
            id,
            reader,
            cfg.read_timeout,
            keepalive.clone(),
            writer.clone(),
            latch.clone(),
            events,
            shutdown_rx.clone(),
        ));
        let ping_task = tokio::spawn(keepalive_loop(
            id,
            keepalive,
            next_id.clone(),
            writer.clone(),
            latch.clone(),
            shutdown_rx,
        ));

        Self {
            id,
            client_id,
            next_id,
            latch,
            writer,
            reader_task: Some(reader_task),
            ping_task: Some(ping_task),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn is_terminated(&self) -> bool {
        self.latch.is_fired()
    }

    /// Encode `command` under a fresh request id and hand it to the writer.
    /// Returns the id the reply will carry.
    pub async fn send(&self, command: &Command) -> ClientResult<u32> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode_command(id, command)?;
        write_frame(&self.writer, frame).await?;
        Ok(id)
    }

    /// Tear the session down and wait until its duties are joined and the socket is closed.
    ///
    /// Idempotent: when a duty already failed, its reason stays the terminal one.
    pub async fn close(&mut self, reason: DisconnectReason) {
        self.latch.fail(reason);
        if let Some(task) = self.reader_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.ping_task.take() {
            let _ = task.await;
        }
        let _ = self.writer.stop_gracefully().await;
        self.writer.wait_for_shutdown().await;
    }
}

impl<T: WsTransport> Drop for ConnectionSession<T> {
    fn drop(&mut self) {
        self.latch.shutdown.send_replace(true);
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
    }
}

async fn write_frame<W>(writer: &ActorRef<SessionWriter<W>>, frame: WsFrame) -> ClientResult<()>
where
    W: futures_util::Sink<WsFrame, Error = ClientError> + Send + Sync + Unpin + 'static,
{
    match writer.ask(WriterWrite { frame }).await {
        Ok(()) => Ok(()),
        Err(SendError::HandlerError(err)) => Err(err),
        Err(_) => Err(ClientError::ClientDisconnected),
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_loop<R, W>(
    session: u64,
    mut reader: R,
    read_timeout: Duration,
    keepalive: Arc<KeepAlive>,
    writer: ActorRef<SessionWriter<W>>,
    latch: Arc<TerminalLatch>,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: Stream<Item = ClientResult<WsFrame>> + Send + Unpin + 'static,
    W: futures_util::Sink<WsFrame, Error = ClientError> + Send + Sync + Unpin + 'static,
{
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow_and_update() { break; }
            }
            next = tokio::time::timeout(read_timeout, reader.next()) => {
                let frame = match next {
                    Err(_) => {
                        latch.fail(DisconnectReason::Timeout);
                        break;
                    }
                    Ok(None) => {
                        latch.fail(DisconnectReason::Remote {
                            code: None,
                            reason: "stream ended".to_string(),
                            reconnect: true,
                        });
                        break;
                    }
                    Ok(Some(Err(err))) => {
                        latch.fail(DisconnectReason::Failed(err));
                        break;
                    }
                    Ok(Some(Ok(frame))) => frame,
                };
                keepalive.record_activity();

                match frame {
                    WsFrame::Close(close) => {
                        latch.fail(DisconnectReason::from_close(close));
                        break;
                    }
                    WsFrame::Ping(payload) => {
                        if write_frame(&writer, WsFrame::Pong(payload)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    WsFrame::Pong(_) => continue,
                    WsFrame::Text(_) | WsFrame::Binary(_) => {}
                }

                match decode_frame(&frame) {
                    Ok(Some(Inbound::Disconnect(advice))) => {
                        latch.fail(DisconnectReason::from_advice(advice));
                        break;
                    }
                    Ok(Some(inbound)) => {
                        if events.send(SessionEvent::Inbound(inbound)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(session, error = %err, "dropping undecodable frame"),
                }
            }
        }
    }
}

async fn keepalive_loop<W>(
    session: u64,
    keepalive: Arc<KeepAlive>,
    next_id: Arc<AtomicU32>,
    writer: ActorRef<SessionWriter<W>>,
    latch: Arc<TerminalLatch>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: futures_util::Sink<WsFrame, Error = ClientError> + Send + Sync + Unpin + 'static,
{
    let interval = keepalive.interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow_and_update() { break; }
            }
            _ = ticker.tick() => {
                if keepalive.is_stale() {
                    warn!(
                        session,
                        idle_ms = keepalive.idle_for().as_millis() as u64,
                        pings = keepalive.pings_sent(),
                        "no inbound activity since the last keepalive window"
                    );
                    latch.fail(DisconnectReason::Timeout);
                    break;
                }
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let frame = match encode_command(id, &Command::Ping) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(session, error = %err, "failed to encode ping");
                        continue;
                    }
                };
                keepalive.record_ping();
                if write_frame(&writer, frame).await.is_err() {
                    break;
                }
            }
        }
    }
}
