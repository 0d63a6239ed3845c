use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kameo::error::ActorStopReason;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ClientEvent, ClientStatus, ConnectionState};
use crate::core::protocol::{Command, Inbound, Reply};
use crate::core::{BackoffPolicy, ClientError, ClientResult, Config, ReconnectAttempt, RetryPlan};
use crate::session::{
    self, ConnectionSession, DisconnectReason, OpenedSession, SessionConfig, SessionEvent,
};
use crate::subscription::{Publication, Subscription, SubscriptionRegistry, TokenProvider};
use crate::transport::{WsConnectRequest, WsTransport};

pub struct ClientActorArgs<T: WsTransport> {
    pub url: String,
    pub config: Config,
    pub transport: T,
    pub connect_token: Option<String>,
    pub token_provider: Option<Arc<dyn TokenProvider>>,
    pub events: broadcast::Sender<ClientEvent>,
}

/// Command awaiting its reply on the current session.
#[derive(Debug)]
enum PendingCommand {
    Subscribe { channel: String, seq: u64 },
    Unsubscribe { channel: String },
    Publish { channel: String },
}

/// Connection orchestrator.
///
/// Owns the connection state, the reconnect loop and the subscription registry. Every
/// transition runs inside a message handler; sessions, open attempts and reconnect waits
/// report back through messages tagged with the id they were started under, so late
/// reports from a superseded attempt are dropped.
pub struct ClientActor<T: WsTransport> {
    url: String,
    config: Config,
    transport: T,
    connect_token: Option<String>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    actor_ref: WeakActorRef<Self>,
    events: broadcast::Sender<ClientEvent>,

    state: ConnectionState,
    policy: BackoffPolicy,
    attempt: ReconnectAttempt,
    reconnects: u64,
    connected_once: bool,
    next_task_id: u64,

    session: Option<ConnectionSession<T>>,
    opening: Option<(u64, JoinHandle<()>)>,
    reconnect_wait: Option<(u64, JoinHandle<()>)>,
    waiters: Vec<oneshot::Sender<ClientResult<()>>>,
    registry: SubscriptionRegistry,
    pending: HashMap<u32, PendingCommand>,
}

impl<T: WsTransport> Actor for ClientActor<T> {
    type Args = ClientActorArgs<T>;
    type Error = ClientError;

    fn name() -> &'static str {
        "ClientActor"
    }

    async fn on_start(args: Self::Args, ctx: ActorRef<Self>) -> ClientResult<Self> {
        let ClientActorArgs {
            url,
            config,
            transport,
            connect_token,
            token_provider,
            events,
        } = args;

        Ok(Self {
            policy: BackoffPolicy::new(&config.backoff),
            url,
            config,
            transport,
            connect_token,
            token_provider,
            actor_ref: ctx.downgrade(),
            events,
            state: ConnectionState::Disconnected,
            attempt: ReconnectAttempt::default(),
            reconnects: 0,
            connected_once: false,
            next_task_id: 0,
            session: None,
            opening: None,
            reconnect_wait: None,
            waiters: Vec::new(),
            registry: SubscriptionRegistry::new(),
            pending: HashMap::new(),
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> ClientResult<()> {
        self.shutdown().await;
        Ok(())
    }
}

impl<T: WsTransport> ClientActor<T> {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn next_id(&mut self) -> u64 {
        self.next_task_id += 1;
        self.next_task_id
    }

    fn status(&self) -> ClientStatus {
        ClientStatus {
            state: self.state,
            attempt: self.attempt.failed(),
            reconnects: self.reconnects,
            subscriptions: self.registry.channels(),
        }
    }

    fn resolve_waiters(&mut self, outcome: ClientResult<()>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn cancel_background(&mut self) {
        if let Some((_, task)) = self.opening.take() {
            task.abort();
        }
        if let Some((_, task)) = self.reconnect_wait.take() {
            task.abort();
        }
    }

    fn start_open(&mut self) {
        let attempt_id = self.next_id();
        let transport = self.transport.clone();
        let request = WsConnectRequest::new(self.url.clone(), &self.config.ws);
        let token = self.connect_token.clone();
        let handshake_timeout = self.config.ws.handshake_timeout;
        let actor_ref = self.actor_ref.clone();

        debug!(connection = %self.url, attempt = self.attempt.failed(), "opening session");
        let task = tokio::spawn(async move {
            let result = session::open(&transport, request, token, handshake_timeout).await;
            if let Some(actor) = actor_ref.upgrade() {
                let _ = actor.tell(OpenResult { attempt_id, result }).send().await;
            }
        });
        self.opening = Some((attempt_id, task));
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        if let Some((_, task)) = self.reconnect_wait.take() {
            task.abort();
        }
        let wait_id = self.next_id();
        let actor_ref = self.actor_ref.clone();
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(actor) = actor_ref.upgrade() {
                let _ = actor.tell(ReconnectDue { wait_id }).send().await;
            }
        });
        self.reconnect_wait = Some((wait_id, task));
    }

    fn log_reconnect_plan(&self, event: &str, note: &str, reason: &ClientError, delay: Option<Duration>) {
        let delay_ms = delay.map(|d| d.as_millis().min(u64::MAX as u128) as u64);
        warn!(
            connection = %self.url,
            event = %event,
            note = %note,
            reason = %reason,
            attempt = self.attempt.failed(),
            limit = self.policy.num_reconnect(),
            delay_ms,
            "reconnect plan"
        );
    }

    async fn on_opened(&mut self, session_id: u64, opened: OpenedSession<T>) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(actor) = actor_ref.upgrade() else {
                    break;
                };
                if actor
                    .tell(SessionNotice { session_id, event })
                    .send()
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let session = ConnectionSession::start(
            session_id,
            opened,
            SessionConfig::from(&self.config.ws),
            events_tx,
        );
        info!(
            connection = %self.url,
            session = session_id,
            client = session.client_id().unwrap_or(""),
            "connection established"
        );
        if self.connected_once {
            self.reconnects += 1;
        }
        self.connected_once = true;
        self.attempt.reset();
        self.session = Some(session);
        self.state = ConnectionState::Connected;
        self.emit(ClientEvent::Connected);
        self.resolve_waiters(Ok(()));

        for channel in self.registry.on_reconnected() {
            self.send_subscribe(channel).await;
        }
    }

    fn on_open_failed(&mut self, err: ClientError) {
        // During an open, `ClientDisconnected` means the server refused the connection and
        // forbade reconnecting.
        if !err.is_retryable() || err == ClientError::ClientDisconnected {
            self.log_reconnect_plan("open_failed", "abort", &err, None);
            self.state = ConnectionState::Disconnected;
            self.emit(ClientEvent::Error(err.clone()));
            self.resolve_waiters(Err(err));
            return;
        }

        match self.attempt.record_failure(&self.policy) {
            RetryPlan::Exhausted => {
                self.log_reconnect_plan("open_failed", "exhausted", &err, None);
                self.state = ConnectionState::Disconnected;
                self.emit(ClientEvent::Error(ClientError::ReconnectFailed));
                self.resolve_waiters(Err(ClientError::ReconnectFailed));
            }
            RetryPlan::RetryAfter(delay) => {
                self.log_reconnect_plan("open_failed", "scheduled", &err, Some(delay));
                self.emit(ClientEvent::Reconnecting {
                    attempt: self.attempt.failed(),
                    delay,
                });
                self.schedule_reconnect(delay);
            }
        }
    }

    async fn on_session_lost(&mut self, reason: DisconnectReason) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.close(reason.clone()).await;
        self.pending.clear();
        self.registry.on_disconnected();

        let error = reason.to_error();
        self.emit(ClientEvent::Disconnected {
            reason: error.clone(),
        });
        if self.state == ConnectionState::Closed {
            return;
        }

        if reason.allows_reconnect() {
            let delay = self.attempt.after_drop(&self.policy);
            self.log_reconnect_plan("session_lost", "scheduled", &error, Some(delay));
            self.state = ConnectionState::Connecting;
            self.emit(ClientEvent::Reconnecting {
                attempt: self.attempt.failed(),
                delay,
            });
            self.schedule_reconnect(delay);
        } else {
            self.log_reconnect_plan("session_lost", "abort", &error, None);
            self.state = ConnectionState::Disconnected;
            self.emit(ClientEvent::Error(error));
        }
    }

    async fn send_subscribe(&mut self, channel: String) {
        let Some(seq) = self.registry.seq(&channel) else {
            return;
        };
        if !self.config.ws.is_private_channel(&channel) {
            self.issue_subscribe(channel, seq, None).await;
            return;
        }
        let Some(session_id) = self.session.as_ref().map(ConnectionSession::id) else {
            return;
        };
        let Some(provider) = self.token_provider.clone() else {
            let err = ClientError::Token {
                channel: channel.clone(),
                message: "no token provider configured".to_string(),
            };
            self.reject_subscription(err, &channel);
            return;
        };
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            let result = provider.fetch_token(&channel).await;
            if let Some(actor) = actor_ref.upgrade() {
                let _ = actor
                    .tell(TokenFetched {
                        session_id,
                        channel,
                        seq,
                        result,
                    })
                    .send()
                    .await;
            }
        });
    }

    async fn issue_subscribe(&mut self, channel: String, seq: u64, token: Option<String>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let command = Command::Subscribe {
            channel: channel.clone(),
            token,
        };
        match session.send(&command).await {
            Ok(id) => {
                self.pending.insert(id, PendingCommand::Subscribe { channel, seq });
            }
            // The session is failing; the channel is replayed on the next connection.
            Err(err) => debug!(channel = %channel, error = %err, "subscribe request not sent"),
        }
    }

    fn reject_subscription(&mut self, err: ClientError, channel: &str) {
        warn!(channel = %channel, error = %err, "subscription failed");
        if self.registry.on_subscribe_ack(channel, Err(err.clone())) {
            self.emit(ClientEvent::Error(err));
        }
    }

    fn on_reply(&mut self, reply: Reply) {
        let Some(pending) = self.pending.remove(&reply.id) else {
            return;
        };
        let outcome = reply.into_result().map(|_| ());
        match pending {
            PendingCommand::Subscribe { channel, seq } if self.registry.seq(&channel) != Some(seq) => {
                debug!(channel = %channel, "dropping reply for a replaced subscription");
            }
            PendingCommand::Subscribe { channel, .. } => match outcome {
                Ok(()) => {
                    debug!(channel = %channel, "subscribed");
                    self.registry.on_subscribe_ack(&channel, Ok(()));
                }
                Err(err) => self.reject_subscription(err, &channel),
            },
            PendingCommand::Unsubscribe { channel } | PendingCommand::Publish { channel } => {
                if let Err(err) = outcome {
                    warn!(channel = %channel, error = %err, "command rejected by server");
                    self.emit(ClientEvent::Error(err));
                }
            }
        }
    }

    /// Tear everything down for good.
    async fn shutdown(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.cancel_background();
        if let Some(mut session) = self.session.take() {
            session.close(DisconnectReason::Closed).await;
            self.emit(ClientEvent::Disconnected {
                reason: ClientError::ClientClosed,
            });
        }
        self.pending.clear();
        self.resolve_waiters(Err(ClientError::ClientClosed));
        self.registry.clear(ClientError::ClientClosed);
        info!(connection = %self.url, "client closed");
    }
}

/// Start (or join) a connect cycle. The reply resolves once the cycle reaches a terminal
/// outcome.
#[derive(Debug, Clone, Copy)]
pub struct Connect;

impl<T: WsTransport> KameoMessage<Connect> for ClientActor<T> {
    type Reply = ClientResult<oneshot::Receiver<ClientResult<()>>>;

    async fn handle(&mut self, _msg: Connect, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let (tx, rx) = oneshot::channel();
        match self.state {
            ConnectionState::Closed => return Err(ClientError::ClientDestroyed),
            ConnectionState::Connected => {
                let _ = tx.send(Ok(()));
            }
            ConnectionState::Connecting => self.waiters.push(tx),
            ConnectionState::Disconnected => {
                self.waiters.push(tx);
                self.state = ConnectionState::Connecting;
                self.attempt.reset();
                self.start_open();
            }
        }
        Ok(rx)
    }
}

#[derive(Debug, Clone)]
pub struct Subscribe {
    pub channel: String,
}

impl<T: WsTransport> KameoMessage<Subscribe> for ClientActor<T> {
    type Reply = ClientResult<Subscription>;

    async fn handle(&mut self, msg: Subscribe, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if self.state == ConnectionState::Closed {
            return Err(ClientError::ClientDestroyed);
        }
        let subscription = self.registry.subscribe(&msg.channel)?;
        if self.state == ConnectionState::Connected {
            self.send_subscribe(msg.channel).await;
        }
        Ok(subscription)
    }
}

#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub channel: String,
}

impl<T: WsTransport> KameoMessage<Unsubscribe> for ClientActor<T> {
    type Reply = ClientResult<()>;

    async fn handle(&mut self, msg: Unsubscribe, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if self.state == ConnectionState::Closed {
            return Err(ClientError::ClientDestroyed);
        }
        if !self.registry.unsubscribe(&msg.channel) {
            return Ok(());
        }
        if let Some(session) = self.session.as_ref() {
            let command = Command::Unsubscribe {
                channel: msg.channel.clone(),
            };
            match session.send(&command).await {
                Ok(id) => {
                    self.pending.insert(id, PendingCommand::Unsubscribe { channel: msg.channel });
                }
                Err(err) => debug!(channel = %msg.channel, error = %err, "unsubscribe request not sent"),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Publish {
    pub channel: String,
    pub data: Bytes,
}

impl<T: WsTransport> KameoMessage<Publish> for ClientActor<T> {
    type Reply = ClientResult<()>;

    async fn handle(&mut self, msg: Publish, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        match self.state {
            ConnectionState::Closed => return Err(ClientError::ClientDestroyed),
            ConnectionState::Connected => {}
            _ => return Err(ClientError::ClientDisconnected),
        }
        let Some(session) = self.session.as_ref() else {
            return Err(ClientError::ClientDisconnected);
        };
        let id = session
            .send(&Command::Publish {
                channel: msg.channel.clone(),
                data: msg.data,
            })
            .await?;
        self.pending.insert(id, PendingCommand::Publish { channel: msg.channel });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Close;

impl<T: WsTransport> KameoMessage<Close> for ClientActor<T> {
    type Reply = ClientResult<()>;

    async fn handle(&mut self, _msg: Close, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.shutdown().await;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GetStatus;

impl<T: WsTransport> KameoMessage<GetStatus> for ClientActor<T> {
    type Reply = ClientResult<ClientStatus>;

    async fn handle(&mut self, _msg: GetStatus, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        Ok(self.status())
    }
}

/// Outcome of an open attempt started under `attempt_id`.
pub(crate) struct OpenResult<T: WsTransport> {
    attempt_id: u64,
    result: ClientResult<OpenedSession<T>>,
}

impl<T: WsTransport> KameoMessage<OpenResult<T>> for ClientActor<T> {
    type Reply = ();

    async fn handle(&mut self, msg: OpenResult<T>, _ctx: &mut Context<Self, Self::Reply>) {
        let current = self.opening.as_ref().map(|(id, _)| *id);
        if current != Some(msg.attempt_id) || self.state != ConnectionState::Connecting {
            debug!(attempt_id = msg.attempt_id, "dropping stale open result");
            return;
        }
        self.opening = None;
        match msg.result {
            Ok(opened) => self.on_opened(msg.attempt_id, opened).await,
            Err(err) => self.on_open_failed(err),
        }
    }
}

pub(crate) struct ReconnectDue {
    wait_id: u64,
}

impl<T: WsTransport> KameoMessage<ReconnectDue> for ClientActor<T> {
    type Reply = ();

    async fn handle(&mut self, msg: ReconnectDue, _ctx: &mut Context<Self, Self::Reply>) {
        let current = self.reconnect_wait.as_ref().map(|(id, _)| *id);
        if current != Some(msg.wait_id) || self.state != ConnectionState::Connecting {
            return;
        }
        self.reconnect_wait = None;
        self.start_open();
    }
}

pub(crate) struct SessionNotice {
    session_id: u64,
    event: SessionEvent,
}

impl<T: WsTransport> KameoMessage<SessionNotice> for ClientActor<T> {
    type Reply = ();

    async fn handle(&mut self, msg: SessionNotice, _ctx: &mut Context<Self, Self::Reply>) {
        if self.session.as_ref().map(ConnectionSession::id) != Some(msg.session_id) {
            debug!(session = msg.session_id, "dropping event from stale session");
            return;
        }
        match msg.event {
            SessionEvent::Inbound(Inbound::Reply(reply)) => self.on_reply(reply),
            SessionEvent::Inbound(Inbound::Publication { channel, data }) => {
                if !self.registry.dispatch(Publication { channel, data }) {
                    debug!("publication for unknown channel dropped");
                }
            }
            SessionEvent::Inbound(Inbound::Message(data)) => self.emit(ClientEvent::Message(data)),
            SessionEvent::Inbound(Inbound::Disconnect(advice)) => {
                self.on_session_lost(DisconnectReason::from_advice(advice)).await
            }
            SessionEvent::Disconnected(reason) => self.on_session_lost(reason).await,
        }
    }
}

pub(crate) struct TokenFetched {
    session_id: u64,
    channel: String,
    seq: u64,
    result: Result<String, String>,
}

impl<T: WsTransport> KameoMessage<TokenFetched> for ClientActor<T> {
    type Reply = ();

    async fn handle(&mut self, msg: TokenFetched, _ctx: &mut Context<Self, Self::Reply>) {
        if self.session.as_ref().map(ConnectionSession::id) != Some(msg.session_id)
            || self.registry.seq(&msg.channel) != Some(msg.seq)
        {
            return;
        }
        match msg.result {
            Ok(token) => self.issue_subscribe(msg.channel, msg.seq, Some(token)).await,
            Err(message) => {
                let err = ClientError::Token {
                    channel: msg.channel.clone(),
                    message,
                };
                self.reject_subscription(err, &msg.channel);
            }
        }
    }
}
