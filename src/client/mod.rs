//! Public client handle and the orchestrator actor behind it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef};
use tokio::sync::broadcast;

use crate::core::{ClientError, ClientResult, Config};
use crate::subscription::{Subscription, TokenProvider};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

mod actor;

pub use actor::{ClientActor, ClientActorArgs, Close, Connect, GetStatus, Publish, Subscribe, Unsubscribe};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Lifecycle notifications, delivered through [`Client::events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected { reason: ClientError },
    /// A new open is scheduled after `delay`. `attempt` counts consecutive failed opens.
    Reconnecting { attempt: u32, delay: Duration },
    Error(ClientError),
    /// Server push not bound to a channel.
    Message(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub state: ConnectionState,
    /// Consecutive failed opens in the current connect cycle.
    pub attempt: u32,
    /// Successful reconnections since the first connection.
    pub reconnects: u64,
    /// Subscribed channels in subscribe order.
    pub subscriptions: Vec<String>,
}

fn map_send_error<M>(err: SendError<M, ClientError>) -> ClientError {
    match err {
        SendError::HandlerError(err) => err,
        _ => ClientError::ClientDestroyed,
    }
}

/// Handle to a persistent pub/sub connection.
///
/// Cloning is cheap; all clones drive the same actor. Must be created inside a tokio runtime.
pub struct Client<T: WsTransport = TungsteniteTransport> {
    actor: ActorRef<ClientActor<T>>,
    events: broadcast::Sender<ClientEvent>,
}

impl<T: WsTransport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
            events: self.events.clone(),
        }
    }
}

impl<T: WsTransport> Client<T> {
    pub fn new(url: impl Into<String>, config: Config, transport: T) -> ClientResult<Self> {
        ClientBuilder::new(url, transport).config(config).build()
    }

    /// Connect, or join the connect cycle already in progress.
    ///
    /// Resolves once connected; fails with [`ClientError::ReconnectFailed`] when the attempt
    /// budget runs out, with the terminal error when the server forbids reconnecting, and with
    /// [`ClientError::ClientClosed`] when the client is closed meanwhile. Dropping the future
    /// only abandons the wait; the cycle keeps running until [`Client::close`].
    pub async fn connect(&self) -> ClientResult<()> {
        let outcome = self.actor.ask(Connect).await.map_err(map_send_error)?;
        outcome.await.map_err(|_| ClientError::ClientDestroyed)?
    }

    /// Register `channel`. Works while disconnected; the request is sent once connected and
    /// replayed after every reconnect.
    pub async fn subscribe(&self, channel: impl Into<String>) -> ClientResult<Subscription> {
        self.actor
            .ask(Subscribe {
                channel: channel.into(),
            })
            .await
            .map_err(map_send_error)
    }

    /// Remove `channel`. Unknown channels are ignored.
    pub async fn unsubscribe(&self, channel: impl Into<String>) -> ClientResult<()> {
        self.actor
            .ask(Unsubscribe {
                channel: channel.into(),
            })
            .await
            .map_err(map_send_error)
    }

    /// Publish JSON `data` into `channel`. Requires a live connection.
    pub async fn publish(&self, channel: impl Into<String>, data: impl Into<Bytes>) -> ClientResult<()> {
        self.actor
            .ask(Publish {
                channel: channel.into(),
                data: data.into(),
            })
            .await
            .map_err(map_send_error)
    }

    /// Close for good. Safe to call repeatedly; later calls to anything else fail with
    /// [`ClientError::ClientDestroyed`].
    pub async fn close(&self) -> ClientResult<()> {
        self.actor.ask(Close).await.map_err(map_send_error)
    }

    pub async fn status(&self) -> ClientResult<ClientStatus> {
        self.actor.ask(GetStatus).await.map_err(map_send_error)
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

/// Builder for [`Client`] with the optional collaborators.
pub struct ClientBuilder<T: WsTransport> {
    url: String,
    transport: T,
    config: Config,
    connect_token: Option<String>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    event_capacity: usize,
}

impl<T: WsTransport> ClientBuilder<T> {
    pub fn new(url: impl Into<String>, transport: T) -> Self {
        Self {
            url: url.into(),
            transport,
            config: Config::default(),
            connect_token: None,
            token_provider: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Token sent with the connect command.
    pub fn connect_token(mut self, token: impl Into<String>) -> Self {
        self.connect_token = Some(token.into());
        self
    }

    /// Token source for channels starting with the private channel prefix.
    pub fn token_provider(mut self, provider: impl TokenProvider) -> Self {
        self.token_provider = Some(Arc::new(provider));
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> ClientResult<Client<T>> {
        self.config.validate()?;
        let (events, _) = broadcast::channel(self.event_capacity);
        let actor = ClientActor::spawn(ClientActorArgs {
            url: self.url,
            config: self.config,
            transport: self.transport,
            connect_token: self.connect_token,
            token_provider: self.token_provider,
            events: events.clone(),
        });
        Ok(Client { actor, events })
    }
}
