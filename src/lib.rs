//! Persistent publish/subscribe websocket client.
//!
//! One long-lived connection multiplexes any number of channel subscriptions. The client
//! reconnects with exponential backoff when the connection drops and replays active
//! subscriptions on every new connection.

pub mod client;
pub mod core;
pub mod session;
pub mod subscription;
pub mod testing;
pub mod tls;
pub mod transport;

pub use client::{Client, ClientBuilder, ClientEvent, ClientStatus, ConnectionState};
pub use crate::core::{
    BackoffPolicy, BackoffReconnectConfig, ClientError, ClientResult, Config, WsConfig, WsFrame,
};
pub use subscription::{
    Publication, Subscription, SubscriptionState, SubscriptionStatus, TokenProvider,
};
pub use transport::tungstenite::TungsteniteTransport;
pub use transport::{CookieJar, WsDialer, WsTransport};
