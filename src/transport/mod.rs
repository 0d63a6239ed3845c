use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Sink, Stream};
use http::HeaderMap;
use tokio::net::TcpStream;

use crate::core::{ClientResult, WsConfig, WsFrame};

pub mod tungstenite;

/// Custom TCP dialer: receives `host:port` and returns a connected stream.
pub type WsDialer = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>
        + Send
        + Sync,
>;

/// Cookie storage consulted before dialing and updated from the upgrade response.
pub trait CookieJar: Send + Sync + 'static {
    /// Value for the `Cookie` request header, if any cookies apply to `url`.
    fn cookies(&self, url: &str) -> Option<String>;

    /// Store the `Set-Cookie` values received for `url`.
    fn set_cookies(&self, url: &str, set_cookie: &[String]);
}

/// Everything a transport needs to open one connection.
#[derive(Clone)]
pub struct WsConnectRequest {
    pub url: String,
    pub header: HeaderMap,
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub dialer: Option<WsDialer>,
    pub cookie_jar: Option<Arc<dyn CookieJar>>,
}

impl WsConnectRequest {
    pub fn new(url: impl Into<String>, cfg: &WsConfig) -> Self {
        Self {
            url: url.into(),
            header: cfg.header.clone(),
            tls: cfg.tls.clone(),
            dialer: cfg.dialer.clone(),
            cookie_jar: cfg.cookie_jar.clone(),
        }
    }
}

pub type WsTransportConnectFuture<R, W> = Pin<Box<dyn Future<Output = ClientResult<(R, W)>> + Send>>;

/// Transport boundary for websocket IO.
///
/// `connect` dials and upgrades; the returned reader/writer pair are the receive and send
/// primitives, and dropping/closing them closes the connection. Implementations report
/// failures as [`crate::core::ClientError::Transport`] so raw library errors never travel
/// past the session.
///
/// Kept minimal so test doubles or different socket libraries can be swapped in without
/// touching the connection state machine.
pub trait WsTransport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = ClientResult<WsFrame>> + Send + Unpin + 'static;
    type Writer: Sink<WsFrame, Error = crate::core::ClientError> + Send + Sync + Unpin + 'static;

    fn connect(&self, request: WsConnectRequest)
    -> WsTransportConnectFuture<Self::Reader, Self::Writer>;
}
