use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, Stream, StreamExt};
use http::header::{COOKIE, HeaderValue, SET_COOKIE};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, client_async_tls_with_config,
    connect_async_tls_with_config,
    tungstenite::{
        Message as TungsteniteMessage, Utf8Bytes,
        client::IntoClientRequest,
        protocol::{CloseFrame as TungCloseFrame, WebSocketConfig},
    },
};
use tracing::debug;

use crate::core::{ClientError, ClientResult, WsCloseFrame, WsFrame};
use crate::tls::install_rustls_crypto_provider;
use crate::transport::{WsConnectRequest, WsTransport, WsTransportConnectFuture};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn close_to_core(frame: Option<TungCloseFrame>) -> Option<WsCloseFrame> {
    frame.map(|f| WsCloseFrame {
        code: u16::from(f.code),
        reason: AsRef::<Bytes>::as_ref(&f.reason).clone(),
    })
}

fn core_to_close(frame: WsCloseFrame) -> TungCloseFrame {
    let reason = match std::str::from_utf8(frame.reason.as_ref()) {
        // SAFETY: validated as UTF-8 just above.
        Ok(_) => unsafe { Utf8Bytes::from_bytes_unchecked(frame.reason) },
        Err(_) => Utf8Bytes::from_static(""),
    };
    TungCloseFrame {
        code: frame.code.into(),
        reason,
    }
}

fn msg_to_frame(msg: TungsteniteMessage) -> WsFrame {
    match msg {
        TungsteniteMessage::Text(text) => WsFrame::Text(AsRef::<Bytes>::as_ref(&text).clone()),
        TungsteniteMessage::Binary(bytes) => WsFrame::Binary(bytes),
        TungsteniteMessage::Ping(bytes) => WsFrame::Ping(bytes),
        TungsteniteMessage::Pong(bytes) => WsFrame::Pong(bytes),
        TungsteniteMessage::Close(frame) => WsFrame::Close(close_to_core(frame)),
        TungsteniteMessage::Frame(_) => WsFrame::Binary(Bytes::new()),
    }
}

fn frame_to_msg(frame: WsFrame) -> TungsteniteMessage {
    match frame {
        WsFrame::Text(bytes) => match std::str::from_utf8(bytes.as_ref()) {
            // SAFETY: validated as UTF-8 just above.
            Ok(_) => TungsteniteMessage::Text(unsafe { Utf8Bytes::from_bytes_unchecked(bytes) }),
            Err(_) => TungsteniteMessage::Binary(bytes),
        },
        WsFrame::Binary(bytes) => TungsteniteMessage::Binary(bytes),
        WsFrame::Ping(bytes) => TungsteniteMessage::Ping(bytes),
        WsFrame::Pong(bytes) => TungsteniteMessage::Pong(bytes),
        WsFrame::Close(frame) => TungsteniteMessage::Close(frame.map(core_to_close)),
    }
}

/// Default transport on top of `tokio-tungstenite` with rustls.
///
/// Honours every pass-through option of [`WsConnectRequest`]: custom headers, the cookie jar
/// (both directions), a custom TLS config and a custom TCP dialer.
#[derive(Clone, Default)]
pub struct TungsteniteTransport {
    config: Option<WebSocketConfig>,
}

impl TungsteniteTransport {
    pub fn with_websocket_config(config: WebSocketConfig) -> Self {
        Self {
            config: Some(config),
        }
    }
}

pub struct TungsteniteReader {
    inner: futures_util::stream::SplitStream<Socket>,
}

impl Stream for TungsteniteReader {
    type Item = ClientResult<WsFrame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(msg))) => Poll::Ready(Some(Ok(msg_to_frame(msg)))),
            Poll::Ready(Some(Err(err))) => {
                Poll::Ready(Some(Err(ClientError::transport("read", err))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct TungsteniteWriter {
    inner: futures_util::stream::SplitSink<Socket, TungsteniteMessage>,
}

impl Sink<WsFrame> for TungsteniteWriter {
    type Error = ClientError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_ready(cx)
            .map_err(|e| ClientError::transport("write", e))
    }

    fn start_send(mut self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        Pin::new(&mut self.inner)
            .start_send(frame_to_msg(item))
            .map_err(|e| ClientError::transport("write", e))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| ClientError::transport("write", e))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(|e| ClientError::transport("close", e))
    }
}

/// `host:port` for a websocket URI, defaulting the port from the scheme.
fn dial_address(uri: &http::Uri) -> ClientResult<String> {
    let host = uri
        .host()
        .ok_or_else(|| ClientError::transport("dial", format!("missing host in {uri}")))?;
    let port = match (uri.port_u16(), uri.scheme_str()) {
        (Some(port), _) => port,
        (None, Some("wss")) | (None, Some("https")) => 443,
        _ => 80,
    };
    Ok(format!("{host}:{port}"))
}

impl WsTransport for TungsteniteTransport {
    type Reader = TungsteniteReader;
    type Writer = TungsteniteWriter;

    fn connect(
        &self,
        request: WsConnectRequest,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let config = self.config.clone();
        Box::pin(async move {
            install_rustls_crypto_provider();

            let WsConnectRequest {
                url,
                header,
                tls,
                dialer,
                cookie_jar,
            } = request;

            let mut http_request = url
                .as_str()
                .into_client_request()
                .map_err(|e| ClientError::transport("request", e))?;
            http_request.headers_mut().extend(header);
            if let Some(cookies) = cookie_jar.as_ref().and_then(|jar| jar.cookies(&url)) {
                let value = HeaderValue::from_str(&cookies)
                    .map_err(|e| ClientError::transport("cookie", e))?;
                http_request.headers_mut().insert(COOKIE, value);
            }

            let connector = tls.map(Connector::Rustls);
            let (stream, response) = match dialer {
                Some(dial) => {
                    let address = dial_address(http_request.uri())?;
                    debug!(%address, "dialing with custom dialer");
                    let tcp = dial(address)
                        .await
                        .map_err(|e| ClientError::transport("dial", e))?;
                    client_async_tls_with_config(http_request, tcp, config, connector)
                        .await
                        .map_err(|e| ClientError::transport("connect", e))?
                }
                None => connect_async_tls_with_config(http_request, config, false, connector)
                    .await
                    .map_err(|e| ClientError::transport("connect", e))?,
            };

            if let Some(jar) = cookie_jar.as_ref() {
                let set_cookie: Vec<String> = response
                    .headers()
                    .get_all(SET_COOKIE)
                    .iter()
                    .filter_map(|value| value.to_str().ok().map(str::to_string))
                    .collect();
                if !set_cookie.is_empty() {
                    jar.set_cookies(&url, &set_cookie);
                }
            }

            let (write, read) = stream.split();
            Ok((
                TungsteniteReader { inner: read },
                TungsteniteWriter { inner: write },
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_address_defaults_port_from_scheme() {
        let uri: http::Uri = "wss://example.com/connection".parse().unwrap();
        assert_eq!(dial_address(&uri).unwrap(), "example.com:443");

        let uri: http::Uri = "ws://127.0.0.1/connection".parse().unwrap();
        assert_eq!(dial_address(&uri).unwrap(), "127.0.0.1:80");

        let uri: http::Uri = "ws://localhost:8000/connection".parse().unwrap();
        assert_eq!(dial_address(&uri).unwrap(), "localhost:8000");
    }

    #[test]
    fn close_frames_round_trip_code_and_reason() {
        let core = WsFrame::close(3005, "expired");
        match msg_to_frame(frame_to_msg(core.clone())) {
            WsFrame::Close(Some(frame)) => {
                assert_eq!(frame.code, 3005);
                assert_eq!(frame.reason_lossy(), "expired");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
