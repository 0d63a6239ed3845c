use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pubsub_ws::{Client, Config, CookieJar, SubscriptionState, TungsteniteTransport};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum ServerEvent {
    Upgrade { cookie: Option<String> },
    Command(String),
}

/// Minimal pub/sub server: answers every command with an empty result and publishes one
/// message into each channel right after acknowledging its subscription.
async fn spawn_server() -> (SocketAddr, mpsc::UnboundedReceiver<ServerEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let upgrade_tx = tx.clone();
                let callback = move |request: &Request, mut response: Response| {
                    let cookie = request
                        .headers()
                        .get(http::header::COOKIE)
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    let _ = upgrade_tx.send(ServerEvent::Upgrade { cookie });
                    response.headers_mut().append(
                        http::header::SET_COOKIE,
                        http::HeaderValue::from_static("session=fresh"),
                    );
                    Ok(response)
                };
                let mut ws = accept_hdr_async(stream, callback).await.unwrap();

                while let Some(Ok(message)) = ws.next().await {
                    let WsMessage::Text(text) = message else {
                        continue;
                    };
                    let text = text.as_str().to_string();
                    let _ = tx.send(ServerEvent::Command(text.clone()));
                    let value: sonic_rs::Value = sonic_rs::from_str(&text).unwrap();
                    let id = sonic_rs::JsonValueTrait::as_u64(&value["id"]).unwrap();
                    let method = sonic_rs::JsonValueTrait::as_str(&value["method"])
                        .unwrap()
                        .to_string();
                    let reply = if method == "connect" {
                        format!(r#"{{"id":{id},"result":{{"client":"loopback"}}}}"#)
                    } else {
                        format!(r#"{{"id":{id},"result":{{}}}}"#)
                    };
                    if ws.send(WsMessage::text(reply)).await.is_err() {
                        break;
                    }
                    if method == "subscribe" {
                        let channel = sonic_rs::JsonValueTrait::as_str(&value["params"]["channel"])
                            .unwrap()
                            .to_string();
                        let push = format!(r#"{{"push":{{"channel":"{channel}","data":{{"hello":true}}}}}}"#);
                        if ws.send(WsMessage::text(push)).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });

    (addr, rx)
}

#[derive(Default)]
struct MemoryJar {
    cookie: Mutex<Option<String>>,
    stored: Mutex<Vec<String>>,
}

impl CookieJar for MemoryJar {
    fn cookies(&self, _url: &str) -> Option<String> {
        self.cookie.lock().unwrap().clone()
    }

    fn set_cookies(&self, _url: &str, set_cookie: &[String]) {
        self.stored.lock().unwrap().extend_from_slice(set_cookie);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn default_transport_round_trips_against_a_real_server() {
    let (addr, mut server_events) = spawn_server().await;
    let jar = Arc::new(MemoryJar::default());
    *jar.cookie.lock().unwrap() = Some("session=old".to_string());

    let config = Config::default().with_cookie_jar(jar.clone());
    let client = Client::new(
        format!("ws://{addr}/connection"),
        config,
        TungsteniteTransport::default(),
    )
    .expect("client");

    let mut sub = client.subscribe("news").await.expect("subscribe");
    tokio::time::timeout(WAIT, client.connect())
        .await
        .expect("connect in time")
        .expect("connect");

    tokio::time::timeout(WAIT, sub.wait_subscribed())
        .await
        .expect("ack in time")
        .expect("subscribed");
    assert_eq!(sub.state(), SubscriptionState::Subscribed);

    let publication = tokio::time::timeout(WAIT, sub.next_publication())
        .await
        .expect("publication in time")
        .expect("publication");
    assert_eq!(publication.data.as_ref(), br#"{"hello":true}"#);

    client
        .publish("news", r#"{"text":"hi"}"#)
        .await
        .expect("publish");

    let mut saw_cookie = false;
    let mut saw_publish = false;
    while !(saw_cookie && saw_publish) {
        let event = tokio::time::timeout(WAIT, server_events.recv())
            .await
            .expect("server event in time")
            .expect("server event");
        match event {
            ServerEvent::Upgrade { cookie } => {
                assert_eq!(cookie.as_deref(), Some("session=old"));
                saw_cookie = true;
            }
            ServerEvent::Command(text) if text.contains(r#""method":"publish""#) => {
                assert!(text.contains(r#""data":{"text":"hi"}"#));
                saw_publish = true;
            }
            ServerEvent::Command(_) => {}
        }
    }
    assert_eq!(*jar.stored.lock().unwrap(), vec!["session=fresh".to_string()]);

    client.close().await.expect("close");
}
