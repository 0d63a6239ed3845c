use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pubsub_ws::testing::{MockConnection, MockServer, MockTransport};
use pubsub_ws::{BackoffReconnectConfig, Client, ClientBuilder, ClientError, Config, SubscriptionState};

const WAIT: Duration = Duration::from_secs(2);

fn config() -> Config {
    Config::default().with_backoff(BackoffReconnectConfig {
        num_reconnect: 0,
        factor: 2.0,
        jitter: false,
        min_milliseconds: 10,
        max_milliseconds: 50,
    })
}

async fn connected(client: &Client<MockTransport>, server: &mut MockServer) -> MockConnection {
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    let mut conn = server.next_connection(WAIT).await.expect("connection");
    conn.accept_handshake(WAIT).await.expect("handshake");
    connecting.await.expect("join").expect("connect");
    conn
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn private_channel_subscribes_with_fetched_token_on_every_connection() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let (transport, mut server) = MockTransport::channel_pair();
    let client = {
        let fetches = fetches.clone();
        ClientBuilder::new("ws://mock/connection", transport)
            .config(config())
            .token_provider(move |channel: String| {
                let n = fetches.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, String>(format!("{channel}-token-{n}")) }
            })
            .build()
            .expect("client")
    };

    let mut conn = connected(&client, &mut server).await;
    let mut sub = client.subscribe("$account").await.expect("subscribe");
    let command = conn.recv_method("subscribe", WAIT).await.expect("subscribe command");
    assert_eq!(command.channel.as_deref(), Some("$account"));
    assert_eq!(command.token.as_deref(), Some("$account-token-0"));
    conn.reply_ok(command.id).unwrap();
    sub.wait_subscribed().await.expect("subscribed");

    conn.drop_socket();
    let mut conn = server.next_connection(WAIT).await.expect("reconnection");
    conn.accept_handshake(WAIT).await.expect("handshake");
    let command = conn.recv_method("subscribe", WAIT).await.expect("replayed subscribe");
    assert_eq!(command.token.as_deref(), Some("$account-token-1"));
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn public_channels_skip_the_token_provider() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let (transport, mut server) = MockTransport::channel_pair();
    let client = {
        let fetches = fetches.clone();
        ClientBuilder::new("ws://mock/connection", transport)
            .config(config())
            .token_provider(move |_channel: String| {
                fetches.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, String>("unused".to_string()) }
            })
            .build()
            .expect("client")
    };

    let mut conn = connected(&client, &mut server).await;
    client.subscribe("news").await.expect("subscribe");
    let command = conn.recv_method("subscribe", WAIT).await.expect("subscribe command");
    assert_eq!(command.token, None);
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_failure_is_a_subscription_error_not_a_client_error() {
    let (transport, mut server) = MockTransport::channel_pair();
    let client = ClientBuilder::new("ws://mock/connection", transport)
        .config(config())
        .token_provider(|_channel: String| async move { Err::<String, _>("auth backend down".to_string()) })
        .build()
        .expect("client");

    let mut conn = connected(&client, &mut server).await;
    let mut sub = client.subscribe("$account").await.expect("subscribe");
    let err = sub.wait_subscribed().await.unwrap_err();
    assert_eq!(
        err,
        ClientError::Token {
            channel: "$account".to_string(),
            message: "auth backend down".to_string(),
        }
    );
    assert_eq!(sub.state(), SubscriptionState::Error);
    assert!(
        conn.recv_method("subscribe", Duration::from_millis(200))
            .await
            .is_none()
    );

    client.publish("news", "{}").await.expect("client stays usable");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn private_channel_without_provider_fails_the_subscription() {
    let (transport, mut server) = MockTransport::channel_pair();
    let client = Client::new("ws://mock/connection", config(), transport).expect("client");
    let _conn = connected(&client, &mut server).await;

    let mut sub = client.subscribe("$account").await.expect("subscribe");
    assert!(matches!(
        sub.wait_subscribed().await,
        Err(ClientError::Token { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_private_prefix_is_honoured() {
    let mut cfg = config();
    cfg.ws.private_channel_prefix = "private:".to_string();
    let (transport, mut server) = MockTransport::channel_pair();
    let client = ClientBuilder::new("ws://mock/connection", transport)
        .config(cfg)
        .token_provider(|_channel: String| async move { Ok::<_, String>("tok".to_string()) })
        .build()
        .expect("client");

    let mut conn = connected(&client, &mut server).await;
    client.subscribe("$not-private").await.expect("subscribe");
    client.subscribe("private:feed").await.expect("subscribe");

    let first = conn.recv_method("subscribe", WAIT).await.expect("first");
    assert_eq!(first.channel.as_deref(), Some("$not-private"));
    assert_eq!(first.token, None);
    let second = conn.recv_method("subscribe", WAIT).await.expect("second");
    assert_eq!(second.channel.as_deref(), Some("private:feed"));
    assert_eq!(second.token.as_deref(), Some("tok"));
}
