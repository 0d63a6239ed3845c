//! Connects to a pub/sub server, subscribes to the given channels and logs what arrives.
//!
//! ```text
//! cargo run --example subscribe -- [--url <ws-url>] [--token <jwt>] [channel ...]
//! ```

use std::time::Duration;

use pubsub_ws::{Client, ClientBuilder, ClientEvent, Config, TungsteniteTransport};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_URL: &str = "ws://127.0.0.1:8000/connection/websocket";

struct Args {
    url: String,
    token: Option<String>,
    channels: Vec<String>,
}

fn parse_args() -> Args {
    let mut args = Args {
        url: DEFAULT_URL.to_string(),
        token: None,
        channels: Vec::new(),
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--url" => args.url = it.next().unwrap_or_else(|| DEFAULT_URL.to_string()),
            "--token" => args.token = it.next(),
            _ => args.channels.push(arg),
        }
    }
    if args.channels.is_empty() {
        args.channels.push("news".to_string());
    }
    args
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args();
    let mut builder = ClientBuilder::new(args.url, TungsteniteTransport::default())
        .config(Config::default().with_ping_interval(Duration::from_secs(10)));
    if let Some(token) = args.token {
        builder = builder.connect_token(token);
    }
    let client: Client = builder.build()?;

    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::Error(err) => warn!(error = %err, "client error"),
                other => info!(event = ?other, "client event"),
            }
        }
    });

    for channel in &args.channels {
        let mut sub = client.subscribe(channel.as_str()).await?;
        tokio::spawn(async move {
            while let Some(publication) = sub.next_publication().await {
                info!(
                    channel = %publication.channel,
                    data = %String::from_utf8_lossy(&publication.data),
                    "publication"
                );
            }
        });
    }

    client.connect().await?;
    info!("connected; press ctrl-c to exit");
    tokio::signal::ctrl_c().await?;
    client.close().await?;
    Ok(())
}
