//! Minimal JSON command/reply codec.
//!
//! Outbound commands carry a per-session id; the server answers with a reply carrying the same
//! id, either `result` or `error`. Frames without an id are pushes: channel publications,
//! client-level messages, or a disconnect advice.
//!
//! ```text
//! -> {"id":2,"method":"subscribe","params":{"channel":"news"}}
//! <- {"id":2,"result":{}}
//! <- {"push":{"channel":"news","data":{"text":"hello"}}}
//! <- {"push":{"disconnect":{"code":3005,"reason":"expired","reconnect":false}}}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sonic_rs::{JsonValueTrait, Value};

use super::error::{ClientError, ClientResult};
use super::frame::WsFrame;

/// Error code on a connect reply meaning the connection token expired.
pub const ERROR_CODE_TOKEN_EXPIRED: u32 = 109;
/// Disconnect / close code meaning the connection credentials expired.
pub const DISCONNECT_CODE_EXPIRED: u32 = 3005;

/// Commands the client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { token: Option<String> },
    Subscribe { channel: String, token: Option<String> },
    Unsubscribe { channel: String },
    Publish { channel: String, data: Bytes },
    Ping,
}

impl Command {
    pub fn method(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::Publish { .. } => "publish",
            Command::Ping => "ping",
        }
    }
}

#[derive(Serialize)]
struct CommandFrame<'a> {
    id: u32,
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<CommandParams<'a>>,
}

#[derive(Serialize, Default)]
struct CommandParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// Encode `command` with request id `id` into a text frame.
///
/// Publish payloads must be valid JSON; they are embedded as-is under `params.data`.
pub fn encode_command(id: u32, command: &Command) -> ClientResult<WsFrame> {
    let params = match command {
        Command::Connect { token } => token.as_deref().map(|token| CommandParams {
            token: Some(token),
            ..Default::default()
        }),
        Command::Subscribe { channel, token } => Some(CommandParams {
            channel: Some(channel),
            token: token.as_deref(),
            ..Default::default()
        }),
        Command::Unsubscribe { channel } => Some(CommandParams {
            channel: Some(channel),
            ..Default::default()
        }),
        Command::Publish { channel, data } => {
            let data: Value = sonic_rs::from_slice(data.as_ref()).map_err(|err| {
                ClientError::Protocol(format!("publish data is not valid JSON: {err}"))
            })?;
            Some(CommandParams {
                channel: Some(channel),
                data: Some(data),
                ..Default::default()
            })
        }
        Command::Ping => None,
    };

    let frame = CommandFrame {
        id,
        method: command.method(),
        params,
    };
    let bytes = sonic_rs::to_vec(&frame)
        .map_err(|err| ClientError::Protocol(format!("encode {}: {err}", command.method())))?;
    Ok(WsFrame::Text(Bytes::from(bytes)))
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(default)]
    id: Option<u32>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ReplyError>,
    #[serde(default)]
    push: Option<PushBody>,
}

#[derive(Deserialize)]
struct PushBody {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    disconnect: Option<ServerDisconnect>,
}

/// Error body attached to a reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplyError {
    pub code: u32,
    #[serde(default)]
    pub message: String,
}

impl From<ReplyError> for ClientError {
    fn from(err: ReplyError) -> Self {
        ClientError::Server {
            code: err.code,
            message: err.message,
        }
    }
}

/// Server-initiated disconnect advice.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerDisconnect {
    pub code: u32,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
}

fn default_reconnect() -> bool {
    true
}

impl ServerDisconnect {
    pub fn is_expired(&self) -> bool {
        self.code == DISCONNECT_CODE_EXPIRED
    }

    pub fn allows_reconnect(&self) -> bool {
        self.reconnect && code_allows_reconnect(self.code)
    }
}

/// Close / disconnect codes in 3500..=3999 forbid automatic reconnects.
#[inline]
pub fn code_allows_reconnect(code: u32) -> bool {
    !(3500..=3999).contains(&code)
}

/// Reply to a command previously sent with `id`.
#[derive(Debug, Clone)]
pub struct Reply {
    pub id: u32,
    pub outcome: Result<Option<Value>, ReplyError>,
}

impl Reply {
    pub fn into_result(self) -> ClientResult<Option<Value>> {
        self.outcome.map_err(ClientError::from)
    }
}

/// Decoded inbound data frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    Reply(Reply),
    Publication { channel: String, data: Bytes },
    Message(Bytes),
    Disconnect(ServerDisconnect),
}

/// Decode a data frame. Control frames and frames carrying nothing actionable yield `None`.
pub fn decode_frame(frame: &WsFrame) -> ClientResult<Option<Inbound>> {
    let Some(bytes) = frame.data() else {
        return Ok(None);
    };
    let inbound: InboundFrame = sonic_rs::from_slice(bytes)
        .map_err(|err| ClientError::Protocol(format!("decode inbound frame: {err}")))?;

    if let Some(id) = inbound.id.filter(|id| *id != 0) {
        let outcome = match inbound.error {
            Some(err) => Err(err),
            None => Ok(inbound.result),
        };
        return Ok(Some(Inbound::Reply(Reply { id, outcome })));
    }

    let Some(push) = inbound.push else {
        return Ok(None);
    };
    if let Some(disconnect) = push.disconnect {
        return Ok(Some(Inbound::Disconnect(disconnect)));
    }
    let data = match push.data {
        Some(value) => value_bytes(&value)?,
        None => Bytes::new(),
    };
    Ok(Some(match push.channel {
        Some(channel) => Inbound::Publication { channel, data },
        None => Inbound::Message(data),
    }))
}

fn value_bytes(value: &Value) -> ClientResult<Bytes> {
    sonic_rs::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| ClientError::Protocol(format!("re-encode push data: {err}")))
}

/// Client id assigned by the server in the connect reply, when present.
pub fn connect_client_id(result: Option<&Value>) -> Option<String> {
    result?.get("client")?.as_str().map(str::to_string)
}
