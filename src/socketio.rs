//! Socket.IO v4 packets over an Engine.IO v4 WebSocket transport.
//!
//! Only the default namespace and the packet kinds the speech relay uses are
//! supported; binary attachments and acknowledgements are not.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("empty frame")]
    Empty,

    #[error("unknown packet type '{0}'")]
    UnknownType(char),

    #[error("invalid packet json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid event packet: {0}")]
    InvalidEvent(String),
}

/// Engine.IO open packet body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Noop,
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, payload: Value },
    ConnectError(Value),
}

impl Packet {
    pub fn event(name: &str, payload: impl Serialize) -> Result<Self, PacketError> {
        Ok(Self::Event {
            name: name.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn decode(frame: &str) -> Result<Self, PacketError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let rest = chars.as_str();

        match kind {
            '0' => Ok(Self::Open(serde_json::from_str(rest)?)),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping),
            '3' => Ok(Self::Pong),
            '6' => Ok(Self::Noop),
            '4' => decode_message(rest),
            other => Err(PacketError::UnknownType(other)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Open(handshake) => {
                format!("0{}", serde_json::to_string(handshake).unwrap_or_default())
            }
            Self::Close => "1".to_string(),
            Self::Ping => "2".to_string(),
            Self::Pong => "3".to_string(),
            Self::Noop => "6".to_string(),
            Self::Connect(None) => "40".to_string(),
            Self::Connect(Some(data)) => format!("40{data}"),
            Self::Disconnect => "41".to_string(),
            Self::Event { name, payload } => {
                let body = Value::Array(vec![Value::String(name.clone()), payload.clone()]);
                format!("42{body}")
            }
            Self::ConnectError(data) => format!("44{data}"),
        }
    }
}

fn decode_message(body: &str) -> Result<Packet, PacketError> {
    let mut chars = body.chars();
    let kind = chars.next().ok_or(PacketError::Empty)?;
    let rest = strip_namespace(chars.as_str());

    match kind {
        '0' if rest.is_empty() => Ok(Packet::Connect(None)),
        '0' => Ok(Packet::Connect(Some(serde_json::from_str(rest)?))),
        '1' => Ok(Packet::Disconnect),
        '2' => {
            // Skip an ack id, if the server asked for one.
            let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            let mut items: Vec<Value> = serde_json::from_str(rest)?;
            if items.is_empty() {
                return Err(PacketError::InvalidEvent("missing event name".to_string()));
            }
            let name = match items.remove(0) {
                Value::String(name) => name,
                other => return Err(PacketError::InvalidEvent(format!("event name {other}"))),
            };
            let payload = if items.is_empty() {
                Value::Null
            } else {
                items.remove(0)
            };
            Ok(Packet::Event { name, payload })
        }
        '4' => Ok(Packet::ConnectError(serde_json::from_str(rest)?)),
        other => Err(PacketError::UnknownType(other)),
    }
}

fn strip_namespace(rest: &str) -> &str {
    if rest.starts_with('/') {
        match rest.find(',') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        }
    } else {
        rest
    }
}

/// Maps a relay base URL to its Engine.IO WebSocket endpoint.
///
/// Only the origin is used. A path on the base URL names a Socket.IO
/// namespace, not a transport path, so it is dropped.
pub fn socket_url(base: &str) -> String {
    let (scheme, rest) = match base.split_once("://") {
        Some(("https" | "wss", rest)) => ("wss", rest),
        Some((_, rest)) => ("ws", rest),
        None => ("ws", base),
    };
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    format!("{scheme}://{host}/socket.io/?EIO=4&transport=websocket")
}
