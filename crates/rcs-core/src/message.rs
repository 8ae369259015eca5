//! Protocol messages.
//!
//! [`Message`] is the typed view applications and the broker work with. On the
//! wire every message is one flat JSON object carrying an integer `type` tag;
//! that shape only exists inside this module as `RawMessage`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Integer tag identifying the kind of a message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Head = 0,
    Broadcast = 1,
    Push = 2,
    Get = 3,
    ServerReturn = 4,
    ClientReturn = 5,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Head => "HEAD",
            Self::Broadcast => "BROADCAST",
            Self::Push => "PUSH",
            Self::Get => "GET",
            Self::ServerReturn => "SERVER_RET",
            Self::ClientReturn => "CLIENT_RET",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i64> for MessageKind {
    type Error = ProtocolError;

    fn try_from(tag: i64) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => Self::Head,
            1 => Self::Broadcast,
            2 => Self::Push,
            3 => Self::Get,
            4 => Self::ServerReturn,
            5 => Self::ClientReturn,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

/// A protocol message.
///
/// The `peer` field of `Push`, `Get` and `ClientReturn` is directional: a peer
/// sets it to the target it addresses, and the broker rewrites it to the
/// originating peer before forwarding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub enum Message {
    /// Handshake: the sender declares its name.
    Head { name: String },
    /// Fire-and-forget broadcast. `from` is only present once the broker
    /// has stamped the sender.
    Broadcast {
        from: Option<String>,
        name: String,
        payload: Value,
    },
    /// Remote write of a named variable.
    Push {
        peer: String,
        var: String,
        value: Value,
    },
    /// Remote read of a named variable.
    Get { peer: String, var: String },
    /// Result or error produced by the broker.
    ServerReturn { payload: Value },
    /// Result or error produced by a peer.
    ClientReturn { peer: String, payload: Value },
}

impl Message {
    pub fn head(name: impl Into<String>) -> Self {
        Self::Head { name: name.into() }
    }

    pub fn broadcast(name: impl Into<String>, payload: Value) -> Self {
        Self::Broadcast {
            from: None,
            name: name.into(),
            payload,
        }
    }

    pub fn push(peer: impl Into<String>, var: impl Into<String>, value: Value) -> Self {
        Self::Push {
            peer: peer.into(),
            var: var.into(),
            value,
        }
    }

    pub fn get(peer: impl Into<String>, var: impl Into<String>) -> Self {
        Self::Get {
            peer: peer.into(),
            var: var.into(),
        }
    }

    pub fn server_return(payload: Value) -> Self {
        Self::ServerReturn { payload }
    }

    pub fn client_return(peer: impl Into<String>, payload: Value) -> Self {
        Self::ClientReturn {
            peer: peer.into(),
            payload,
        }
    }

    /// The wire tag of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Head { .. } => MessageKind::Head,
            Self::Broadcast { .. } => MessageKind::Broadcast,
            Self::Push { .. } => MessageKind::Push,
            Self::Get { .. } => MessageKind::Get,
            Self::ServerReturn { .. } => MessageKind::ServerReturn,
            Self::ClientReturn { .. } => MessageKind::ClientReturn,
        }
    }
}

/// Broker error text for a request that names an unregistered peer.
pub fn unknown_peer_error(name: &str) -> String {
    format!("not find client '{name}'")
}

/// The peer name inside an [`unknown_peer_error`] text.
pub fn unknown_peer_name(text: &str) -> Option<&str> {
    text.strip_prefix("not find client '")?.strip_suffix('\'')
}

/// Flat wire object. Key names match the deployed protocol.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(rename = "bordcastName", skip_serializing_if = "Option::is_none")]
    broadcast_name: Option<String>,
    #[serde(rename = "bordcast", skip_serializing_if = "Option::is_none")]
    broadcast: Option<Value>,
    #[serde(rename = "from_sendTo", skip_serializing_if = "Option::is_none")]
    peer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    var: Option<String>,
    #[serde(rename = "val", skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(rename = "ret", skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
}

impl TryFrom<RawMessage> for Message {
    type Error = ProtocolError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let kind = MessageKind::try_from(raw.kind)?;
        let required = |value: Option<String>, field: &'static str| {
            value.ok_or(ProtocolError::MissingField { kind, field })
        };

        Ok(match kind {
            MessageKind::Head => Self::Head {
                name: required(raw.name, "name")?,
            },
            MessageKind::Broadcast => Self::Broadcast {
                from: raw.from,
                name: required(raw.broadcast_name, "bordcastName")?,
                payload: raw.broadcast.unwrap_or_default(),
            },
            MessageKind::Push => Self::Push {
                peer: required(raw.peer, "from_sendTo")?,
                var: required(raw.var, "var")?,
                value: raw.value.unwrap_or_default(),
            },
            MessageKind::Get => Self::Get {
                peer: required(raw.peer, "from_sendTo")?,
                var: required(raw.var, "var")?,
            },
            MessageKind::ServerReturn => Self::ServerReturn {
                payload: raw.result.unwrap_or_default(),
            },
            MessageKind::ClientReturn => Self::ClientReturn {
                peer: required(raw.peer, "from_sendTo")?,
                payload: raw.result.unwrap_or_default(),
            },
        })
    }
}

impl From<Message> for RawMessage {
    fn from(msg: Message) -> Self {
        let kind = msg.kind() as i64;
        match msg {
            Message::Head { name } => Self {
                kind,
                name: Some(name),
                ..Default::default()
            },
            Message::Broadcast {
                from,
                name,
                payload,
            } => Self {
                kind,
                from,
                broadcast_name: Some(name),
                broadcast: Some(payload),
                ..Default::default()
            },
            Message::Push { peer, var, value } => Self {
                kind,
                peer: Some(peer),
                var: Some(var),
                value: Some(value),
                ..Default::default()
            },
            Message::Get { peer, var } => Self {
                kind,
                peer: Some(peer),
                var: Some(var),
                ..Default::default()
            },
            Message::ServerReturn { payload } => Self {
                kind,
                result: Some(payload),
                ..Default::default()
            },
            Message::ClientReturn { peer, payload } => Self {
                kind,
                peer: Some(peer),
                result: Some(payload),
                ..Default::default()
            },
        }
    }
}

/// Error interpreting a decoded JSON object as a [`Message`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownKind(i64),
    #[error("{kind} message is missing field '{field}'")]
    MissingField {
        kind: MessageKind,
        field: &'static str,
    },
}
