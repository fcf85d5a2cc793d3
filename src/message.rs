// Wire model shared by every peer: one JSON object per line.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Result;

/// Milliseconds since the Unix epoch, the clock every timestamp on the wire uses.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// What a node knows about another node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub last_seen: i64,
}

impl PeerInfo {
    /// `lastSeen` never moves backwards.
    pub fn touch(&mut self, now: i64) {
        self.last_seen = self.last_seen.max(now);
    }

    /// `host:port`, the way peers are shown to humans.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Hello,
    Chat,
    PeerShare,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Hello => "HELLO",
            MessageKind::Chat => "CHAT",
            MessageKind::PeerShare => "PEERSHARE",
        }
    }

    fn from_wire(tag: &str) -> Option<Self> {
        match tag {
            "HELLO" => Some(MessageKind::Hello),
            "CHAT" => Some(MessageKind::Chat),
            "PEERSHARE" => Some(MessageKind::PeerShare),
            _ => None,
        }
    }
}

/// The kind-specific part of a message. The `type` field on the wire picks the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageBody {
    #[serde(rename = "HELLO")]
    Hello {
        /// Listening port the sender advertises. Informational only.
        #[serde(default)]
        port: u16,
        #[serde(default)]
        peers: Vec<PeerInfo>,
    },
    #[serde(rename = "CHAT")]
    Chat {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "PEERSHARE")]
    PeerShare {
        #[serde(default)]
        peers: Vec<PeerInfo>,
    },
}

/// An immutable envelope. Ids and timestamps are minted by the constructors only,
/// relays forward what they received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    id: String,
    from_id: String,
    #[serde(default)]
    from_name: String,
    #[serde(default)]
    timestamp: i64,
    #[serde(flatten)]
    body: MessageBody,
}

impl Message {
    fn new(from_id: &str, from_name: &str, body: MessageBody) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from_id: from_id.to_string(),
            from_name: from_name.to_string(),
            timestamp: now_millis(),
            body,
        }
    }

    pub fn chat(from_id: &str, from_name: &str, text: &str) -> Self {
        Self::new(from_id, from_name, MessageBody::Chat { text: text.to_string() })
    }

    pub fn hello(from_id: &str, from_name: &str, port: u16, peers: Vec<PeerInfo>) -> Self {
        Self::new(from_id, from_name, MessageBody::Hello { port, peers })
    }

    pub fn peer_share(from_id: &str, from_name: &str, peers: Vec<PeerInfo>) -> Self {
        Self::new(from_id, from_name, MessageBody::PeerShare { peers })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn from_id(&self) -> &str {
        &self.from_id
    }

    pub fn from_name(&self) -> &str {
        &self.from_name
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn kind(&self) -> MessageKind {
        match self.body {
            MessageBody::Hello { .. } => MessageKind::Hello,
            MessageBody::Chat { .. } => MessageKind::Chat,
            MessageBody::PeerShare { .. } => MessageKind::PeerShare,
        }
    }

    /// Chat text, `None` for control messages.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Chat { text } => Some(text),
            _ => None,
        }
    }

    /// Peer list carried by HELLO and PEERSHARE, empty for CHAT.
    pub fn peers(&self) -> &[PeerInfo] {
        match &self.body {
            MessageBody::Hello { peers, .. } | MessageBody::PeerShare { peers } => peers,
            MessageBody::Chat { .. } => &[],
        }
    }

    /// Serialize to a single JSON line, without the trailing newline.
    pub fn to_line(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Parse one received line.
///
/// - `Ok(Some(_))` for a HELLO, CHAT or PEERSHARE
/// - `Ok(None)` for blank lines and unknown `type`s, which peers are free to send
/// - `Err(_)` when the line is not a JSON object or a known kind is missing fields
pub fn decode_line(line: &str) -> Result<Option<Message>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let value: JsonValue = serde_json::from_str(line)?;
    if !value.is_object() {
        return Err(<serde_json::Error as serde::de::Error>::custom(
            "expected a JSON object",
        )
        .into());
    }

    let known = value
        .get("type")
        .and_then(JsonValue::as_str)
        .and_then(MessageKind::from_wire)
        .is_some();
    if !known {
        return Ok(None);
    }

    Ok(Some(serde_json::from_value(value)?))
}
