use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Routing key for a connected user (their email address).
pub type Identity = String;

/// Default WebSocket path the relay is served on.
pub const RELAY_PATH: &str = "/api/p2p";

/// Client-to-relay frames sent as JSON text messages.
///
/// `data` payloads are forwarded opaquely; the relay only reads the few
/// correlation fields it needs for acknowledgments.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Register { user_id: String, user_email: Identity },
    Email {
        from: Identity,
        to: Identity,
        data: Value,
    },
    FileChunk {
        from: Identity,
        to: Identity,
        data: Value,
    },
    FileComplete {
        from: Identity,
        to: Identity,
        data: Value,
    },
}

impl ClientFrame {
    /// Wire name of the frame's `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Register { .. } => "register",
            ClientFrame::Email { .. } => "email",
            ClientFrame::FileChunk { .. } => "file-chunk",
            ClientFrame::FileComplete { .. } => "file-complete",
        }
    }

    /// Decode a text frame, rejecting registrations with an empty identity.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let frame: ClientFrame = serde_json::from_str(text)?;
        if let ClientFrame::Register { user_email, .. } = &frame {
            if user_email.trim().is_empty() {
                return Err(serde::de::Error::custom("userEmail must not be empty"));
            }
        }
        Ok(frame)
    }
}

/// Relay-to-client frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    PeersList {
        peers: Vec<PeerSummary>,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    PeerOnline {
        user_id: String,
        email: Identity,
        timestamp: u64,
    },
    PeerOffline {
        email: Identity,
        timestamp: u64,
    },
    Email {
        from: Identity,
        data: Value,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    EmailDelivered {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email_id: Option<Value>,
        timestamp: u64,
    },
    FileChunk {
        from: Identity,
        data: Value,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    ChunkReceived {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email_id: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_index: Option<Value>,
        timestamp: u64,
    },
    FileComplete {
        from: Identity,
        data: Value,
        timestamp: u64,
    },
    Error {
        code: ErrorCode,
        message: String,
        timestamp: u64,
    },
}

impl ServerFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Another connected user, as listed in `peers-list`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub email: Identity,
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// The frame could not be decoded.
    InvalidFrame,
    /// A routed frame arrived before `register`.
    NotRegistered,
    /// A newer connection registered the same identity.
    Superseded,
}

/// Look up a string-keyed field in an opaque payload.
pub fn data_field(data: &Value, key: &str) -> Option<Value> {
    data.get(key).filter(|v| !v.is_null()).cloned()
}

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
