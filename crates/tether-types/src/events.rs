use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::models::{MessageRecord, SessionRecord};

/// Payloads received over the sync socket, after decryption.
///
/// Tags and field names are snake_case on the wire. Unknown tags fail to
/// decode; the caller drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncUpdateEnvelope {
    /// Full session record changed
    Session { session: SessionRecord },

    /// New or edited message
    Message { message: MessageRecord },

    /// Server keepalive; answered with a plaintext pong
    Ping,

    /// Answer to our keepalive ping
    Pong,

    /// Server echo of a subscription
    Subscribe { session_id: String },

    /// Server echo of an unsubscription
    Unsubscribe { session_id: String },

    /// Batched change, either half may be absent
    Update {
        session: Option<SessionRecord>,
        message: Option<MessageRecord>,
    },

    /// The peer's revival circuit breaker tripped
    SessionRevivalPaused(RevivalPaused),

    /// The peer replaced a dead session with a fresh one
    SessionRevived(SessionRevived),

    /// The peer gave up reviving a session
    SessionRevivalFailed { session_id: String, reason: String },
}

impl SyncUpdateEnvelope {
    /// Decode a decrypted payload.
    ///
    /// Tagged envelopes are tried first. Payloads without a `type` field fall
    /// back to the legacy bare shapes: a raw session record, then a raw
    /// message record.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;

        if value.get("type").is_some() {
            return Self::deserialize(value);
        }

        if let Ok(session) = SessionRecord::deserialize(&value) {
            return Ok(Self::Session { session });
        }
        if let Ok(message) = MessageRecord::deserialize(&value) {
            return Ok(Self::Message { message });
        }

        Err(serde_json::Error::custom(
            "payload is neither a tagged envelope nor a legacy record",
        ))
    }

    /// Wire name of this envelope's tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Session { .. } => "session",
            Self::Message { .. } => "message",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Update { .. } => "update",
            Self::SessionRevivalPaused(_) => "session_revival_paused",
            Self::SessionRevived(_) => "session_revived",
            Self::SessionRevivalFailed { .. } => "session_revival_failed",
        }
    }
}

/// Circuit breaker cooldown announced by the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevivalPaused {
    pub reason: String,
    pub remaining_ms: u64,
    /// Unix milliseconds at which automatic revival resumes.
    pub resumes_at: i64,
    pub machine_id: String,
}

impl RevivalPaused {
    pub fn resumes_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.resumes_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRevived {
    pub original_session_id: String,
    pub new_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
}

/// Control messages sent FROM client TO server. Always plaintext JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping,
    Pong,
    Subscribe { session_id: String },
    Unsubscribe { session_id: String },
}

impl ControlMessage {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Connection lifecycle as observed by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the backoff before reconnection attempt `n` (1-based).
    Reconnecting(u32),
}

impl SyncConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for SyncConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting(attempt) => write!(f, "reconnecting (attempt {})", attempt),
        }
    }
}
