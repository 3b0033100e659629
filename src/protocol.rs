//! Gateway wire protocol: opcodes, the `{op, d, s, t}` envelope and close-code
//! classification.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;

/// Gateway operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// An event was dispatched (receive)
    Dispatch = 0,
    /// Keep the connection alive (send/receive)
    Heartbeat = 1,
    /// Start a new session (send)
    Identify = 2,
    /// Update the client's presence (send)
    StatusUpdate = 3,
    /// Join/leave/move between voice channels (send)
    VoiceStateUpdate = 4,
    /// Resume a previous session (send)
    Resume = 6,
    /// Server asks the client to reconnect and resume (receive)
    Reconnect = 7,
    /// Request guild member chunks (send)
    RequestGuildMembers = 8,
    /// The session has been invalidated (receive)
    InvalidSession = 9,
    /// Sent immediately after connecting, carries the heartbeat interval (receive)
    Hello = 10,
    /// Acknowledges a heartbeat (receive)
    HeartbeatAck = 11,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::StatusUpdate),
            4 => Some(Self::VoiceStateUpdate),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            8 => Some(Self::RequestGuildMembers),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "Dispatch",
            Self::Heartbeat => "Heartbeat",
            Self::Identify => "Identify",
            Self::StatusUpdate => "StatusUpdate",
            Self::VoiceStateUpdate => "VoiceStateUpdate",
            Self::Resume => "Resume",
            Self::Reconnect => "Reconnect",
            Self::RequestGuildMembers => "RequestGuildMembers",
            Self::InvalidSession => "InvalidSession",
            Self::Hello => "Hello",
            Self::HeartbeatAck => "HeartbeatAck",
        }
    }

    /// Frames that only make sense on the connection they were queued for.
    pub fn is_connection_scoped(self) -> bool {
        matches!(self, Self::Heartbeat | Self::Identify | Self::Resume)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

impl Serialize for OpCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for OpCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        OpCode::from_u8(value)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown opcode: {}", value)))
    }
}

/// A gateway frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: OpCode,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn new(op: OpCode, d: Value) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }

    pub fn dispatch(event: impl Into<String>, sequence: u64, d: Value) -> Self {
        Self {
            op: OpCode::Dispatch,
            d,
            s: Some(sequence),
            t: Some(event.into()),
        }
    }

    /// Heartbeat carrying the last sequence number seen (`null` before any dispatch).
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self::new(OpCode::Heartbeat, json!(sequence))
    }

    pub fn hello(heartbeat_interval_ms: u64) -> Self {
        Self::new(
            OpCode::Hello,
            json!({ "heartbeat_interval": heartbeat_interval_ms }),
        )
    }

    pub fn heartbeat_ack() -> Self {
        Self::new(OpCode::HeartbeatAck, Value::Null)
    }

    pub fn identify(d: Value) -> Self {
        Self::new(OpCode::Identify, d)
    }

    pub fn resume(token: &str, session_id: &str, sequence: u64) -> Self {
        Self::new(
            OpCode::Resume,
            json!({
                "token": token,
                "session_id": session_id,
                "seq": sequence,
            }),
        )
    }

    pub fn status_update(presence: Value) -> Self {
        Self::new(OpCode::StatusUpdate, presence)
    }

    pub fn voice_state_update(
        guild_id: u64,
        channel_id: Option<u64>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Self {
        Self::new(
            OpCode::VoiceStateUpdate,
            json!({
                "guild_id": guild_id.to_string(),
                "channel_id": channel_id.map(|id| id.to_string()),
                "self_mute": self_mute,
                "self_deaf": self_deaf,
            }),
        )
    }

    pub fn request_guild_members(guild_id: u64, query: &str, limit: u32) -> Self {
        Self::new(
            OpCode::RequestGuildMembers,
            json!({
                "guild_id": guild_id.to_string(),
                "query": query,
                "limit": limit,
            }),
        )
    }

    pub fn invalid_session(resumable: bool) -> Self {
        Self::new(OpCode::InvalidSession, json!(resumable))
    }

    pub fn reconnect() -> Self {
        Self::new(OpCode::Reconnect, Value::Null)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// What a shard does after its socket closed with a given code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and resume the existing session
    Resume,
    /// Reconnect with a fresh identify; the old session is gone
    Reidentify,
    /// Do not reconnect
    Fatal,
}

/// Close code sent by the client when it drops a connection it intends to resume.
pub const RESUMABLE_CLOSE_CODE: u16 = 4000;

/// Close codes that end the shard for good.
pub const FATAL_CLOSE_CODES: [u16; 6] = [4004, 4010, 4011, 4012, 4013, 4014];

/// Close codes after which the session cannot be resumed.
pub const REIDENTIFY_CLOSE_CODES: [u16; 4] = [1000, 4006, 4007, 4009];

/// Classify a close. `None` means the socket ended without a close frame.
pub fn close_action(code: Option<u16>) -> CloseAction {
    match code {
        Some(c) if FATAL_CLOSE_CODES.contains(&c) => CloseAction::Fatal,
        Some(c) if REIDENTIFY_CLOSE_CODES.contains(&c) => CloseAction::Reidentify,
        _ => CloseAction::Resume,
    }
}

/// Human-readable description of a gateway close code.
pub fn close_reason(code: u16) -> &'static str {
    match code {
        1000 => "Normal closure",
        4000 => "Unknown error",
        4001 => "Unknown opcode",
        4002 => "Decode error",
        4003 => "Not authenticated",
        4004 => "Authentication failed",
        4005 => "Already authenticated",
        4006 => "Session no longer valid",
        4007 => "Invalid sequence",
        4008 => "Rate limited",
        4009 => "Session timed out",
        4010 => "Invalid shard",
        4011 => "Sharding required",
        4012 => "Invalid API version",
        4013 => "Invalid intents",
        4014 => "Disallowed intents",
        _ => "Unknown close code",
    }
}
