//! Gateway wire format.

use crate::config::IdentifyConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Gateway operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Application event (in)
    Dispatch,
    /// Heartbeat request (in) / heartbeat (out)
    Heartbeat,
    /// Start a new session (out)
    Identify,
    /// Update presence (out)
    PresenceUpdate,
    /// Join/leave/move voice channels (out)
    VoiceStateUpdate,
    /// Reattach to a previous session (out)
    Resume,
    /// Server asks the client to reconnect (in)
    Reconnect,
    /// Request guild member chunks (out)
    RequestGuildMembers,
    /// Session is invalid; payload says whether it can be resumed (in)
    InvalidSession,
    /// First frame after connecting, carries the heartbeat interval (in)
    Hello,
    /// Heartbeat acknowledged (in)
    HeartbeatAck,
    /// Anything this client does not know
    Unknown(u8),
}

impl Opcode {
    /// Numeric opcode
    pub fn code(self) -> u8 {
        match self {
            Opcode::Dispatch => 0,
            Opcode::Heartbeat => 1,
            Opcode::Identify => 2,
            Opcode::PresenceUpdate => 3,
            Opcode::VoiceStateUpdate => 4,
            Opcode::Resume => 6,
            Opcode::Reconnect => 7,
            Opcode::RequestGuildMembers => 8,
            Opcode::InvalidSession => 9,
            Opcode::Hello => 10,
            Opcode::HeartbeatAck => 11,
            Opcode::Unknown(code) => code,
        }
    }
}

impl From<u8> for Opcode {
    fn from(code: u8) -> Self {
        match code {
            0 => Opcode::Dispatch,
            1 => Opcode::Heartbeat,
            2 => Opcode::Identify,
            3 => Opcode::PresenceUpdate,
            4 => Opcode::VoiceStateUpdate,
            6 => Opcode::Resume,
            7 => Opcode::Reconnect,
            8 => Opcode::RequestGuildMembers,
            9 => Opcode::InvalidSession,
            10 => Opcode::Hello,
            11 => Opcode::HeartbeatAck,
            other => Opcode::Unknown(other),
        }
    }
}

/// One structured gateway message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayFrame {
    /// Operation code
    pub op: u8,
    /// Payload
    #[serde(default)]
    pub d: Value,
    /// Sequence number (dispatch only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// Event name (dispatch only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayFrame {
    /// Build an outbound frame
    pub fn new(op: Opcode, d: Value) -> Self {
        Self {
            op: op.code(),
            d,
            s: None,
            t: None,
        }
    }

    /// Parse a complete message
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Decoded opcode
    pub fn opcode(&self) -> Opcode {
        Opcode::from(self.op)
    }

    /// Serialize to message text
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Heartbeat payload: last sequence if any was seen, otherwise null.
pub fn heartbeat(last_sequence: u64) -> GatewayFrame {
    let d = if last_sequence > 0 {
        json!(last_sequence)
    } else {
        Value::Null
    };
    GatewayFrame::new(Opcode::Heartbeat, d)
}

/// Identify payload for shard `[shard_id, shard_count]`.
pub fn identify(token: &str, config: &IdentifyConfig, shard_id: u32, shard_count: u32) -> GatewayFrame {
    GatewayFrame::new(
        Opcode::Identify,
        json!({
            "token": token,
            "properties": {
                "os": config.properties.os,
                "browser": config.properties.browser,
                "device": config.properties.device,
            },
            "compress": false,
            "large_threshold": config.large_threshold,
            "shard": [shard_id, shard_count],
            "intents": config.intents,
        }),
    )
}

/// Resume payload
pub fn resume(token: &str, session_id: &str, last_sequence: u64) -> GatewayFrame {
    GatewayFrame::new(
        Opcode::Resume,
        json!({
            "token": token,
            "session_id": session_id,
            "seq": last_sequence,
        }),
    )
}

/// Heartbeat interval carried by Hello, in milliseconds
pub fn hello_interval(frame: &GatewayFrame) -> Option<u64> {
    frame.d.get("heartbeat_interval").and_then(Value::as_u64)
}

/// Session fields carried by the `READY` dispatch
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReadyInfo {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// Name of the dispatch that completes identify
pub const READY_EVENT: &str = "READY";
/// Name of the dispatch that completes resume
pub const RESUMED_EVENT: &str = "RESUMED";

/// What a close code asks the client to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and resume the session
    Resume,
    /// Reconnect with a fresh session
    Reidentify,
    /// Token was rejected; never reconnect
    AuthenticationFailed,
    /// Configuration was rejected; never reconnect
    Fatal,
}

/// Classify a close code received from the gateway.
pub fn classify_close(code: u16) -> CloseAction {
    match code {
        4004 => CloseAction::AuthenticationFailed,
        4010..=4014 => CloseAction::Fatal,
        4007 | 4009 => CloseAction::Reidentify,
        _ => CloseAction::Resume,
    }
}

/// Append version and encoding query parameters to a gateway endpoint.
pub fn normalize_gateway_url(base: &str, api_version: u8) -> String {
    match url::Url::parse(base) {
        Ok(mut url) => {
            let keep: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| k != "v" && k != "encoding")
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            {
                let mut query = url.query_pairs_mut();
                query.clear();
                for (k, v) in &keep {
                    query.append_pair(k, v);
                }
                query
                    .append_pair("v", &api_version.to_string())
                    .append_pair("encoding", "json");
            }
            url.to_string()
        }
        Err(_) => base.to_string(),
    }
}

/// A decoded event handed from a shard to the dispatcher.
///
/// The shard keeps no reference after sending it.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub shard_id: u32,
    pub opcode: Opcode,
    pub sequence: Option<u64>,
    pub event_name: Option<String>,
    pub payload: Value,
}

impl EventEnvelope {
    /// Take ownership of a frame's contents
    pub fn from_frame(shard_id: u32, frame: GatewayFrame) -> Self {
        Self {
            shard_id,
            opcode: Opcode::from(frame.op),
            sequence: frame.s,
            event_name: frame.t,
            payload: frame.d,
        }
    }
}
