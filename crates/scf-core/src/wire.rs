use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
pub const PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub msg: Msg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Msg {
    Register(RegisterPayload),
    Welcome(WelcomePayload),
    Command(CommandPayload),
    Response(crate::response::CommandResponse),
    Heartbeat(HeartbeatPayload),
    Event(EventPayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterPayload {
    pub identity: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WelcomePayload {
    pub peer_id: u64,
    pub server_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandPayload {
    pub command: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatPayload {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventPayload {
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl Envelope {
    pub fn new(id: impl Into<String>, msg: Msg) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now().to_rfc3339(),
            msg,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.msg {
            Msg::Register(_) => "register",
            Msg::Welcome(_) => "welcome",
            Msg::Command(_) => "command",
            Msg::Response(_) => "response",
            Msg::Heartbeat(_) => "heartbeat",
            Msg::Event(_) => "event",
            Msg::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("invalid envelope: {0}")]
    Invalid(&'static str),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::Oversized {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(raw: &[u8], max_frame_bytes: usize) -> Result<T, FrameError> {
    if raw.len() > max_frame_bytes {
        return Err(FrameError::Oversized {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

pub fn decode_envelope(raw: &[u8], max_frame_bytes: usize) -> Result<Envelope, FrameError> {
    let envelope: Envelope = decode_frame(raw, max_frame_bytes)?;
    validate_envelope(&envelope)?;
    Ok(envelope)
}

pub fn validate_envelope(envelope: &Envelope) -> Result<(), FrameError> {
    if envelope.id.is_empty() {
        return Err(FrameError::Invalid("missing_id"));
    }
    if envelope.timestamp.is_empty() {
        return Err(FrameError::Invalid("missing_timestamp"));
    }
    if chrono::DateTime::parse_from_rfc3339(&envelope.timestamp).is_err() {
        return Err(FrameError::Invalid("invalid_timestamp"));
    }
    Ok(())
}
