//! Line-framed text protocol spoken by the collaboration service.
//!
//! Wire format (one WebSocket text message per frame):
//! ```text
//! ┌──────┬───┬──────────┬───┬──────────┬───┬───────────────────┐
//! │ code │ : │ id [+]   │ : │ endpoint │ : │ data              │
//! │ 0-7  │   │ optional │   │ unused   │   │ JSON, or for code │
//! │      │   │          │   │          │   │ 6: ackId[+]JSON   │
//! └──────┴───┴──────────┴───┴──────────┴───┴───────────────────┘
//!
//!   2::                       heartbeat
//!   5:::{"name":...}          push event, no reply expected
//!   5:3+::{"name":...}        command #3, reply expected
//!   6:::3+[null, ...]         reply to command #3
//! ```
//!
//! Command and event names are mapped onto closed enums so every dispatch
//! site is checked for exhaustiveness at compile time.

use otsync_core::{DocId, Operation, WireOp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::presence::CursorUpdate;

/// Frame type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameCode {
    /// Peer closed the connection
    Disconnect = 0,
    /// Handshake acknowledgment
    Connect = 1,
    /// Keep-alive
    Heartbeat = 2,
    /// Event: server push, or a client command expecting a reply
    Event = 5,
    /// Reply correlated to a command by sequence id
    Ack = 6,
    /// Session invalid / unauthorized
    Error = 7,
}

impl FrameCode {
    fn from_digit(digit: &str) -> Option<Self> {
        match digit {
            "0" => Some(Self::Disconnect),
            "1" => Some(Self::Connect),
            "2" => Some(Self::Heartbeat),
            "5" => Some(Self::Event),
            "6" => Some(Self::Ack),
            "7" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A parsed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub code: FrameCode,
    /// Message id in the second field (set on commands we send).
    pub message_id: Option<u64>,
    /// Sequence id this frame replies to (code 6 only).
    pub ack_id: Option<u64>,
    /// Decoded JSON data. Unparseable JSON becomes `{"name":"error"}`.
    pub data: Option<Value>,
    /// The data field as received.
    pub raw: String,
}

impl Frame {
    /// Parse one frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut fields = text.splitn(4, ':');
        let code_field = fields.next().unwrap_or_default();
        let code = FrameCode::from_digit(code_field)
            .ok_or_else(|| ProtocolError::UnknownCode(text.to_string()))?;
        let id_field = fields
            .next()
            .ok_or_else(|| ProtocolError::Malformed(text.to_string()))?;
        let _endpoint = fields.next();
        let raw = fields.next().unwrap_or_default().to_string();

        let message_id = parse_id(id_field.trim_end_matches('+'))
            .map_err(|_| ProtocolError::Malformed(text.to_string()))?;

        let (ack_id, json_text) = if code == FrameCode::Ack {
            let digits = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
            let ack_id = parse_id(&raw[..digits])
                .map_err(|_| ProtocolError::Malformed(text.to_string()))?;
            let rest = raw[digits..].strip_prefix('+').unwrap_or(&raw[digits..]);
            (ack_id, rest)
        } else {
            (None, raw.as_str())
        };

        let data = if json_text.is_empty() {
            None
        } else {
            Some(serde_json::from_str(json_text).unwrap_or_else(|e| {
                log::warn!("unparseable frame payload ({e}): {json_text}");
                json!({ "name": "error" })
            }))
        };

        Ok(Self {
            code,
            message_id,
            ack_id,
            data,
            raw,
        })
    }
}

fn parse_id(digits: &str) -> Result<Option<u64>, std::num::ParseIntError> {
    if digits.is_empty() {
        Ok(None)
    } else {
        digits.parse().map(Some)
    }
}

/// `2::`
pub fn encode_heartbeat() -> String {
    "2::".to_string()
}

/// `5:::<json>`: fire-and-forget event.
pub fn encode_event(payload: &Value) -> String {
    format!("5:::{payload}")
}

/// `5:<id>+::<json>`: command expecting a reply.
pub fn encode_command(seq_id: u64, payload: &Value) -> String {
    format!("5:{seq_id}+::{payload}")
}

// ───────────────────────────────────────────────────────────────────
// Commands (client → server)
// ───────────────────────────────────────────────────────────────────

/// Body of an `applyOtUpdate` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub doc: DocId,
    pub op: Vec<Operation>,
    pub v: u64,
    #[serde(rename = "lastV")]
    pub last_v: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl UpdatePayload {
    pub fn new(doc: impl Into<DocId>, op: Vec<Operation>, version: u64) -> Self {
        Self {
            doc: doc.into(),
            op,
            v: version,
            last_v: version as i64 - 1,
            hash: None,
        }
    }
}

/// Every command the client can issue.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    JoinProject { project_id: String },
    JoinDoc { doc_id: DocId },
    LeaveDoc { doc_id: DocId },
    ApplyOtUpdate { doc_id: DocId, update: UpdatePayload },
    GetConnectedUsers,
    UpdatePosition { doc_id: DocId, row: u32, column: u32 },
}

impl Command {
    /// Event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinProject { .. } => "joinProject",
            Self::JoinDoc { .. } => "joinDoc",
            Self::LeaveDoc { .. } => "leaveDoc",
            Self::ApplyOtUpdate { .. } => "applyOtUpdate",
            Self::GetConnectedUsers => "clientTracking.getConnectedUsers",
            Self::UpdatePosition { .. } => "clientTracking.updatePosition",
        }
    }

    /// Document this command targets, if any.
    pub fn doc_id(&self) -> Option<&str> {
        match self {
            Self::JoinDoc { doc_id }
            | Self::LeaveDoc { doc_id }
            | Self::ApplyOtUpdate { doc_id, .. }
            | Self::UpdatePosition { doc_id, .. } => Some(doc_id),
            Self::JoinProject { .. } | Self::GetConnectedUsers => None,
        }
    }

    fn args(&self) -> Value {
        match self {
            Self::JoinProject { project_id } => json!([{ "project_id": project_id }]),
            Self::JoinDoc { doc_id } => json!([doc_id, { "encodeRanges": true }]),
            Self::LeaveDoc { doc_id } => json!([doc_id]),
            Self::ApplyOtUpdate { doc_id, update } => json!([doc_id, update]),
            Self::GetConnectedUsers => json!([]),
            Self::UpdatePosition {
                doc_id,
                row,
                column,
            } => json!([{ "doc_id": doc_id, "row": row, "column": column }]),
        }
    }

    /// `{"name": ..., "args": [...]}`
    pub fn to_payload(&self) -> Value {
        json!({ "name": self.name(), "args": self.args() })
    }
}

// ───────────────────────────────────────────────────────────────────
// Server pushes
// ───────────────────────────────────────────────────────────────────

/// A remote edit delivered by `otUpdateApplied`.
///
/// Without `op` it only advances the version (the echo of our own update).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteUpdate {
    pub doc: DocId,
    #[serde(default)]
    pub op: Option<Vec<WireOp>>,
    #[serde(default)]
    pub v: Option<u64>,
}

/// Every push event the client understands.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ConnectionAccepted,
    ClientUpdated(Vec<CursorUpdate>),
    ClientDisconnected(Vec<String>),
    OtUpdateApplied(Vec<RemoteUpdate>),
    OtUpdateError(String),
    BroadcastDocMeta,
    /// Payload that could not be decoded.
    Error,
    Unknown(String),
}

#[derive(Deserialize)]
struct RawEvent {
    name: String,
    #[serde(default)]
    args: Value,
}

impl ServerEvent {
    pub fn from_value(data: Value) -> Result<Self, ProtocolError> {
        let raw: RawEvent = serde_json::from_value(data)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        let name = raw.name;
        let args = if raw.args.is_null() { json!([]) } else { raw.args };

        Ok(match name.as_str() {
            "connectionAccepted" => Self::ConnectionAccepted,
            "clientTracking.clientUpdated" => Self::ClientUpdated(decode_args(&name, args)?),
            "clientTracking.clientDisconnected" => {
                Self::ClientDisconnected(decode_args(&name, args)?)
            }
            "otUpdateApplied" => Self::OtUpdateApplied(decode_args(&name, args)?),
            "otUpdateError" => Self::OtUpdateError(
                args.get(0)
                    .map(|reason| match reason.as_str() {
                        Some(text) => text.to_string(),
                        None => reason.to_string(),
                    })
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
            "broadcastDocMeta" => Self::BroadcastDocMeta,
            "error" => Self::Error,
            other => Self::Unknown(other.to_string()),
        })
    }
}

fn decode_args<T: DeserializeOwned>(name: &str, args: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(args)
        .map_err(|e| ProtocolError::DeserializationError(format!("{name}: {e}")))
}

/// Split a reply `[err, result...]` into its error and results.
pub fn split_reply(data: Option<Value>) -> Result<Vec<Value>, String> {
    let mut items = match data {
        Some(Value::Array(items)) => items,
        Some(other) => vec![Value::Null, other],
        None => Vec::new(),
    };
    if items.is_empty() {
        return Ok(items);
    }
    match items.remove(0) {
        Value::Null => Ok(items),
        Value::String(message) => Err(message),
        Value::Object(obj) => Err(obj
            .get("message")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| Value::Object(obj).to_string())),
        other => Err(other.to_string()),
    }
}

/// Undo the transport's byte→text mapping of document lines.
///
/// Lines arrive as UTF-8 bytes presented one byte per char. A line that
/// does not re-decode as UTF-8 is kept as received.
pub fn decode_transport_line(line: &str) -> String {
    let bytes: Option<Vec<u8>> = line.chars().map(|c| u8::try_from(c).ok()).collect();
    bytes
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| line.to_string())
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    UnknownCode(String),
    Malformed(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownCode(frame) => write!(f, "Unknown code: {frame}"),
            Self::Malformed(frame) => write!(f, "Malformed frame: {frame}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
