//! Wire protocol for the field gateway: the closed `MessageType` set, the
//! `Message` envelope, payload constructors for outbound messages, and the
//! newline-delimited JSON line codec.
//!
//! No I/O and no threads live here — this crate is pure data and parsing,
//! the way a shared wire-types crate sits underneath a service crate.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// The closed set of message types the gateway understands. Unknown type
/// strings fail to deserialize rather than being accepted as an open enum —
/// the dispatch table downstream is a closed match over this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "HELLO")]
    Hello,
    #[serde(rename = "HELLO_ACK")]
    HelloAck,
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "GET_STATUS")]
    GetStatus,
    #[serde(rename = "STATUS")]
    Status,
    #[serde(rename = "START_JOB")]
    StartJob,
    #[serde(rename = "STOP_JOB")]
    StopJob,
    #[serde(rename = "ACK")]
    Ack,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "REBOOT")]
    Reboot,
    #[serde(rename = "GNSS_FIX")]
    GnssFix,
    #[serde(rename = "GNSS_ACK")]
    GnssAck,
    #[serde(rename = "NTRIP_CORRECTION")]
    NtripCorrection,
    #[serde(rename = "NTRIP_CORRECTION_ACK")]
    NtripCorrectionAck,
}

impl MessageType {
    /// The literal wire string for this variant, as it appears in the
    /// `type` field of an envelope.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::HelloAck => "HELLO_ACK",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::Info => "INFO",
            MessageType::GetStatus => "GET_STATUS",
            MessageType::Status => "STATUS",
            MessageType::StartJob => "START_JOB",
            MessageType::StopJob => "STOP_JOB",
            MessageType::Ack => "ACK",
            MessageType::Error => "ERROR",
            MessageType::Update => "UPDATE",
            MessageType::Reboot => "REBOOT",
            MessageType::GnssFix => "GNSS_FIX",
            MessageType::GnssAck => "GNSS_ACK",
            MessageType::NtripCorrection => "NTRIP_CORRECTION",
            MessageType::NtripCorrectionAck => "NTRIP_CORRECTION_ACK",
        }
    }
}

/// One wire message: a type tag plus a JSON object payload.
///
/// `payload` defaults to an empty object when absent on the wire but must
/// be a JSON object when present — enforced in [`LineCodec::decode`] rather
/// than at the type level, since serde has no "object or absent" shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default = "empty_payload")]
    pub payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

impl Message {
    pub fn new(message_type: MessageType, payload: Value) -> Self {
        Self {
            message_type,
            payload,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{0}")]
    Malformed(String),
}

/// Newline-delimited JSON codec: one document per line, UTF-8, no framing
/// beyond the `\n` terminator.
pub struct LineCodec;

impl LineCodec {
    /// Decode a single line (without its trailing `\n`) into a [`Message`].
    /// Callers should skip empty lines before calling this — an empty line
    /// is not a protocol error, it simply carries no message.
    pub fn decode(line: &str) -> Result<Message, CodecError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| CodecError::Malformed(e.to_string()))?;

        let Value::Object(ref obj) = value else {
            return Err(CodecError::Malformed("frame is not a JSON object".into()));
        };
        if let Some(payload) = obj.get("payload") {
            if !payload.is_object() {
                return Err(CodecError::Malformed("payload must be an object".into()));
            }
        }

        serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    /// Encode a [`Message`] as a single `\n`-terminated JSON line.
    pub fn encode(message: &Message) -> String {
        format!(
            "{}\n",
            serde_json::to_string(message).expect("Message always serializes")
        )
    }
}

// ── Outbound payload constructors ──────────────────────────────────────────
//
// Mirrors the builder-function shape of the original protocol module: one
// small function per outbound message type, each returning a ready-to-send
// [`Message`].

pub fn error_message(reason: &str, code: Option<&str>, details: Option<Value>) -> Message {
    let mut payload = Map::new();
    payload.insert("reason".into(), json!(reason));
    if let Some(code) = code {
        payload.insert("code".into(), json!(code));
    }
    if let Some(details) = details {
        payload.insert("details".into(), details);
    }
    Message::new(MessageType::Error, Value::Object(payload))
}

pub fn hello_ack(version: &str, capabilities: &[&str]) -> Message {
    Message::new(
        MessageType::HelloAck,
        json!({ "version": version, "capabilities": capabilities }),
    )
}

pub fn pong_message() -> Message {
    Message::new(MessageType::Pong, empty_payload())
}

pub fn info_message(version: &str, uptime_s: u64, implement: Option<Value>) -> Message {
    let mut payload = Map::new();
    payload.insert("version".into(), json!(version));
    payload.insert("uptime_s".into(), json!(uptime_s));
    if let Some(implement) = implement {
        payload.insert("implement".into(), implement);
    }
    Message::new(MessageType::Info, Value::Object(payload))
}

pub fn status_message(job_running: bool) -> Message {
    Message::new(MessageType::Status, json!({ "job_running": job_running }))
}

pub fn ack_message(action: &str) -> Message {
    Message::new(MessageType::Ack, json!({ "action": action }))
}

#[allow(clippy::too_many_arguments)]
pub fn gnss_fix_message(
    latitude: f64,
    longitude: f64,
    altitude: f64,
    accuracy: Option<f64>,
    sequence: u64,
    timestamp: f64,
    heading_deg: Option<f64>,
    speed_mps: Option<f64>,
    rtk_state: Option<&str>,
    implement: Option<Value>,
) -> Message {
    let mut payload = Map::new();
    payload.insert("latitude".into(), json!(latitude));
    payload.insert("longitude".into(), json!(longitude));
    payload.insert("altitude".into(), json!(altitude));
    if let Some(accuracy) = accuracy {
        payload.insert("accuracy".into(), json!(accuracy));
    }
    payload.insert("sequence".into(), json!(sequence));
    payload.insert("timestamp".into(), json!(timestamp));
    if let Some(heading_deg) = heading_deg {
        payload.insert("heading_deg".into(), json!(heading_deg));
    }
    if let Some(speed_mps) = speed_mps {
        payload.insert("speed_mps".into(), json!(speed_mps));
    }
    if let Some(rtk_state) = rtk_state {
        payload.insert("rtk_state".into(), json!(rtk_state));
    }
    if let Some(implement) = implement {
        payload.insert("implement".into(), implement);
    }
    Message::new(MessageType::GnssFix, Value::Object(payload))
}

pub fn ntrip_correction_ack_message(sequence: i64, status: &str, timestamp: Option<f64>) -> Message {
    let mut payload = Map::new();
    payload.insert("sequence".into(), json!(sequence));
    payload.insert("status".into(), json!(status));
    if let Some(timestamp) = timestamp {
        payload.insert("timestamp".into(), json!(timestamp));
    }
    Message::new(MessageType::NtripCorrectionAck, Value::Object(payload))
}
