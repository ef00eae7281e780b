use std::fmt;

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Result, TetherError};
use crate::secret::SharedSecret;

type HmacSha256 = Hmac<Sha256>;

/// Wire name of the broadcast address.
pub const BROADCAST: &str = "*";

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    Agent(String),
    Broadcast,
}

impl Recipient {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            BROADCAST | "broadcast" => Self::Broadcast,
            id => Self::Agent(id.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Agent(id) => id,
            Self::Broadcast => BROADCAST,
        }
    }

    /// Whether a message to this recipient is visible to `agent_id`.
    pub fn includes(&self, agent_id: &str) -> bool {
        match self {
            Self::Agent(id) => id == agent_id,
            Self::Broadcast => true,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Recipient {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Recipient {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Question,
    Answer,
    Status,
    LockNotice,
    Ack,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Question => "question",
            Self::Answer => "answer",
            Self::Status => "status",
            Self::LockNotice => "lock_notice",
            Self::Ack => "ack",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signed, immutable entry in the message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub recipient: Recipient,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub signature: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ack_requested: bool,
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockAction {
    Acquired,
    Released,
    Broken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AnswerBody {
    in_reply_to: String,
    text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockNoticeBody {
    resource: String,
    action: LockAction,
}

/// Structured view of a message body. Each type has one fixed schema;
/// free-text kinds carry the content verbatim, structured kinds carry JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Question(String),
    Answer { in_reply_to: String, text: String },
    Status(String),
    LockNotice { resource: String, action: LockAction },
    Ack { message_id: String },
}

impl Payload {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Text(_) => MessageType::Text,
            Self::Question(_) => MessageType::Question,
            Self::Answer { .. } => MessageType::Answer,
            Self::Status(_) => MessageType::Status,
            Self::LockNotice { .. } => MessageType::LockNotice,
            Self::Ack { .. } => MessageType::Ack,
        }
    }

    /// Render to the opaque content string stored in the log.
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            Self::Text(text) | Self::Question(text) | Self::Status(text) => text.clone(),
            Self::Answer { in_reply_to, text } => serde_json::to_string(&AnswerBody {
                in_reply_to: in_reply_to.clone(),
                text: text.clone(),
            })?,
            Self::LockNotice { resource, action } => serde_json::to_string(&LockNoticeBody {
                resource: resource.clone(),
                action: *action,
            })?,
            Self::Ack { message_id } => message_id.clone(),
        })
    }

    pub fn decode(kind: MessageType, content: &str) -> Result<Self> {
        let invalid = |e: serde_json::Error| {
            TetherError::InvalidContent(format!("{kind} payload does not match its schema: {e}"))
        };
        Ok(match kind {
            MessageType::Text => Self::Text(content.into()),
            MessageType::Question => Self::Question(content.into()),
            MessageType::Status => Self::Status(content.into()),
            MessageType::Answer => {
                let body: AnswerBody = serde_json::from_str(content).map_err(invalid)?;
                Self::Answer {
                    in_reply_to: body.in_reply_to,
                    text: body.text,
                }
            }
            MessageType::LockNotice => {
                let body: LockNoticeBody = serde_json::from_str(content).map_err(invalid)?;
                Self::LockNotice {
                    resource: body.resource,
                    action: body.action,
                }
            }
            MessageType::Ack => Self::Ack {
                message_id: content.trim().into(),
            },
        })
    }
}

impl Message {
    pub fn payload(&self) -> Result<Payload> {
        Payload::decode(self.kind, &self.content)
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Canonical timestamp text used in the signed bytes.
fn signed_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn signing_input(message: &Message) -> Vec<u8> {
    let timestamp = signed_timestamp(&message.timestamp);
    let fields: [&[u8]; 6] = [
        message.id.as_bytes(),
        message.sender_id.as_bytes(),
        message.recipient.as_str().as_bytes(),
        message.kind.as_str().as_bytes(),
        message.content.as_bytes(),
        timestamp.as_bytes(),
    ];
    // Length-prefix every field so no shift of bytes between fields can
    // produce the same input.
    let mut input = Vec::new();
    for field in fields {
        input.extend_from_slice(&(field.len() as u64).to_be_bytes());
        input.extend_from_slice(field);
    }
    input
}

fn mac(secret: &SharedSecret, message: &Message) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(&signing_input(message));
    mac
}

/// Hex HMAC-SHA256 over the message's identifying fields.
pub fn sign(secret: &SharedSecret, message: &Message) -> String {
    hex::encode(mac(secret, message).finalize().into_bytes())
}

/// Recompute the signature and compare in constant time.
///
/// Signed timestamps carry microseconds only, so any sub-microsecond digits
/// mean the stored timestamp was edited after signing.
pub fn verify(secret: &SharedSecret, message: &Message) -> bool {
    if message.timestamp.nanosecond() % 1_000 != 0 {
        return false;
    }
    let Ok(provided) = hex::decode(&message.signature) else {
        return false;
    };
    let expected = mac(secret, message).finalize().into_bytes();
    expected.as_slice().ct_eq(provided.as_slice()).into()
}

/// Truncate to microseconds so the stored timestamp re-signs identically.
pub(crate) fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&signed_timestamp(&ts))
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(ts)
}
