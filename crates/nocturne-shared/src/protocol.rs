//! Channel-0 control documents.
//!
//! Control messages are UTF-8 JSON with a `type` discriminator so either
//! side can skip message kinds it does not understand yet.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::ContentHash;
use crate::error::NocturneError;
use crate::types::{ConversationId, FileId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlMessage {
    Message(ChatMessage),
    UserInfo(UserInfo),
    Avatar(Avatar),
    Ack(Ack),
    IncomingFile(IncomingFile),
    AcceptFile(AcceptFile),
    RejectFile(RejectFile),
    AbortFile(AbortFile),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub conversation: ConversationId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserInfo {
    pub nickname: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_hash: Option<ContentHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Avatar {
    /// base64url, no padding
    pub image_b64: String,
    pub hash: ContentHash,
}

impl Avatar {
    pub fn from_bytes(image: &[u8]) -> Self {
        Self {
            image_b64: URL_SAFE_NO_PAD.encode(image),
            hash: ContentHash(*blake3::hash(image).as_bytes()),
        }
    }

    pub fn image_bytes(&self) -> Result<Vec<u8>, NocturneError> {
        URL_SAFE_NO_PAD
            .decode(&self.image_b64)
            .map_err(|e| NocturneError::Serialization(format!("avatar base64: {e}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ack {
    /// Request id of the message being acknowledged.
    pub ref_id: u64,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncomingFile {
    pub file_id: FileId,
    pub name: String,
    pub size: u64,
    pub hash: ContentHash,
    /// Sender-allocated channel the file bytes will arrive on.
    pub channel: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcceptFile {
    pub file_id: FileId,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectFile {
    pub file_id: FileId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbortFile {
    pub file_id: FileId,
}

impl ControlMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, NocturneError> {
        serde_json::to_vec(self).map_err(|e| NocturneError::Serialization(e.to_string()))
    }

    /// Decode a control document. `Ok(None)` means a well-formed document
    /// with an unrecognized `type`; the caller logs and ignores it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Option<Self>, NocturneError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| NocturneError::Serialization(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| NocturneError::Serialization("missing type field".into()))?;
        if !KNOWN_TYPES.contains(&kind) {
            return Ok(None);
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| NocturneError::Serialization(e.to_string()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Message(_) => "Message",
            Self::UserInfo(_) => "UserInfo",
            Self::Avatar(_) => "Avatar",
            Self::Ack(_) => "Ack",
            Self::IncomingFile(_) => "IncomingFile",
            Self::AcceptFile(_) => "AcceptFile",
            Self::RejectFile(_) => "RejectFile",
            Self::AbortFile(_) => "AbortFile",
        }
    }
}

const KNOWN_TYPES: [&str; 8] = [
    "Message",
    "UserInfo",
    "Avatar",
    "Ack",
    "IncomingFile",
    "AcceptFile",
    "RejectFile",
    "AbortFile",
];
