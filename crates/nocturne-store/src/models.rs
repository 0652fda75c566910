use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nocturne_shared::crypto::ContentHash;
use nocturne_shared::types::{ConversationId, FileId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileState {
    Waiting,
    Transferring,
    Done,
    Failed,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileDirection {
    Outgoing,
    Incoming,
}

/// One file transfer, durable across sessions. The record is the
/// authoritative transfer progress; the peer session is ephemeral.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub id: FileId,
    pub conversation: ConversationId,
    pub direction: FileDirection,
    pub state: FileState,
    /// Name advertised to the peer, may differ from the on-disk name.
    pub name: String,
    /// Full local path with the actual name.
    pub path: PathBuf,
    /// BLAKE3 digest of the full content, once known.
    pub hash: Option<ContentHash>,
    pub size: u64,
    /// Resume offset in plaintext bytes.
    pub bytes_transferred: u64,
    pub created_time: DateTime<Utc>,
    pub file_time: Option<DateTime<Utc>>,
    pub ack_time: Option<DateTime<Utc>>,
}

impl FileRecord {
    pub fn new_outgoing(
        conversation: ConversationId,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        size: u64,
    ) -> Self {
        Self {
            id: FileId::new(),
            conversation,
            direction: FileDirection::Outgoing,
            state: FileState::Waiting,
            name: name.into(),
            path: path.into(),
            hash: None,
            size,
            bytes_transferred: 0,
            created_time: Utc::now(),
            file_time: None,
            ack_time: None,
        }
    }

    pub fn new_incoming(
        conversation: ConversationId,
        name: impl Into<String>,
        size: u64,
        hash: ContentHash,
    ) -> Self {
        Self {
            id: FileId::new(),
            conversation,
            direction: FileDirection::Incoming,
            state: FileState::Waiting,
            name: name.into(),
            path: PathBuf::new(),
            hash: Some(hash),
            size,
            bytes_transferred: 0,
            created_time: Utc::now(),
            file_time: None,
            ack_time: None,
        }
    }

    /// Progress while transferring is monotone; a smaller value is ignored.
    pub fn add_bytes_transferred(&mut self, bytes: u64) {
        self.bytes_transferred = (self.bytes_transferred + bytes).min(self.size);
    }

    pub fn touch_ack_time(&mut self) {
        self.ack_time = Some(Utc::now());
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, FileState::Waiting | FileState::Transferring)
    }
}
