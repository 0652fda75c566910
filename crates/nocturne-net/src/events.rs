//! Typed events emitted by a peer session.
//!
//! The session task never calls back into application code; consumers read
//! these from the receiver returned at spawn time.

use uuid::Uuid;

use nocturne_shared::crypto::ContentHash;
use nocturne_shared::protocol::{Ack, Avatar, ChatMessage, IncomingFile, UserInfo};
use nocturne_shared::types::{FileId, PeerId};
use nocturne_store::{FileRecord, FileState};

/// Lifecycle of one peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Obtaining a transport stream through the proxy.
    Dialing,
    /// HELLO/OLLEH in flight.
    Handshaking,
    /// Encrypted stream up; frames are being processed.
    Connected,
    /// Waiting out the reconnect delay before dialing again.
    ReconnectWait,
    /// Flushing and releasing resources.
    Closing,
    /// Terminal: reconnect budget exhausted or non-retryable error.
    Failed,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged {
        session: Uuid,
        old: SessionState,
        new: SessionState,
    },
    /// Handshake finished and the remote identity was proven.
    PeerAuthenticated {
        session: Uuid,
        peer: PeerId,
    },
    MessageReceived {
        request_id: u64,
        message: ChatMessage,
    },
    UserInfoReceived {
        request_id: u64,
        info: UserInfo,
    },
    AvatarReceived {
        request_id: u64,
        avatar: Avatar,
    },
    /// The peer acknowledged one of our requests.
    AckReceived(Ack),
    /// No ack arrived for a request within the configured window. Local
    /// only; the session keeps running.
    AckTimeout {
        request_id: u64,
    },
    /// The peer offered a file; the record is already in the store,
    /// waiting for accept or reject.
    FileOffered {
        record: FileRecord,
        offer: IncomingFile,
    },
    FileStateChanged {
        file_id: FileId,
        state: FileState,
    },
    BytesTransferred {
        file_id: FileId,
        bytes_transferred: u64,
        size: u64,
    },
    /// Background hash computation finished for an outgoing file.
    HashReady {
        file_id: FileId,
        hash: ContentHash,
    },
    /// Terminal protocol or authentication failure, reported before close.
    ProtocolViolation {
        session: Uuid,
        detail: String,
    },
    /// The session task is gone; no further events follow.
    Closed {
        session: Uuid,
    },
}
