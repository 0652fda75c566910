use thiserror::Error;

use nocturne_shared::{CryptoError, IdentityError, NocturneError};
use nocturne_store::StoreError;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Session-level error taxonomy.
///
/// Only transport loss and handshake timeouts are retried, and only for
/// outgoing sessions. A protocol violation or a failed authentication is
/// never retried; the remote is either broken or hostile.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Peer authentication failed: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Session closed")]
    Closed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Whether an outgoing session may dial again after this error.
    pub fn is_reconnectable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::HandshakeTimeout)
    }
}

impl From<CryptoError> for SessionError {
    fn from(e: CryptoError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<IdentityError> for SessionError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::BadSignature => Self::Auth(e.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<NocturneError> for SessionError {
    fn from(e: NocturneError) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// File-level failures. These mark the file FAILED but leave the session
/// alive.
#[derive(Error, Debug)]
pub enum FileError {
    #[error("File IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Content hash mismatch")]
    HashMismatch,

    #[error("Transfer aborted by peer")]
    Aborted,
}
