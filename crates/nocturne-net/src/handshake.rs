//! HELLO/OLLEH handshake.
//!
//! Two fixed-size messages immediately after connect. Each side generates
//! the key and header for its own outbound AEAD stream and signs them with
//! its long-term identity key, binding the stream to both identities:
//!
//! ```text
//! HELLO  := version(1) || key(32) || header(24) || client_pub(32) || sig(64)
//!           sig = sign(client, key || header || server_pub_expected)
//! OLLEH  := version(1) || key(32) || header(24) || sig(64)
//!           sig = sign(server, key || header || client_pub_from_hello)
//! ```
//!
//! Every failure here is terminal for the attempt: short read, version
//! mismatch, bad signature, identity mismatch.

use std::sync::Arc;

use ed25519_dalek::Signature;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use nocturne_shared::constants::{
    HELLO_SIZE, OLLEH_SIZE, PROTOCOL_VERSION, PUBKEY_SIZE, SIGNATURE_SIZE, STREAM_HEADER_SIZE,
    STREAM_KEY_SIZE,
};
use nocturne_shared::crypto::{PullState, PushState, StreamHeader, StreamKey};
use nocturne_shared::identity::verify_signature;
use nocturne_shared::types::ConversationId;
use nocturne_shared::{Identity, OnionAddr, PeerId};

use crate::error::{Result, SessionError};

/// Everything needed to dial or accept one peer. Immutable after
/// construction.
#[derive(Clone)]
pub struct ConnectData {
    pub conversation: ConversationId,
    pub local: Arc<Identity>,
    pub remote_addr: OnionAddr,
    /// Expected remote identity. `None` derives it from the onion address.
    pub remote_pubkey: Option<[u8; PUBKEY_SIZE]>,
}

impl ConnectData {
    pub fn expected_pubkey(&self) -> Result<[u8; PUBKEY_SIZE]> {
        match self.remote_pubkey {
            Some(pk) => Ok(pk),
            None => Ok(self.remote_addr.public_key()?),
        }
    }
}

/// Both AEAD stream halves plus the proven remote identity.
pub struct HandshakeOutcome {
    pub push: PushState,
    pub pull: PullState,
    pub peer: PeerId,
}

/// Client side: send HELLO, verify OLLEH.
pub async fn outbound<S>(io: &mut S, connect: &ConnectData) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_pub = connect.expected_pubkey()?;

    let key = StreamKey::generate();
    let (push, header) = PushState::init(key.clone());

    let hello = encode_hello(&connect.local, &key, &header, &server_pub);
    io.write_all(&hello).await?;
    io.flush().await?;
    debug!(peer = %PeerId(server_pub).short(), "Sent HELLO, awaiting OLLEH");

    let mut olleh = [0u8; OLLEH_SIZE];
    io.read_exact(&mut olleh).await?;

    let (server_key, server_header) = parse_olleh(&olleh, &server_pub, &connect.local)?;
    let pull = PullState::init(server_key, server_header);

    Ok(HandshakeOutcome {
        push,
        pull,
        peer: PeerId(server_pub),
    })
}

/// Server side: verify HELLO, reply OLLEH.
///
/// With `expected` set, any other client identity is an authentication
/// failure; without it the proven identity is accepted and authorization is
/// the caller's decision.
pub async fn inbound<S>(
    io: &mut S,
    local: &Identity,
    expected: Option<[u8; PUBKEY_SIZE]>,
) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; HELLO_SIZE];
    io.read_exact(&mut hello).await?;

    let (client_key, client_header, client_pub) = parse_hello(&hello, local)?;
    if let Some(expected) = expected {
        if client_pub != expected {
            return Err(SessionError::Auth(format!(
                "peer identity mismatch: expected {}, got {}",
                PeerId(expected).short(),
                PeerId(client_pub).short()
            )));
        }
    }
    let pull = PullState::init(client_key, client_header);

    let key = StreamKey::generate();
    let (push, header) = PushState::init(key.clone());
    let olleh = encode_olleh(local, &key, &header, &client_pub);
    io.write_all(&olleh).await?;
    io.flush().await?;
    debug!(peer = %PeerId(client_pub).short(), "HELLO verified, sent OLLEH");

    Ok(HandshakeOutcome {
        push,
        pull,
        peer: PeerId(client_pub),
    })
}

fn signable(
    key: &StreamKey,
    header: &StreamHeader,
    bound_pubkey: &[u8; PUBKEY_SIZE],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(STREAM_KEY_SIZE + STREAM_HEADER_SIZE + PUBKEY_SIZE);
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(bound_pubkey);
    buf
}

fn encode_hello(
    local: &Identity,
    key: &StreamKey,
    header: &StreamHeader,
    server_pub: &[u8; PUBKEY_SIZE],
) -> [u8; HELLO_SIZE] {
    let sig = local.sign(&signable(key, header, server_pub));

    let mut buf = [0u8; HELLO_SIZE];
    let mut at = 0;
    buf[at] = PROTOCOL_VERSION;
    at += 1;
    buf[at..at + STREAM_KEY_SIZE].copy_from_slice(key.as_bytes());
    at += STREAM_KEY_SIZE;
    buf[at..at + STREAM_HEADER_SIZE].copy_from_slice(header.as_bytes());
    at += STREAM_HEADER_SIZE;
    buf[at..at + PUBKEY_SIZE].copy_from_slice(&local.public_key_bytes());
    at += PUBKEY_SIZE;
    buf[at..].copy_from_slice(&sig.to_bytes());
    buf
}

fn parse_hello(
    buf: &[u8; HELLO_SIZE],
    local: &Identity,
) -> Result<(StreamKey, StreamHeader, [u8; PUBKEY_SIZE])> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(SessionError::Protocol(format!(
            "unsupported HELLO version {}",
            buf[0]
        )));
    }

    let mut at = 1;
    let key = StreamKey::from_slice(&buf[at..at + STREAM_KEY_SIZE])?;
    at += STREAM_KEY_SIZE;
    let header = StreamHeader::from_slice(&buf[at..at + STREAM_HEADER_SIZE])?;
    at += STREAM_HEADER_SIZE;
    let mut client_pub = [0u8; PUBKEY_SIZE];
    client_pub.copy_from_slice(&buf[at..at + PUBKEY_SIZE]);
    at += PUBKEY_SIZE;
    let mut sig_bytes = [0u8; SIGNATURE_SIZE];
    sig_bytes.copy_from_slice(&buf[at..]);
    let sig = Signature::from_bytes(&sig_bytes);

    // The client signs over our public key; a HELLO meant for some other
    // service does not verify here.
    verify_signature(
        &client_pub,
        &signable(&key, &header, &local.public_key_bytes()),
        &sig,
    )
    .map_err(|_| SessionError::Auth("HELLO signature verification failed".into()))?;

    Ok((key, header, client_pub))
}

fn encode_olleh(
    local: &Identity,
    key: &StreamKey,
    header: &StreamHeader,
    client_pub: &[u8; PUBKEY_SIZE],
) -> [u8; OLLEH_SIZE] {
    let sig = local.sign(&signable(key, header, client_pub));

    let mut buf = [0u8; OLLEH_SIZE];
    let mut at = 0;
    buf[at] = PROTOCOL_VERSION;
    at += 1;
    buf[at..at + STREAM_KEY_SIZE].copy_from_slice(key.as_bytes());
    at += STREAM_KEY_SIZE;
    buf[at..at + STREAM_HEADER_SIZE].copy_from_slice(header.as_bytes());
    at += STREAM_HEADER_SIZE;
    buf[at..].copy_from_slice(&sig.to_bytes());
    buf
}

fn parse_olleh(
    buf: &[u8; OLLEH_SIZE],
    server_pub: &[u8; PUBKEY_SIZE],
    local: &Identity,
) -> Result<(StreamKey, StreamHeader)> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(SessionError::Protocol(format!(
            "unsupported OLLEH version {}",
            buf[0]
        )));
    }

    let mut at = 1;
    let key = StreamKey::from_slice(&buf[at..at + STREAM_KEY_SIZE])?;
    at += STREAM_KEY_SIZE;
    let header = StreamHeader::from_slice(&buf[at..at + STREAM_HEADER_SIZE])?;
    at += STREAM_HEADER_SIZE;
    let mut sig_bytes = [0u8; SIGNATURE_SIZE];
    sig_bytes.copy_from_slice(&buf[at..]);
    let sig = Signature::from_bytes(&sig_bytes);

    verify_signature(
        server_pub,
        &signable(&key, &header, &local.public_key_bytes()),
        &sig,
    )
    .map_err(|_| SessionError::Auth("OLLEH signature verification failed".into()))?;

    Ok((key, header))
}
