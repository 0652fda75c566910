//! Chunked AEAD stream, signatures and content hashing.
//!
//! The stream construction seals a sequence of chunks under one key, each
//! chunk carrying a tag marker inside the AEAD envelope. The per-chunk nonce
//! mixes a monotone counter into the stream header, so a dropped, replayed
//! or reordered chunk fails authentication instead of decrypting quietly.
//! A `Final` chunk rekeys the state; the counter restarts under the new key.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{
    KDF_CONTEXT_STREAM_REKEY, STREAM_ABYTES, STREAM_HEADER_SIZE, STREAM_KEY_SIZE,
};
use crate::error::CryptoError;

/// Tag marker sealed with every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    /// Ordinary chunk, more may follow.
    Message = 0x00,
    /// Last chunk of a logical stream; the state rekeys after it.
    Final = 0x01,
}

impl Tag {
    fn from_byte(b: u8) -> Result<Self, CryptoError> {
        match b {
            0x00 => Ok(Self::Message),
            0x01 => Ok(Self::Final),
            _ => Err(CryptoError::UnknownTag),
        }
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StreamKey([u8; STREAM_KEY_SIZE]);

impl StreamKey {
    pub fn generate() -> Self {
        let mut key = [0u8; STREAM_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != STREAM_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength);
        }
        let mut key = [0u8; STREAM_KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; STREAM_KEY_SIZE] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader([u8; STREAM_HEADER_SIZE]);

impl StreamHeader {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != STREAM_HEADER_SIZE {
            return Err(CryptoError::InvalidHeaderLength);
        }
        let mut header = [0u8; STREAM_HEADER_SIZE];
        header.copy_from_slice(bytes);
        Ok(Self(header))
    }

    pub fn as_bytes(&self) -> &[u8; STREAM_HEADER_SIZE] {
        &self.0
    }
}

/// Outbound half of an AEAD stream.
pub struct PushState {
    key: StreamKey,
    header: StreamHeader,
    counter: u64,
}

impl PushState {
    /// Create a fresh outbound stream. The returned header must reach the
    /// peer (inside the handshake) before any chunk can be opened.
    pub fn init(key: StreamKey) -> (Self, StreamHeader) {
        let mut header = [0u8; STREAM_HEADER_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut header);
        let header = StreamHeader(header);
        (
            Self {
                key,
                header: header.clone(),
                counter: 0,
            },
            header,
        )
    }

    /// Seal one chunk. Output length = `plaintext.len() + STREAM_ABYTES`.
    pub fn push(&mut self, plaintext: &[u8], tag: Tag) -> Result<Vec<u8>, CryptoError> {
        let nonce = chunk_nonce(&self.header, self.counter);
        let cipher = XChaCha20Poly1305::new((&self.key.0).into());

        let mut framed = Vec::with_capacity(plaintext.len() + 1);
        framed.push(tag as u8);
        framed.extend_from_slice(plaintext);

        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &framed,
                    aad: &[],
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;
        framed.zeroize();

        self.advance(tag)?;
        Ok(ciphertext)
    }

    fn advance(&mut self, tag: Tag) -> Result<(), CryptoError> {
        if tag == Tag::Final {
            rekey(&mut self.key, &self.header);
            self.counter = 0;
        } else {
            self.counter = self
                .counter
                .checked_add(1)
                .ok_or(CryptoError::CounterExhausted)?;
        }
        Ok(())
    }
}

/// Inbound half of an AEAD stream.
pub struct PullState {
    key: StreamKey,
    header: StreamHeader,
    counter: u64,
}

impl PullState {
    pub fn init(key: StreamKey, header: StreamHeader) -> Self {
        Self {
            key,
            header,
            counter: 0,
        }
    }

    /// Open one chunk, returning the plaintext and its tag.
    pub fn pull(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, Tag), CryptoError> {
        if ciphertext.len() < STREAM_ABYTES {
            return Err(CryptoError::TruncatedCiphertext);
        }

        let nonce = chunk_nonce(&self.header, self.counter);
        let cipher = XChaCha20Poly1305::new((&self.key.0).into());

        let mut framed = cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let tag = Tag::from_byte(framed[0])?;
        let plaintext = framed.split_off(1);
        framed.zeroize();

        if tag == Tag::Final {
            rekey(&mut self.key, &self.header);
            self.counter = 0;
        } else {
            self.counter = self
                .counter
                .checked_add(1)
                .ok_or(CryptoError::CounterExhausted)?;
        }

        Ok((plaintext, tag))
    }
}

fn chunk_nonce(header: &StreamHeader, counter: u64) -> [u8; STREAM_HEADER_SIZE] {
    let mut nonce = *header.as_bytes();
    let ctr = counter.to_le_bytes();
    for (n, c) in nonce[STREAM_HEADER_SIZE - 8..].iter_mut().zip(ctr) {
        *n ^= c;
    }
    nonce
}

// BLAKE3 KDF with domain separation, same shape as the channel-key
// derivation elsewhere in the stack.
fn rekey(key: &mut StreamKey, header: &StreamHeader) {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_STREAM_REKEY);
    hasher.update(key.0.as_ref());
    hasher.update(header.as_bytes());
    let derived = hasher.finalize();
    key.0.copy_from_slice(&derived.as_bytes()[..STREAM_KEY_SIZE]);
}

/// 32-byte BLAKE3 content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidHashEncoding)?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidHashEncoding);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl serde::Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Streaming content hasher for file transfers.
#[derive(Default)]
pub struct ContentHasher {
    inner: blake3::Hasher,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finalize(&self) -> ContentHash {
        ContentHash(*self.inner.finalize().as_bytes())
    }
}
