//! Framed encrypted stream.
//!
//! Above the handshake the wire carries length-prefixed ciphertext frames:
//!
//! ```text
//! frame := u16_be length || ciphertext[length]
//! chunk := u32_be channel || u64_be request_id || payload   (sealed)
//! ```
//!
//! The cleartext length bounds the ciphertext and must stay within
//! `[STREAM_ABYTES + 1, max_chunk_bytes]`. Each frame opens to a plaintext
//! chunk plus the stream tag; a `Final` tag on a nonzero channel ends that
//! channel only, while `Final` on channel 0 half-closes the whole inbound
//! stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use nocturne_shared::constants::{CHUNK_HEADER_SIZE, STREAM_ABYTES};
use nocturne_shared::crypto::{PullState, PushState, Tag};

use crate::error::{Result, SessionError};

/// One decrypted chunk, routed by the channel id in its inner header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundChunk {
    pub channel: u32,
    pub request_id: u64,
    pub payload: Vec<u8>,
    pub is_final: bool,
}

/// Inbound framing state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InState {
    /// Before handshake success; no frames may arrive.
    Disabled,
    /// Waiting for the two length bytes.
    ChunkSize,
    /// Waiting for `length` ciphertext bytes.
    ChunkData,
    /// Stream-level FINAL observed; any further bytes are an error.
    Closing,
}

pub struct EncryptedReader<R> {
    io: R,
    pull: PullState,
    state: InState,
    max_chunk: usize,
}

impl<R: AsyncRead + Unpin> EncryptedReader<R> {
    pub fn new(io: R, pull: PullState, max_chunk: usize) -> Self {
        Self {
            io,
            pull,
            state: InState::Disabled,
            max_chunk,
        }
    }

    /// Arm the reader once the handshake has succeeded.
    pub fn enable(&mut self) {
        if self.state == InState::Disabled {
            self.state = InState::ChunkSize;
        }
    }

    pub fn state(&self) -> InState {
        self.state
    }

    /// Read, decrypt and parse the next chunk.
    ///
    /// Not cancel safe; the owning read loop must be the only caller.
    pub async fn read_chunk(&mut self) -> Result<InboundChunk> {
        match self.state {
            InState::Disabled => {
                return Err(SessionError::Protocol("stream not enabled".into()))
            }
            InState::Closing => {
                return Err(SessionError::Protocol(
                    "data received after stream close".into(),
                ))
            }
            InState::ChunkSize | InState::ChunkData => {}
        }

        let mut len_buf = [0u8; 2];
        self.io.read_exact(&mut len_buf).await?;
        let length = u16::from_be_bytes(len_buf) as usize;

        if length <= STREAM_ABYTES {
            return Err(SessionError::Protocol(format!(
                "undersized frame: {length} bytes"
            )));
        }
        if length > self.max_chunk {
            return Err(SessionError::Protocol(format!(
                "oversized frame: {length} > {}",
                self.max_chunk
            )));
        }

        self.state = InState::ChunkData;
        let mut ciphertext = vec![0u8; length];
        self.io.read_exact(&mut ciphertext).await?;

        let (plaintext, tag) = self.pull.pull(&ciphertext)?;
        if plaintext.len() < CHUNK_HEADER_SIZE {
            return Err(SessionError::Protocol(
                "chunk shorter than its inner header".into(),
            ));
        }

        let channel = u32::from_be_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]);
        let request_id = u64::from_be_bytes([
            plaintext[4],
            plaintext[5],
            plaintext[6],
            plaintext[7],
            plaintext[8],
            plaintext[9],
            plaintext[10],
            plaintext[11],
        ]);
        let payload = plaintext[CHUNK_HEADER_SIZE..].to_vec();

        let is_final = tag == Tag::Final;
        self.state = if is_final && channel == 0 {
            InState::Closing
        } else {
            InState::ChunkSize
        };

        Ok(InboundChunk {
            channel,
            request_id,
            payload,
            is_final,
        })
    }
}

pub struct EncryptedWriter<W> {
    io: W,
    push: PushState,
    max_chunk: usize,
}

impl<W: AsyncWrite + Unpin> EncryptedWriter<W> {
    pub fn new(io: W, push: PushState, max_chunk: usize) -> Self {
        Self {
            io,
            push,
            max_chunk,
        }
    }

    /// Largest payload that still fits one frame.
    pub fn max_payload(&self) -> usize {
        self.max_chunk - STREAM_ABYTES - CHUNK_HEADER_SIZE
    }

    /// Seal and send one chunk as a single frame.
    pub async fn write_chunk(
        &mut self,
        channel: u32,
        request_id: u64,
        payload: &[u8],
        is_final: bool,
    ) -> Result<()> {
        let frame_len = CHUNK_HEADER_SIZE + payload.len() + STREAM_ABYTES;
        if frame_len > self.max_chunk {
            return Err(SessionError::Protocol(format!(
                "chunk of {} bytes exceeds the {} byte frame limit",
                payload.len(),
                self.max_chunk
            )));
        }

        let mut plaintext = Vec::with_capacity(CHUNK_HEADER_SIZE + payload.len());
        plaintext.extend_from_slice(&channel.to_be_bytes());
        plaintext.extend_from_slice(&request_id.to_be_bytes());
        plaintext.extend_from_slice(payload);

        let tag = if is_final { Tag::Final } else { Tag::Message };
        let ciphertext = self.push.push(&plaintext, tag)?;
        debug_assert_eq!(ciphertext.len(), frame_len);

        let mut frame = Vec::with_capacity(2 + ciphertext.len());
        frame.extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
        frame.extend_from_slice(&ciphertext);

        self.io.write_all(&frame).await?;
        self.io.flush().await?;
        Ok(())
    }
}
