//! Per-file sender and receiver state.
//!
//! The session task drives these: `OutboundFile` produces chunks from disk
//! for an accepted offer, `InboundFile` writes arriving chunks at the
//! negotiated offset and folds them into a streaming hash. Content hashing
//! for offers runs on the blocking worker pool, off the session's I/O loop.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use nocturne_shared::crypto::{ContentHash, ContentHasher};
use nocturne_shared::types::FileId;
use nocturne_store::FileRecord;

use crate::error::FileError;

/// Sender side of one accepted transfer, bound to an outbound channel.
pub struct OutboundFile {
    pub file_id: FileId,
    pub channel: u32,
    file: File,
    remaining: u64,
    chunk_size: usize,
}

impl OutboundFile {
    /// Open the local file and seek to the negotiated resume offset.
    pub async fn open(
        record: &FileRecord,
        channel: u32,
        offset: u64,
        chunk_size: usize,
    ) -> Result<Self, FileError> {
        let mut file = File::open(&record.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        debug!(file = %record.id, channel, offset, "Opened outgoing file");

        Ok(Self {
            file_id: record.id,
            channel,
            file,
            remaining: record.size.saturating_sub(offset),
            chunk_size,
        })
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Next chunk of at most `chunk_size` bytes. The flag marks the last
    /// chunk of the file; an empty file yields one empty final chunk.
    pub async fn next_chunk(&mut self) -> Result<(Vec<u8>, bool), FileError> {
        if self.remaining == 0 {
            return Ok((Vec::new(), true));
        }

        let want = self.chunk_size.min(self.remaining as usize);
        let mut buf = vec![0u8; want];
        // A short file here means it changed under us; surface the IO error.
        self.file.read_exact(&mut buf).await?;
        self.remaining -= want as u64;

        Ok((buf, self.remaining == 0))
    }
}

/// Receiver side of one accepted transfer, bound to an inbound channel.
pub struct InboundFile {
    pub file_id: FileId,
    /// Request id of the offer; the completion ack references it.
    pub offer_request_id: u64,
    file: File,
    hasher: ContentHasher,
    expected: ContentHash,
    received: u64,
    size: u64,
}

impl InboundFile {
    /// Open or create the destination and position it at `offset`.
    ///
    /// On resume the already-present prefix is re-read through the hasher
    /// so the final digest covers the whole file; anything past the offset
    /// is truncated away.
    pub async fn open(
        record: &FileRecord,
        dest: &Path,
        offset: u64,
        expected: ContentHash,
        offer_request_id: u64,
    ) -> Result<Self, FileError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dest)
            .await?;

        let mut hasher = ContentHasher::new();
        if offset > 0 {
            file.seek(SeekFrom::Start(0)).await?;
            let mut left = offset;
            let mut buf = vec![0u8; 64 * 1024];
            while left > 0 {
                let take = buf.len().min(left as usize);
                file.read_exact(&mut buf[..take]).await?;
                hasher.update(&buf[..take]);
                left -= take as u64;
            }
        }
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        debug!(file = %record.id, dest = %dest.display(), offset, "Opened incoming file");

        Ok(Self {
            file_id: record.id,
            offer_request_id,
            file,
            hasher,
            expected,
            received: offset,
            size: record.size,
        })
    }

    /// Absolute progress including any resumed prefix.
    pub fn received(&self) -> u64 {
        self.received
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), FileError> {
        if self.received + data.len() as u64 > self.size {
            return Err(FileError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "more bytes than the offered size",
            )));
        }
        self.file.write_all(data).await?;
        // The resume offset must never run ahead of the bytes on disk.
        self.file.flush().await?;
        self.hasher.update(data);
        self.received += data.len() as u64;
        Ok(())
    }

    /// Flush and verify the full-content hash against the offer.
    pub async fn finish(mut self) -> Result<ContentHash, FileError> {
        self.file.flush().await?;

        if self.received != self.size {
            return Err(FileError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("final chunk at {} of {} bytes", self.received, self.size),
            )));
        }

        let hash = self.hasher.finalize();
        if hash != self.expected {
            return Err(FileError::HashMismatch);
        }
        Ok(hash)
    }
}

/// Full-content BLAKE3 digest, computed on the blocking worker pool.
pub async fn hash_file(path: PathBuf) -> Result<ContentHash, FileError> {
    let hash = tokio::task::spawn_blocking(move || -> std::io::Result<ContentHash> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = blake3::Hasher::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(ContentHash(*hasher.finalize().as_bytes()))
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
    Ok(hash)
}
