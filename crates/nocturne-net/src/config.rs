use std::time::Duration;

use nocturne_shared::constants::MAX_CHUNK_BYTES;

/// Tunables for one peer session. `Default` carries the protocol defaults.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reconnect budget for outgoing sessions.
    pub max_reconnects: u32,
    /// Wait between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Abort the handshake if it has not finished within this window.
    pub handshake_timeout: Duration,
    /// Largest encrypted frame body announced by the length prefix.
    pub max_chunk_bytes: usize,
    /// Read/write granularity for file transfers.
    pub file_io_chunk_bytes: usize,
    /// Report a control request failed locally if no ack arrives in time.
    /// `None` disables the sweep.
    pub ack_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnects: 20,
            reconnect_delay: Duration::from_millis(20_000),
            handshake_timeout: Duration::from_millis(30_000),
            max_chunk_bytes: MAX_CHUNK_BYTES,
            file_io_chunk_bytes: 16_384,
            ack_timeout: None,
        }
    }
}
