// Tor wire protocol for Nocturne: one authenticated-encrypted session per
// peer, carrying multiplexed control traffic and resumable file transfers
// over a single onion stream.

pub mod channel;
pub mod config;
pub mod events;
pub mod handshake;
pub mod session;
pub mod stream;
pub mod transfer;
pub mod transport;

mod error;

pub use config::SessionConfig;
pub use error::{FileError, SessionError};
pub use events::{PeerEvent, SessionState};
pub use handshake::ConnectData;
pub use session::{accept, connect, PeerHandle, SessionCommand};
pub use transport::{Dialer, PeerStream, SocksDialer, DEFAULT_SOCKS_PROXY};
