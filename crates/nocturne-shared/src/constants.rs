/// Wire protocol version byte carried in HELLO/OLLEH
pub const PROTOCOL_VERSION: u8 = 1;

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Symmetric stream key size in bytes (XChaCha20-Poly1305)
pub const STREAM_KEY_SIZE: usize = 32;

/// Stream header size in bytes (XChaCha20 nonce base)
pub const STREAM_HEADER_SIZE: usize = 24;

/// Per-chunk AEAD overhead: Poly1305 tag plus the sealed tag marker byte
pub const STREAM_ABYTES: usize = 16 + 1;

/// BLAKE3 content digest size in bytes
pub const HASH_SIZE: usize = 32;

/// Largest encrypted frame body the 16-bit length prefix may announce
pub const MAX_CHUNK_BYTES: usize = 65_507;

/// Inner chunk header: u32 channel + u64 request id
pub const CHUNK_HEADER_SIZE: usize = 4 + 8;

/// HELLO: version + stream key + stream header + client pubkey + signature
pub const HELLO_SIZE: usize =
    1 + STREAM_KEY_SIZE + STREAM_HEADER_SIZE + PUBKEY_SIZE + SIGNATURE_SIZE;

/// OLLEH: version + stream key + stream header + signature
pub const OLLEH_SIZE: usize = 1 + STREAM_KEY_SIZE + STREAM_HEADER_SIZE + SIGNATURE_SIZE;

/// v3 onion address length (base32, without the ".onion" suffix)
pub const ONION_ADDRESS_LENGTH: usize = 56;

/// Version byte of v3 onion addresses
pub const ONION_VERSION: u8 = 3;

/// Key derivation context for the stream rekey after a FINAL chunk
pub const KDF_CONTEXT_STREAM_REKEY: &str = "nocturne-stream-rekey-v1";

/// Default port for the hidden-service side of a peer
pub const DEFAULT_ONION_PORT: u16 = 11009;
