use thiserror::Error;

#[derive(Error, Debug)]
pub enum NocturneError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid stream header length")]
    InvalidHeaderLength,

    #[error("Stream chunk counter exhausted")]
    CounterExhausted,

    #[error("Ciphertext shorter than AEAD overhead")]
    TruncatedCiphertext,

    #[error("Unknown stream tag")]
    UnknownTag,

    #[error("Invalid hash encoding")]
    InvalidHashEncoding,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Invalid onion address: {0}")]
    InvalidOnionAddress(String),
}
