use data_encoding::BASE32_NOPAD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use zeroize::Zeroizing;

use crate::constants::{ONION_ADDRESS_LENGTH, ONION_VERSION, PUBKEY_SIZE};
use crate::error::IdentityError;
use crate::types::PeerId;

// Ed25519-based identity. Public key = peer ID, the onion address is
// derived from it, so proving the key proves the address.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl Identity {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    pub fn from_export(export: &IdentityExport) -> Self {
        Self::from_secret_bytes(&export.secret_key)
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.signing_key.verifying_key().to_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.signing_key.as_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn onion_address(&self, port: u16) -> OnionAddr {
        OnionAddr::from_public_key(&self.public_key_bytes(), port)
    }

    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            secret_key: *self.signing_key.as_bytes(),
            public_key: self.signing_key.verifying_key().to_bytes(),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id().short())
            .finish()
    }
}

pub fn verify_signature(
    pubkey_bytes: &[u8; 32],
    message: &[u8],
    signature: &Signature,
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey_bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;
    verifying_key
        .verify(message, signature)
        .map_err(|_| IdentityError::BadSignature)
}

/// A v3 onion service endpoint: 56-char base32 host plus port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OnionAddr {
    host: String,
    port: u16,
}

impl OnionAddr {
    /// Derive the onion hostname bound to an Ed25519 public key.
    ///
    /// host = base32(pubkey || checksum[0..2] || version), with
    /// checksum = SHA3-256(".onion checksum" || pubkey || version).
    pub fn from_public_key(pubkey: &[u8; PUBKEY_SIZE], port: u16) -> Self {
        let checksum = onion_checksum(pubkey);

        let mut raw = Vec::with_capacity(PUBKEY_SIZE + 3);
        raw.extend_from_slice(pubkey);
        raw.extend_from_slice(&checksum);
        raw.push(ONION_VERSION);

        Self {
            host: BASE32_NOPAD.encode(&raw).to_ascii_lowercase(),
            port,
        }
    }

    /// Parse "host.onion:port" or a bare 56-char host, verifying the
    /// embedded checksum and version byte.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let (host_part, port) = match s.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| IdentityError::InvalidOnionAddress(format!("bad port: {p}")))?;
                (h, port)
            }
            None => (s, crate::DEFAULT_ONION_PORT),
        };

        let host = host_part.strip_suffix(".onion").unwrap_or(host_part);
        if host.len() != ONION_ADDRESS_LENGTH {
            return Err(IdentityError::InvalidOnionAddress(format!(
                "expected {} base32 chars, got {}",
                ONION_ADDRESS_LENGTH,
                host.len()
            )));
        }

        let raw = BASE32_NOPAD
            .decode(host.to_ascii_uppercase().as_bytes())
            .map_err(|e| IdentityError::InvalidOnionAddress(e.to_string()))?;
        if raw.len() != PUBKEY_SIZE + 3 || raw[PUBKEY_SIZE + 2] != ONION_VERSION {
            return Err(IdentityError::InvalidOnionAddress(
                "not a v3 address".into(),
            ));
        }

        let mut pubkey = [0u8; PUBKEY_SIZE];
        pubkey.copy_from_slice(&raw[..PUBKEY_SIZE]);
        if raw[PUBKEY_SIZE..PUBKEY_SIZE + 2] != onion_checksum(&pubkey) {
            return Err(IdentityError::InvalidOnionAddress(
                "checksum mismatch".into(),
            ));
        }

        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// The Ed25519 public key embedded in the address.
    pub fn public_key(&self) -> Result<[u8; PUBKEY_SIZE], IdentityError> {
        let raw = BASE32_NOPAD
            .decode(self.host.to_ascii_uppercase().as_bytes())
            .map_err(|e| IdentityError::InvalidOnionAddress(e.to_string()))?;
        let mut pubkey = [0u8; PUBKEY_SIZE];
        pubkey.copy_from_slice(&raw[..PUBKEY_SIZE]);
        Ok(pubkey)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Hostname with the ".onion" suffix, as handed to the SOCKS proxy.
    pub fn socks_host(&self) -> String {
        format!("{}.onion", self.host)
    }
}

impl std::fmt::Display for OnionAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.onion:{}", self.host, self.port)
    }
}

fn onion_checksum(pubkey: &[u8; PUBKEY_SIZE]) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(b".onion checksum");
    hasher.update(pubkey);
    hasher.update([ONION_VERSION]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let id = Identity::generate();
        assert_eq!(id.peer_id().0.len(), 32);
    }

    #[test]
    fn test_identity_roundtrip() {
        let id = Identity::generate();
        let export = id.to_export();
        let restored = Identity::from_export(&export);
        assert_eq!(id.peer_id(), restored.peer_id());
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let message = b"good night, good night";
        let signature = id.sign(message);

        assert!(verify_signature(&id.public_key_bytes(), message, &signature).is_ok());
        assert!(verify_signature(&id.public_key_bytes(), b"wrong", &signature).is_err());
    }

    #[test]
    fn test_onion_addr_roundtrip() {
        let id = Identity::generate();
        let addr = id.onion_address(11009);
        assert_eq!(addr.host().len(), ONION_ADDRESS_LENGTH);

        let parsed = OnionAddr::parse(&addr.to_string()).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(parsed.public_key().unwrap(), id.public_key_bytes());
    }

    #[test]
    fn test_onion_addr_rejects_corruption() {
        let id = Identity::generate();
        let addr = id.onion_address(11009);
        let mut s = addr.to_string();
        // flip one base32 character
        let replacement = if s.starts_with('a') { 'b' } else { 'a' };
        s.replace_range(0..1, &replacement.to_string());
        assert!(OnionAddr::parse(&s).is_err());
    }

    #[test]
    fn test_onion_addr_rejects_garbage() {
        assert!(OnionAddr::parse("not-an-address").is_err());
        assert!(OnionAddr::parse("").is_err());
    }
}
