//! Endpoint identity and crypto: keypairs, endpoint id, session keys, auth token, wire encryption.

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::endpoint::EndpointId;

/// Endpoint public key (32 bytes, X25519). Serializable for the link handshake.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Endpoint id derived from a public key: first 4 bytes of SHA-256, lowercase hex.
pub fn endpoint_id_for(public: &PublicKey) -> EndpointId {
    let digest = Sha256::digest(public.as_bytes());
    let id: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    EndpointId::new(id)
}

/// X25519 keypair. Keep secret key private; expose only public key and endpoint id.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    endpoint_id: EndpointId,
}

impl Keypair {
    /// Generate a new random keypair and derive the endpoint id from the public key.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let endpoint_id = endpoint_id_for(&public);
        Self {
            secret,
            public,
            endpoint_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint_id
    }

    /// Shared secret with another endpoint's public key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Per-direction session keys for one link. Each direction has its own key so
/// both sides can count nonces from zero.
#[derive(Clone)]
pub struct SessionKeys {
    pub outbound: [u8; 32],
    pub inbound: [u8; 32],
}

/// Derive the link's session keys. `initiator` is the side that opened the connection.
pub fn derive_session_keys(shared_secret: &[u8; 32], initiator: bool) -> SessionKeys {
    let to_responder = derive_key(shared_secret, b"nearby-session-i2r-v1");
    let to_initiator = derive_key(shared_secret, b"nearby-session-r2i-v1");
    if initiator {
        SessionKeys {
            outbound: to_responder,
            inbound: to_initiator,
        }
    } else {
        SessionKeys {
            outbound: to_initiator,
            inbound: to_responder,
        }
    }
}

fn derive_key(shared_secret: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Four-digit token both sides display; equal tokens mean no one sits in the middle.
pub fn authentication_token(shared_secret: &[u8; 32]) -> String {
    let digest = derive_key(shared_secret, b"nearby-auth-v1");
    let n = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) % 10_000;
    format!("{n:04}")
}

/// Wire encryption: ChaCha20-Poly1305. Nonce: 96-bit counter per direction; never reuse.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_bytes(nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Wire decryption.
pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_bytes(nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

fn nonce_bytes(nonce: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[4..12].copy_from_slice(&nonce.to_le_bytes());
    out
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}
