//! Integrity: end-to-end SHA-256 digest over a payload's bytes, computed while chunks stream.

use sha2::{Digest, Sha256};

/// Hash a whole payload. Returns 32-byte digest.
pub fn hash_payload(payload: &[u8]) -> [u8; 32] {
    Sha256::digest(payload).into()
}

/// Incremental digest, fed chunk by chunk on either side of a transfer.
#[derive(Clone, Default)]
pub struct PayloadHasher {
    inner: Sha256,
    bytes: u64,
}

impl PayloadHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> [u8; 32] {
        self.inner.finalize().into()
    }

    /// Finish and compare against the digest the sender announced.
    pub fn verify(self, expected: &[u8; 32]) -> bool {
        self.finish() == *expected
    }
}
