//! PKCE (RFC 7636) material and random protocol values.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Code verifier and its S256 challenge.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

pub fn generate_pkce() -> PkcePair {
    let verifier = URL_SAFE_NO_PAD.encode(random_bytes(32));
    let challenge = compute_code_challenge(&verifier);
    PkcePair {
        verifier,
        challenge,
    }
}

pub fn compute_code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Hex string built from `byte_count` random bytes (used for state and nonce).
pub fn random_hex(byte_count: usize) -> String {
    random_bytes(byte_count)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn random_bytes(byte_count: usize) -> Vec<u8> {
    let mut buf = vec![0u8; byte_count];
    for chunk in buf.chunks_mut(16) {
        let id = uuid::Uuid::new_v4();
        let len = chunk.len();
        chunk.copy_from_slice(&id.as_bytes()[..len]);
    }
    buf
}
