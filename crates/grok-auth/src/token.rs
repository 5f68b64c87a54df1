//! Opaque client tokens
//!
//! The raw token is returned exactly once at creation; only its SHA-256 hex
//! digest is stored and compared.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Prefix makes tokens recognizable in logs and support tickets.
const TOKEN_PREFIX: &str = "grok_";

/// Generate a new raw client token (32 random bytes, base64url).
pub fn generate_client_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(bytes))
}

/// SHA-256 hex digest of a raw token, the form stored in `auth_tokens`.
pub fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
