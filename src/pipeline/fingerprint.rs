use base64::Engine;
use sha2::{Digest, Sha256};

/// SHA-256 content fingerprint of an image payload, base64 encoded.
pub fn content_fingerprint(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    base64::engine::general_purpose::STANDARD.encode(hash)
}
