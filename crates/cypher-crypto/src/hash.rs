//! Hash utilities: BLAKE3 content addressing and the SHA-256 associated-data
//! construction the Double Ratchet header uses as its AEAD AAD.

use sha2::{Digest, Sha256};

/// `SHA-256(header_bytes ‖ "Cypher ChatMessage")` — the associated data
/// bound to every ratchet ciphertext (§4.3).
pub fn header_associated_data(header_bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(header_bytes);
    hasher.update(b"Cypher ChatMessage");
    hasher.finalize().into()
}

/// Deterministic content hash, used for attachment dedup / integrity.
pub fn content_hash(data: &[u8]) -> [u8; 32] {
    blake3::hash(data).into()
}

/// Domain-separated chain link: commits each message to its predecessor.
pub fn chain_link(prev: &[u8; 32], message_id: &[u8], body: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"cypher-chain-v1\0");
    hasher.update(prev);
    hasher.update(message_id);
    hasher.update(body);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_ad_is_deterministic() {
        let a = header_associated_data(b"header-bytes");
        let b = header_associated_data(b"header-bytes");
        assert_eq!(a, b);
    }

    #[test]
    fn header_ad_differs_with_header() {
        let a = header_associated_data(b"header-1");
        let b = header_associated_data(b"header-2");
        assert_ne!(a, b);
    }

    #[test]
    fn chain_link_is_order_sensitive() {
        let prev = [0u8; 32];
        let a = chain_link(&prev, b"id1", b"body");
        let b = chain_link(&prev, b"id2", b"body");
        assert_ne!(a, b);
    }
}
