//! Authenticated encryption primitives.
//!
//! Two distinct AEADs are in play, per the wire-level invariants:
//!   - the outer KeyStore seal uses AES-GCM-256 with a 96-bit nonce
//!   - the Double Ratchet uses ChaCha20-Poly1305, also a 96-bit nonce
//!
//! Both use the combined wire layout `nonce (12 bytes) ‖ ciphertext ‖ tag`.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AesOsRng, Payload},
    Aes256Gcm,
};
use chacha20poly1305::{
    aead::{Aead as ChachaAead, AeadCore as ChachaAeadCore, KeyInit as ChachaKeyInit, OsRng as ChachaOsRng},
    ChaCha20Poly1305,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

const NONCE_LEN: usize = 12;

/// Seal `plaintext` under `key` with AES-GCM-256, prepending a random
/// 12-byte nonce. Used for the outer KeyStore / sealed-record AEAD.
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = Aes256Gcm::generate_nonce(&mut AesOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a blob produced by [`seal`]. Fails uniformly with `AeadDecrypt` on
/// any tampering, truncation, or wrong-key attempt.
pub fn open(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let nonce = aes_gcm::Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

/// `canDecrypt` (§4.1): password-verification helper that does not
/// short-circuit ahead of the AEAD call, so it leaks no more timing
/// information than `open` itself does.
pub fn can_decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> bool {
    open(key, data, aad).is_ok()
}

/// Encrypt one ratchet message under a per-message key with
/// ChaCha20-Poly1305. `aad` is the SHA-256(header ‖ "Cypher ChatMessage")
/// construction from §4.3, computed by the ratchet module.
pub fn ratchet_encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = ChaCha20Poly1305::generate_nonce(&mut ChachaOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, chacha20poly1305::aead::Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn ratchet_decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let nonce = chacha20poly1305::Nonce::from_slice(nonce_bytes);
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(nonce, chacha20poly1305::aead::Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [7u8; 32];
        let ct = seal(&key, b"hello world", b"aad").unwrap();
        let pt = open(&key, &ct, b"aad").unwrap();
        assert_eq!(&pt[..], b"hello world");
    }

    #[test]
    fn open_rejects_tampering() {
        let key = [7u8; 32];
        let mut ct = seal(&key, b"hello world", b"aad").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(open(&key, &ct, b"aad").is_err());
    }

    #[test]
    fn can_decrypt_matches_open() {
        let key = [9u8; 32];
        let wrong = [1u8; 32];
        let ct = seal(&key, b"x", b"").unwrap();
        assert!(can_decrypt(&key, &ct, b""));
        assert!(!can_decrypt(&wrong, &ct, b""));
    }

    #[test]
    fn ratchet_aead_roundtrip() {
        let key = [3u8; 32];
        let ct = ratchet_encrypt(&key, b"msg", b"hdr-aad").unwrap();
        let pt = ratchet_decrypt(&key, &ct, b"hdr-aad").unwrap();
        assert_eq!(&pt[..], b"msg");
    }
}
