//! Key derivation functions.
//!
//! `app_key_from_password` derives the DeviceConfig seal key per §4.1:
//! `HKDF-SHA512(SHA512(password), salt = deviceSalt, info = Ø, 32 bytes)`.
//!
//! `kdf_rk`/`kdf_ck` implement the Double Ratchet's root- and chain-key
//! derivation per §4.3; `x3dh_derive` implements the X3DH shared-secret
//! expansion.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

type HmacSha512 = Hmac<Sha512>;

/// A derived 32-byte key, zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct DerivedKey(pub [u8; 32]);

/// §4.1: `appEncryptionKey = HKDF-SHA512(SHA512(password), salt=deviceSalt, info=Ø, 32 bytes)`.
pub fn app_key_from_password(password: &[u8], device_salt: &[u8]) -> Result<DerivedKey, CryptoError> {
    let ikm = Sha512::digest(password);
    let hk = Hkdf::<Sha512>::new(Some(device_salt), &ikm);
    let mut out = [0u8; 32];
    hk.expand(&[], &mut out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(DerivedKey(out))
}

/// Root-key derivation for the Double Ratchet (§4.3).
///
/// `HKDF-SHA512(salt = root_key, ikm = dh_output, info = "Cypher Protocol")`,
/// expanded to 64 bytes and split: first 32 bytes are the new root key, last
/// 32 are the new chain key. A single expand call with one info string is
/// the construction all implementations must agree on to interoperate.
pub fn kdf_rk(root_key: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha512>::new(Some(root_key), dh_output);
    let mut okm = [0u8; 64];
    hk.expand(b"Cypher Protocol", &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let mut new_root = [0u8; 32];
    let mut new_chain = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    new_chain.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((new_root, new_chain))
}

/// Chain-key / message-key derivation (§4.3): HMAC-SHA512 keyed by the
/// chain key, over the domain constant (`0x00` message key / `0x01` chain
/// key) followed by `sharedInfo = {0x02, 0x03}`, truncated to 32 bytes.
pub fn kdf_ck(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    const SHARED_INFO: [u8; 2] = [0x02, 0x03];

    let mut mac_ck = HmacSha512::new_from_slice(chain_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_ck.update(&[0x01]);
    mac_ck.update(&SHARED_INFO);
    let ck_full = mac_ck.finalize().into_bytes();
    let mut next_chain_key = [0u8; 32];
    next_chain_key.copy_from_slice(&ck_full[..32]);

    let mut mac_mk = HmacSha512::new_from_slice(chain_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_mk.update(&[0x00]);
    mac_mk.update(&SHARED_INFO);
    let mk_full = mac_mk.finalize().into_bytes();
    let mut message_key = [0u8; 32];
    message_key.copy_from_slice(&mk_full[..32]);

    Ok((next_chain_key, message_key))
}

/// Initial root key for `initializeSender`/`initializeRecipient` (§4.3):
/// `HKDF-SHA512(ikm = x3dh_shared_secret, salt = SHA-512(lowercase(initiator_username)),
/// info = "X3DHTemporaryReplacement", 32 bytes)`.
pub fn initial_root_key(x3dh_shared_secret: &[u8; 32], initiator_username: &str) -> Result<[u8; 32], CryptoError> {
    let salt = Sha512::digest(initiator_username.to_lowercase().as_bytes());
    let hk = Hkdf::<Sha512>::new(Some(&salt), x3dh_shared_secret);
    let mut out = [0u8; 32];
    hk.expand(b"X3DHTemporaryReplacement", &mut out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(out)
}

/// Generic single-call HKDF-SHA512 expand, used by the X3DH shared-secret
/// derivation where the output length is caller-defined.
pub fn hkdf_expand_sha512(ikm: &[u8], salt: Option<&[u8]>, info: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha512>::new(salt, ikm);
    hk.expand(info, out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_key_is_deterministic() {
        let a = app_key_from_password(b"hunter2", b"salt-bytes").unwrap();
        let b = app_key_from_password(b"hunter2", b"salt-bytes").unwrap();
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn app_key_differs_by_password() {
        let a = app_key_from_password(b"hunter2", b"salt-bytes").unwrap();
        let b = app_key_from_password(b"other", b"salt-bytes").unwrap();
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn kdf_rk_is_deterministic_and_splits() {
        let root = [1u8; 32];
        let dh = [2u8; 32];
        let (r1, c1) = kdf_rk(&root, &dh).unwrap();
        let (r2, c2) = kdf_rk(&root, &dh).unwrap();
        assert_eq!(r1, r2);
        assert_eq!(c1, c2);
        assert_ne!(r1, c1);
    }

    #[test]
    fn kdf_ck_message_and_chain_keys_differ() {
        let ck = [5u8; 32];
        let (next_ck, mk) = kdf_ck(&ck).unwrap();
        assert_ne!(next_ck, mk);
        assert_ne!(next_ck, ck);
    }

    #[test]
    fn initial_root_key_is_case_insensitive_on_username() {
        let secret = [9u8; 32];
        let a = initial_root_key(&secret, "Alice").unwrap();
        let b = initial_root_key(&secret, "alice").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn hkdf_expand_sha512_is_deterministic() {
        let mut a = [0u8; 40];
        let mut b = [0u8; 40];
        hkdf_expand_sha512(b"ikm", Some(b"salt"), b"info", &mut a).unwrap();
        hkdf_expand_sha512(b"ikm", Some(b"salt"), b"info", &mut b).unwrap();
        assert_eq!(a, b);
    }
}
