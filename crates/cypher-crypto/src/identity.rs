//! Long-term Ed25519 identity keys and the Ed25519→X25519 conversion X3DH
//! needs to mix a signing key into a Diffie-Hellman exchange.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// A 32-byte Ed25519 public key, base64/hex-displayable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PublicKeyBytes(pub [u8; 32]);

impl PublicKeyBytes {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("expected 32-byte public key".into()))?;
        Ok(Self(arr))
    }

    /// Signal-style grouped fingerprint for out-of-band verification.
    pub fn fingerprint(&self) -> String {
        let digest = blake3::hash(&self.0);
        let bytes = &digest.as_bytes()[..20];
        hex::encode(bytes)
            .as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Long-term identity keypair (Ed25519 signing + the same key's X25519
/// conversion for X3DH). Secret bytes are zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes());
        Ok(Self {
            public,
            secret_bytes: signing_key.to_bytes(),
        })
    }

    pub fn from_bytes(secret_bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("expected 32-byte signing key".into()))?;
        let signing_key = SigningKey::from_bytes(&arr);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes());
        Ok(Self {
            public,
            secret_bytes: arr,
        })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret_bytes)
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key().sign(message).to_bytes().to_vec()
    }

    /// Verify a signature against an arbitrary (non-self) Ed25519 public key.
    pub fn verify(public: &PublicKeyBytes, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(&public.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        let sig = Signature::from_bytes(&sig_bytes);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Convert this identity's secret to an X25519 static secret for X3DH,
    /// via the clamped SHA-512 expansion libsignal and its derivatives use.
    pub fn to_x25519_secret(&self) -> StaticSecret {
        ed25519_secret_to_x25519(&self.secret_bytes)
    }
}

/// Per-device signing keypair; structurally identical to the identity key
/// but kept as a distinct type so device and identity keys are never
/// accidentally interchanged at the type level.
#[derive(ZeroizeOnDrop)]
pub struct DeviceKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl DeviceKeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = PublicKeyBytes(signing_key.verifying_key().to_bytes());
        Ok(Self {
            public,
            secret_bytes: signing_key.to_bytes(),
        })
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.secret_bytes)
            .sign(message)
            .to_bytes()
            .to_vec()
    }
}

/// Convert an Ed25519 signing secret to an X25519 static secret, per
/// RFC 7748 §5 clamping over the SHA-512 expansion.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    use sha2::{Digest, Sha512};
    let mut h = Sha512::digest(ed_secret);
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    StaticSecret::from(key)
}

/// Convert an Ed25519 verifying key to its X25519 Montgomery-form public
/// key via the birational map between the curves.
pub fn ed25519_pub_to_x25519(ed_pub: &PublicKeyBytes) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(&ed_pub.0)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey("Ed25519 public key decompression failed".into()))?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = IdentityKeyPair::generate().unwrap();
        let sig = kp.sign(b"hello");
        IdentityKeyPair::verify(&kp.public, b"hello", &sig).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let kp = IdentityKeyPair::generate().unwrap();
        let sig = kp.sign(b"hello");
        assert!(IdentityKeyPair::verify(&kp.public, b"goodbye", &sig).is_err());
    }

    #[test]
    fn from_bytes_roundtrips_public_key() {
        let kp = IdentityKeyPair::generate().unwrap();
        let secret = *kp.secret_bytes();
        let kp2 = IdentityKeyPair::from_bytes(&secret).unwrap();
        assert_eq!(kp.public, kp2.public);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let kp = IdentityKeyPair::generate().unwrap();
        assert_eq!(kp.public.fingerprint(), kp.public.fingerprint());
    }

    #[test]
    fn ed25519_to_x25519_conversion_is_deterministic() {
        let kp = IdentityKeyPair::generate().unwrap();
        let x1 = kp.to_x25519_secret();
        let x2 = ed25519_secret_to_x25519(kp.secret_bytes());
        assert_eq!(x1.to_bytes(), x2.to_bytes());
    }
}
