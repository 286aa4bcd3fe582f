//! Cryptographic primitives for the Cypher Protocol client core.
//!
//! This crate has no knowledge of storage, transport, or wire framing — it
//! exposes pure functions and small zeroizing key types over:
//!
//!   - [`aead`]: AES-GCM-256 (sealed records) and ChaCha20-Poly1305 (ratchet)
//!   - [`kdf`]: HKDF-SHA512 root/chain and password-based key derivation
//!   - [`hash`]: BLAKE3 content hashing, the ratchet header AAD construction
//!   - [`identity`]: Ed25519 identity/device keys and their X25519 conversion
//!   - [`x3dh`]: X3DH asynchronous key agreement
//!   - [`ratchet`]: the Double Ratchet session state machine
//!
//! Every type holding secret material zeroizes on drop.

pub mod aead;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
