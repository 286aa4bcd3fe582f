//! The Double Ratchet: a DH ratchet over sending/receiving chains, each
//! chain advanced by a symmetric KDF per message (§4.3).
//!
//! Wire encoding of [`RatchetHeader`] and [`RatchetMessage`] is owned by
//! `cypher-proto`; this module only needs a canonical byte representation
//! of the header to compute the AEAD associated data, produced by
//! [`RatchetHeader::canonical_bytes`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{aead, error::CryptoError, hash, kdf};

/// Skipped-message-key cache bound (§4.3): beyond this many undelivered
/// messages on one chain, older skipped keys are evicted oldest-first.
pub const MAX_SKIP: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetHeader {
    #[serde(with = "pub_key_serde")]
    pub dh_pub: [u8; 32],
    pub n: u64,
    pub pn: u64,
}

impl RatchetHeader {
    /// Deterministic byte layout used only to compute the AEAD associated
    /// data; not the wire format (that's `cypher-proto`'s BSON codec).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48);
        out.extend_from_slice(&self.dh_pub);
        out.extend_from_slice(&self.n.to_le_bytes());
        out.extend_from_slice(&self.pn.to_le_bytes());
        out
    }

    fn associated_data(&self) -> [u8; 32] {
        hash::header_associated_data(&self.canonical_bytes())
    }
}

pub struct RatchetMessage {
    pub header: RatchetHeader,
    pub ciphertext: Vec<u8>,
}

/// One party's half of an established Double Ratchet session. Every secret
/// field is zeroized on drop.
pub struct RatchetSession {
    root_key: [u8; 32],
    dh_send_secret: x25519_dalek::StaticSecret,
    #[allow(dead_code)]
    dh_send_pub: [u8; 32],
    send_chain_key: Option<[u8; 32]>,
    send_n: u64,

    dh_recv_pub: Option<[u8; 32]>,
    recv_chain_key: Option<[u8; 32]>,
    recv_n: u64,

    prev_send_n: u64,
    skipped_keys: HashMap<(Vec<u8>, u64), [u8; 32]>,
    /// Insertion order of `skipped_keys`, oldest first, for MAX_SKIP eviction.
    skip_order: Vec<(Vec<u8>, u64)>,
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(ck) = self.send_chain_key.as_mut() {
            ck.zeroize();
        }
        if let Some(ck) = self.recv_chain_key.as_mut() {
            ck.zeroize();
        }
        for key in self.skipped_keys.values_mut() {
            key.zeroize();
        }
    }
}

impl RatchetSession {
    /// Alice's side: she has just computed the X3DH shared secret and knows
    /// Bob's current ratchet public key (his signed prekey).
    pub fn init_alice(
        shared_secret: [u8; 32],
        bob_ratchet_pub: [u8; 32],
    ) -> Self {
        let dh_send_secret = x25519_dalek::StaticSecret::random_from_rng(rand_core::OsRng);
        let dh_send_pub = *x25519_dalek::PublicKey::from(&dh_send_secret).as_bytes();

        let dh_output = dh_send_secret.diffie_hellman(&x25519_dalek::PublicKey::from(bob_ratchet_pub));
        let (root_key, send_chain_key) = kdf::kdf_rk(&shared_secret, dh_output.as_bytes())
            .expect("HKDF expand with fixed-size output cannot fail");

        Self {
            root_key,
            dh_send_secret,
            dh_send_pub,
            send_chain_key: Some(send_chain_key),
            send_n: 0,
            dh_recv_pub: Some(bob_ratchet_pub),
            recv_chain_key: None,
            recv_n: 0,
            prev_send_n: 0,
            skipped_keys: HashMap::new(),
            skip_order: Vec::new(),
        }
    }

    /// Bob's side: he generated `bob_ratchet_secret`/`bob_ratchet_pub` as his
    /// signed prekey and has just derived the X3DH shared secret himself.
    pub fn init_bob(
        shared_secret: [u8; 32],
        bob_ratchet_secret: x25519_dalek::StaticSecret,
    ) -> Self {
        let dh_send_pub = *x25519_dalek::PublicKey::from(&bob_ratchet_secret).as_bytes();
        Self {
            root_key: shared_secret,
            dh_send_secret: bob_ratchet_secret,
            dh_send_pub,
            send_chain_key: None,
            send_n: 0,
            dh_recv_pub: None,
            recv_chain_key: None,
            recv_n: 0,
            prev_send_n: 0,
            skipped_keys: HashMap::new(),
            skip_order: Vec::new(),
        }
    }

    pub fn dh_public(&self) -> [u8; 32] {
        self.dh_send_pub
    }

    /// Advance the sending chain by one message and seal `plaintext`.
    pub fn encrypt_step(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, CryptoError> {
        let chain_key = self
            .send_chain_key
            .as_ref()
            .ok_or(CryptoError::SessionNotInitialised)?;
        let (next_chain_key, message_key) = kdf::kdf_ck(chain_key)?;
        self.send_chain_key = Some(next_chain_key);

        let header = RatchetHeader {
            dh_pub: self.dh_send_pub,
            n: self.send_n,
            pn: self.prev_send_n,
        };
        self.send_n += 1;

        let aad = header.associated_data();
        let ciphertext = aead::ratchet_encrypt(&message_key, plaintext, &aad)?;
        Ok(RatchetMessage { header, ciphertext })
    }

    /// Decrypt one incoming message, performing a DH ratchet step first if
    /// the header names a new remote public key, and skipping forward over
    /// any out-of-order gap.
    pub fn decrypt_step(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, CryptoError> {
        let header = &message.header;

        if let Some(plaintext) = self.try_skipped(header, message)? {
            return Ok(plaintext);
        }

        if self.dh_recv_pub != Some(header.dh_pub) {
            self.skip_message_keys(header.pn)?;
            self.dh_ratchet(header.dh_pub)?;
        }

        self.skip_message_keys(header.n)?;

        let chain_key = self
            .recv_chain_key
            .as_ref()
            .ok_or(CryptoError::SessionNotInitialised)?;
        let (next_chain_key, message_key) = kdf::kdf_ck(chain_key)?;
        self.recv_chain_key = Some(next_chain_key);
        self.recv_n += 1;

        let aad = header.associated_data();
        let plaintext = aead::ratchet_decrypt(&message_key, &message.ciphertext, &aad)?;
        Ok(plaintext.to_vec())
    }

    fn try_skipped(&mut self, header: &RatchetHeader, message: &RatchetMessage) -> Result<Option<Vec<u8>>, CryptoError> {
        let map_key = (header.dh_pub.to_vec(), header.n);
        if let Some(message_key) = self.skipped_keys.remove(&map_key) {
            self.skip_order.retain(|k| k != &map_key);
            let aad = header.associated_data();
            let plaintext = aead::ratchet_decrypt(&message_key, &message.ciphertext, &aad)?;
            return Ok(Some(plaintext.to_vec()));
        }
        Ok(None)
    }

    fn dh_ratchet(&mut self, remote_pub: [u8; 32]) -> Result<(), CryptoError> {
        self.prev_send_n = self.send_n;
        self.send_n = 0;
        self.recv_n = 0;
        self.dh_recv_pub = Some(remote_pub);

        let dh_recv_output = self.dh_send_secret.diffie_hellman(&x25519_dalek::PublicKey::from(remote_pub));
        let (root_key, recv_chain_key) = kdf::kdf_rk(&self.root_key, dh_recv_output.as_bytes())?;
        self.root_key = root_key;
        self.recv_chain_key = Some(recv_chain_key);

        let new_secret = x25519_dalek::StaticSecret::random_from_rng(rand_core::OsRng);
        self.dh_send_pub = *x25519_dalek::PublicKey::from(&new_secret).as_bytes();
        self.dh_send_secret = new_secret;

        let dh_send_output = self.dh_send_secret.diffie_hellman(&x25519_dalek::PublicKey::from(remote_pub));
        let (root_key, send_chain_key) = kdf::kdf_rk(&self.root_key, dh_send_output.as_bytes())?;
        self.root_key = root_key;
        self.send_chain_key = Some(send_chain_key);
        Ok(())
    }

    /// Derive and cache message keys for every index up to (not including)
    /// `until`, bounded by [`MAX_SKIP`] with oldest-first eviction.
    fn skip_message_keys(&mut self, until: u64) -> Result<(), CryptoError> {
        if self.recv_chain_key.is_none() {
            return Ok(());
        }
        if until.saturating_sub(self.recv_n) > MAX_SKIP {
            return Err(CryptoError::SkippedKeyBudgetExceeded(until - self.recv_n));
        }
        let dh_pub = self.dh_recv_pub.unwrap_or([0u8; 32]);
        while self.recv_n < until {
            let chain_key = self.recv_chain_key.as_ref().expect("checked above");
            let (next_chain_key, message_key) = kdf::kdf_ck(chain_key)?;
            let map_key = (dh_pub.to_vec(), self.recv_n);
            self.recv_chain_key = Some(next_chain_key);
            self.skipped_keys.insert(map_key.clone(), message_key);
            self.skip_order.push(map_key);
            self.recv_n += 1;

            while self.skip_order.len() > MAX_SKIP as usize {
                let oldest = self.skip_order.remove(0);
                if let Some(mut key) = self.skipped_keys.remove(&oldest) {
                    key.zeroize();
                }
            }
        }
        Ok(())
    }
}

/// Serializable snapshot of a [`RatchetSession`], for persistence between
/// process runs. Carries the same secrets the live session does — callers
/// are responsible for sealing it before it touches disk.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetStateSnapshot {
    pub root_key: [u8; 32],
    pub dh_send_secret: [u8; 32],
    pub dh_send_pub: [u8; 32],
    pub send_chain_key: Option<[u8; 32]>,
    pub send_n: u64,
    pub dh_recv_pub: Option<[u8; 32]>,
    pub recv_chain_key: Option<[u8; 32]>,
    pub recv_n: u64,
    pub prev_send_n: u64,
    pub skipped_keys: Vec<(Vec<u8>, u64, [u8; 32])>,
}

impl Drop for RatchetStateSnapshot {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_send_secret.zeroize();
        if let Some(ck) = self.send_chain_key.as_mut() {
            ck.zeroize();
        }
        if let Some(ck) = self.recv_chain_key.as_mut() {
            ck.zeroize();
        }
        for (_, _, key) in self.skipped_keys.iter_mut() {
            key.zeroize();
        }
    }
}

impl RatchetSession {
    pub fn to_snapshot(&self) -> RatchetStateSnapshot {
        RatchetStateSnapshot {
            root_key: self.root_key,
            dh_send_secret: self.dh_send_secret.to_bytes(),
            dh_send_pub: self.dh_send_pub,
            send_chain_key: self.send_chain_key,
            send_n: self.send_n,
            dh_recv_pub: self.dh_recv_pub,
            recv_chain_key: self.recv_chain_key,
            recv_n: self.recv_n,
            prev_send_n: self.prev_send_n,
            skipped_keys: self
                .skip_order
                .iter()
                .map(|k| (k.0.clone(), k.1, self.skipped_keys[k]))
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: RatchetStateSnapshot) -> Self {
        let skip_order: Vec<(Vec<u8>, u64)> = snapshot
            .skipped_keys
            .iter()
            .map(|(pub_key, n, _)| (pub_key.clone(), *n))
            .collect();
        let skipped_keys = snapshot
            .skipped_keys
            .into_iter()
            .map(|(pub_key, n, key)| ((pub_key, n), key))
            .collect();
        Self {
            root_key: snapshot.root_key,
            dh_send_secret: x25519_dalek::StaticSecret::from(snapshot.dh_send_secret),
            dh_send_pub: snapshot.dh_send_pub,
            send_chain_key: snapshot.send_chain_key,
            send_n: snapshot.send_n,
            dh_recv_pub: snapshot.dh_recv_pub,
            recv_chain_key: snapshot.recv_chain_key,
            recv_n: snapshot.recv_n,
            prev_send_n: snapshot.prev_send_n,
            skipped_keys,
            skip_order,
        }
    }
}

mod pub_key_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(key)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let bytes: Vec<u8> = Vec::deserialize(d)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32-byte public key"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_sessions() -> (RatchetSession, RatchetSession) {
        let shared_secret = [42u8; 32];
        let bob_secret = x25519_dalek::StaticSecret::random_from_rng(rand_core::OsRng);
        let bob_pub = *x25519_dalek::PublicKey::from(&bob_secret).as_bytes();

        let alice = RatchetSession::init_alice(shared_secret, bob_pub);
        let bob = RatchetSession::init_bob(shared_secret, bob_secret);
        (alice, bob)
    }

    #[test]
    fn full_ratchet_roundtrip() {
        let (mut alice, mut bob) = paired_sessions();

        let msg1 = alice.encrypt_step(b"hello bob").unwrap();
        let pt1 = bob.decrypt_step(&msg1).unwrap();
        assert_eq!(pt1, b"hello bob");

        let msg2 = bob.encrypt_step(b"hi alice").unwrap();
        let pt2 = alice.decrypt_step(&msg2).unwrap();
        assert_eq!(pt2, b"hi alice");

        let msg3 = alice.encrypt_step(b"how are you").unwrap();
        let pt3 = bob.decrypt_step(&msg3).unwrap();
        assert_eq!(pt3, b"how are you");
    }

    #[test]
    fn out_of_order_messages() {
        let (mut alice, mut bob) = paired_sessions();

        let msg1 = alice.encrypt_step(b"one").unwrap();
        let msg2 = alice.encrypt_step(b"two").unwrap();
        let msg3 = alice.encrypt_step(b"three").unwrap();

        let pt3 = bob.decrypt_step(&msg3).unwrap();
        assert_eq!(pt3, b"three");

        let pt1 = bob.decrypt_step(&msg1).unwrap();
        assert_eq!(pt1, b"one");

        let _ = msg2;
    }

    #[test]
    fn skip_budget_exceeded_errors() {
        let (mut alice, mut bob) = paired_sessions();
        for _ in 0..(MAX_SKIP + 5) {
            let _ = alice.encrypt_step(b"x").unwrap();
        }
        let last = alice.encrypt_step(b"final").unwrap();
        assert!(bob.decrypt_step(&last).is_err());
    }
}
