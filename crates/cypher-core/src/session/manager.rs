//! Session Manager (§4.4): one Double Ratchet session per remote device,
//! initiated via X3DH and persisted as a [`cypher_crypto::ratchet::RatchetStateSnapshot`]
//! on the corresponding [`DeviceIdentity`].
//!
//! Callers own persistence: every method here takes `&mut DeviceIdentity` and
//! mutates its `ratchet_state`/`last_rekey` fields in place; the caller is
//! responsible for sealing and storing the updated record afterwards (via
//! `IdentityRegistry::save_device_identity`), keeping this module free of any
//! storage dependency.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use cypher_crypto::{
    identity::{IdentityKeyPair, PublicKeyBytes},
    kdf,
    ratchet::{RatchetMessage, RatchetSession},
    x3dh::{self, PrekeyBundle, X3dhInitHeader},
};
use cypher_proto::{codec, envelope::RatchetedCypherMessage, records::DeviceIdentity};
use serde::Serialize;
use x25519_dalek::StaticSecret;

use crate::error::CoreError;
use crate::plugin::CorePlugin;

/// Mirrors every [`RatchetedCypherMessage`] field except `signature` — the
/// exact payload both sides sign and verify.
#[derive(Serialize)]
struct SignaturePayload<'a> {
    header: &'a cypher_crypto::ratchet::RatchetHeader,
    ciphertext: &'a [u8],
    rekey: bool,
    x3dh_header: &'a Option<X3dhInitHeader>,
    created_at: DateTime<Utc>,
}

/// Result of a successful [`SessionManager::read_with_ratchet`] call.
#[derive(Debug)]
pub enum ReadOutcome {
    Decrypted(Vec<u8>),
    /// Decryption could not be recovered even after a rekey attempt; the
    /// caller must request a resend (§4.4, §4.7 `_/resend/message`).
    Failed,
    /// `createdAt` was at or before the device's `lastRekey` — dropped by
    /// the replay/ordering defense.
    Stale,
}

/// What the caller must additionally do after a read (§4.4 rekey recovery):
/// raise `onRekey`, and/or send back an `_/ignore` message so the peer's own
/// ratchet doesn't stall waiting for an ack of a message we could not read.
pub struct ReadSignal {
    pub outcome: ReadOutcome,
    pub rekeyed: bool,
    pub needs_ignore: bool,
}

/// Owns the local long-term identity and signed-prekey secrets; stateless
/// otherwise; every per-peer ratchet lives in its `DeviceIdentity` record.
pub struct SessionManager {
    identity: IdentityKeyPair,
    signed_prekey_secret: StaticSecret,
    local_username: String,
    plugin: Arc<dyn CorePlugin>,
    /// Serializes concurrent ratchet steps against the same device so two
    /// in-flight sends/receives can never race the same chain forward
    /// (§9 "single-writer domains").
    crypto_lock: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(
        identity: IdentityKeyPair,
        signed_prekey_secret: StaticSecret,
        local_username: String,
        plugin: Arc<dyn CorePlugin>,
    ) -> Self {
        Self {
            identity,
            signed_prekey_secret,
            local_username,
            plugin,
            crypto_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// §4.4 `writeWithRatchet`: advance (or X3DH-initiate) the session and
    /// seal `plaintext` into a signed envelope.
    pub async fn write_with_ratchet(
        &self,
        device: &mut DeviceIdentity,
        plaintext: &[u8],
    ) -> Result<RatchetedCypherMessage, CoreError> {
        let _guard = self.crypto_lock.lock().await;

        let (mut session, rekey, x3dh_header) = match device.ratchet_state.take() {
            Some(snapshot) => (RatchetSession::from_snapshot(snapshot), false, None),
            None => {
                let bundle = Self::prekey_bundle_for(device);
                let result = x3dh::initiate(&self.identity, &bundle)?;
                let root_secret = kdf::initial_root_key(&result.shared_secret, &self.local_username)?;
                let session = RatchetSession::init_alice(root_secret, bundle.signed_prekey);
                (session, true, Some(result.header))
            }
        };

        let message = session.encrypt_step(plaintext)?;
        device.ratchet_state = Some(session.to_snapshot());

        let created_at = Utc::now();
        let signature = self.sign_payload(&message.header, &message.ciphertext, rekey, &x3dh_header, created_at)?;

        Ok(RatchetedCypherMessage {
            header: message.header,
            ciphertext: message.ciphertext,
            rekey,
            x3dh_header,
            created_at,
            signature,
        })
    }

    /// §4.4 `readWithRatchet`: decrypt an inbound envelope, falling back to
    /// rekey recovery on any failure or on an explicit `rekey` handshake.
    pub async fn read_with_ratchet(
        &self,
        device: &mut DeviceIdentity,
        inbound: &RatchetedCypherMessage,
    ) -> Result<ReadSignal, CoreError> {
        let _guard = self.crypto_lock.lock().await;

        if let Some(last_rekey) = device.last_rekey {
            if inbound.created_at <= last_rekey {
                return Ok(ReadSignal {
                    outcome: ReadOutcome::Stale,
                    rekeyed: false,
                    needs_ignore: false,
                });
            }
        }

        self.verify_envelope(device, inbound)?;

        if !inbound.rekey {
            if let Some(snapshot) = device.ratchet_state.clone() {
                let mut session = RatchetSession::from_snapshot(snapshot);
                let message = RatchetMessage {
                    header: inbound.header.clone(),
                    ciphertext: inbound.ciphertext.clone(),
                };
                if let Ok(plaintext) = session.decrypt_step(&message) {
                    device.ratchet_state = Some(session.to_snapshot());
                    return Ok(ReadSignal {
                        outcome: ReadOutcome::Decrypted(plaintext),
                        rekeyed: false,
                        needs_ignore: false,
                    });
                }
            }
        }

        self.recover(device, inbound).await
    }

    /// §4.4 rekey recovery: clear the stale session, and, if this message
    /// itself carried a fresh X3DH handshake, respond to it inline so the
    /// very message that triggered recovery is not lost.
    async fn recover(&self, device: &mut DeviceIdentity, inbound: &RatchetedCypherMessage) -> Result<ReadSignal, CoreError> {
        device.ratchet_state = None;
        device.last_rekey = Some(Utc::now());
        self.plugin.on_rekey(&device.username, device.device_id).await;

        if let Some(x3dh_header) = &inbound.x3dh_header {
            let shared_secret = x3dh::respond(
                &self.identity,
                &self.signed_prekey_secret,
                None,
                &device.identity,
                x3dh_header,
            )?;
            let root_secret = kdf::initial_root_key(&shared_secret, &device.username)?;
            let mut session = RatchetSession::init_bob(root_secret, self.signed_prekey_secret.clone());
            let message = RatchetMessage {
                header: inbound.header.clone(),
                ciphertext: inbound.ciphertext.clone(),
            };
            if let Ok(plaintext) = session.decrypt_step(&message) {
                device.ratchet_state = Some(session.to_snapshot());
                return Ok(ReadSignal {
                    outcome: ReadOutcome::Decrypted(plaintext),
                    rekeyed: true,
                    needs_ignore: true,
                });
            }
        }

        Ok(ReadSignal {
            outcome: ReadOutcome::Failed,
            rekeyed: true,
            needs_ignore: true,
        })
    }

    fn prekey_bundle_for(device: &DeviceIdentity) -> PrekeyBundle {
        PrekeyBundle {
            identity_key: device.identity.clone(),
            signed_prekey: device.public_key.0,
            signed_prekey_signature: device.signed_prekey_signature.clone(),
            one_time_prekey: None,
            one_time_prekey_id: None,
        }
    }

    fn sign_payload(
        &self,
        header: &cypher_crypto::ratchet::RatchetHeader,
        ciphertext: &[u8],
        rekey: bool,
        x3dh_header: &Option<X3dhInitHeader>,
        created_at: DateTime<Utc>,
    ) -> Result<Vec<u8>, CoreError> {
        let payload = SignaturePayload {
            header,
            ciphertext,
            rekey,
            x3dh_header,
            created_at,
        };
        let signable = codec::canonical_bytes(&payload)?;
        Ok(self.identity.sign(&signable))
    }

    fn verify_envelope(&self, device: &DeviceIdentity, inbound: &RatchetedCypherMessage) -> Result<(), CoreError> {
        let payload = SignaturePayload {
            header: &inbound.header,
            ciphertext: &inbound.ciphertext,
            rekey: inbound.rekey,
            x3dh_header: &inbound.x3dh_header,
            created_at: inbound.created_at,
        };
        let signable = codec::canonical_bytes(&payload)?;
        IdentityKeyPair::verify(&device.identity, &signable, &inbound.signature).map_err(|_| CoreError::InvalidSignature)
    }

    pub fn local_identity_public_key(&self) -> &PublicKeyBytes {
        &self.identity.public
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cypher_crypto::x3dh::generate_signed_prekey;
    use uuid::Uuid;

    fn device_identity(username: &str, identity_pub: PublicKeyBytes, spk_pub: [u8; 32], spk_sig: Vec<u8>) -> DeviceIdentity {
        DeviceIdentity {
            id: Uuid::new_v4(),
            username: username.to_string(),
            device_id: Uuid::new_v4(),
            sender_id: 1,
            public_key: PublicKeyBytes(spk_pub),
            signed_prekey_signature: spk_sig,
            identity: identity_pub,
            is_master_device: true,
            device_name: None,
            ratchet_state: None,
            last_rekey: None,
            server_verified: false,
        }
    }

    #[tokio::test]
    async fn fresh_session_round_trips_and_ratchets() {
        let alice_identity = IdentityKeyPair::generate().unwrap();
        let bob_identity = IdentityKeyPair::generate().unwrap();
        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_identity);

        let alice = SessionManager::new(
            IdentityKeyPair::from_bytes(alice_identity.secret_bytes()).unwrap(),
            x25519_dalek::StaticSecret::random_from_rng(rand_core::OsRng),
            "alice".into(),
            Arc::new(crate::plugin::NoopPlugin),
        );
        let bob = SessionManager::new(
            IdentityKeyPair::from_bytes(bob_identity.secret_bytes()).unwrap(),
            bob_spk_secret,
            "bob".into(),
            Arc::new(crate::plugin::NoopPlugin),
        );

        let mut alice_view_of_bob = device_identity("bob", bob_identity.public.clone(), bob_spk_pub, bob_spk_sig.clone());
        let mut bob_view_of_alice = device_identity("alice", alice_identity.public.clone(), [0u8; 32], Vec::new());

        let envelope = alice.write_with_ratchet(&mut alice_view_of_bob, b"hello bob").await.unwrap();
        assert!(envelope.rekey);
        assert!(envelope.x3dh_header.is_some());

        let signal = bob.read_with_ratchet(&mut bob_view_of_alice, &envelope).await.unwrap();
        assert!(signal.rekeyed);
        match signal.outcome {
            ReadOutcome::Decrypted(plaintext) => assert_eq!(plaintext, b"hello bob"),
            other => panic!("expected decrypted plaintext, got {other:?}"),
        }

        let reply = bob.write_with_ratchet(&mut bob_view_of_alice, b"hi alice").await.unwrap();
        assert!(!reply.rekey);
        let signal = alice.read_with_ratchet(&mut alice_view_of_bob, &reply).await.unwrap();
        match signal.outcome {
            ReadOutcome::Decrypted(plaintext) => assert_eq!(plaintext, b"hi alice"),
            other => panic!("expected decrypted plaintext, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_message_is_dropped() {
        let identity = IdentityKeyPair::generate().unwrap();
        let remote_identity = IdentityKeyPair::generate().unwrap();
        let (spk_secret, spk_pub, spk_sig) = generate_signed_prekey(&remote_identity);
        let _ = spk_secret;

        let manager = SessionManager::new(
            IdentityKeyPair::from_bytes(identity.secret_bytes()).unwrap(),
            x25519_dalek::StaticSecret::random_from_rng(rand_core::OsRng),
            "alice".into(),
            Arc::new(crate::plugin::NoopPlugin),
        );

        let mut device = device_identity("bob", remote_identity.public.clone(), spk_pub, spk_sig);
        device.last_rekey = Some(Utc::now());

        let stale = RatchetedCypherMessage {
            header: cypher_crypto::ratchet::RatchetHeader { dh_pub: [0u8; 32], n: 0, pn: 0 },
            ciphertext: vec![1, 2, 3],
            rekey: false,
            x3dh_header: None,
            created_at: device.last_rekey.unwrap() - chrono::Duration::seconds(1),
            signature: vec![],
        };

        let signal = manager.read_with_ratchet(&mut device, &stale).await.unwrap();
        assert!(matches!(signal.outcome, ReadOutcome::Stale));
    }
}
