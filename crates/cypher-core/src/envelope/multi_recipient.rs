//! Multi-Recipient Envelope (§4.5): one random content key AES-GCM-seals the
//! body once, and each recipient device gets its own ratchet-wrapped copy of
//! that key rather than a separately-encrypted body.

use chrono::{DateTime, Utc};
use cypher_crypto::{aead, identity::IdentityKeyPair};
use cypher_proto::{
    codec,
    envelope::{ContainerKey, MultiRecipientEnvelope},
    records::DeviceIdentity,
};
use rand::RngCore;
use serde::Serialize;
use uuid::Uuid;

use crate::error::CoreError;
use crate::session::SessionManager;

#[derive(Serialize)]
struct EnvelopeSignaturePayload<'a> {
    envelope_id: Uuid,
    sender_username: &'a str,
    sender_device_id: Uuid,
    sent_at: DateTime<Utc>,
    ciphertext: &'a [u8],
}

/// §4.5 steps 1-4. `recipients` are this conversation's addressed devices;
/// each one's `ratchet_state` is advanced (or freshly X3DH-initiated) in
/// place. If any later recipient's `writeWithRatchet` call fails, every
/// device that was freshly rekeyed earlier in this same call is rolled back
/// to `ratchet_state = None`, so its peer's next inbound message re-triggers
/// a handshake instead of decrypting against a key it never received.
pub async fn build_multi_recipient_envelope(
    session_manager: &SessionManager,
    identity: &IdentityKeyPair,
    sender_username: &str,
    sender_device_id: Uuid,
    body: &impl Serialize,
    recipients: &mut [DeviceIdentity],
) -> Result<MultiRecipientEnvelope, CoreError> {
    let mut content_key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut content_key);

    let plaintext = codec::to_bson_bytes(body)?;
    let ciphertext = aead::seal(&content_key, &plaintext, b"")?;

    let mut keys = Vec::with_capacity(recipients.len());
    let mut freshly_rekeyed = Vec::new();

    for (idx, device) in recipients.iter_mut().enumerate() {
        match session_manager.write_with_ratchet(device, &content_key).await {
            Ok(message) => {
                if message.rekey {
                    freshly_rekeyed.push(idx);
                }
                keys.push(ContainerKey {
                    username: device.username.clone(),
                    device_id: device.device_id,
                    message,
                });
            }
            Err(err) => {
                for idx in freshly_rekeyed {
                    recipients[idx].ratchet_state = None;
                }
                return Err(err);
            }
        }
    }

    let envelope_id = Uuid::new_v4();
    let sent_at = Utc::now();
    let signature = sign_envelope(identity, envelope_id, sender_username, sender_device_id, sent_at, &ciphertext);

    Ok(MultiRecipientEnvelope {
        envelope_id,
        sender_username: sender_username.to_string(),
        sender_device_id,
        sent_at,
        ciphertext,
        signature,
        keys,
    })
}

/// Outcome of [`open_multi_recipient_envelope`], mirroring `ReadSignal` so
/// the caller can satisfy §4.4's rekey-recovery and replay-defense side
/// effects (an outbound `_/ignore` and/or a resend request) instead of just
/// seeing an opaque error.
pub enum OpenedEnvelope {
    Decrypted(Vec<u8>),
    /// `createdAt` was at or before the sender's `lastRekey` — the caller
    /// must request a resend.
    Stale,
    /// Decrypt failed even after rekey recovery — the caller must send
    /// `_/ignore` and request a resend.
    Failed,
}

/// Receiver side of §4.5: find our container key, recover the content key
/// through the sender's ratchet, then open the shared ciphertext. `device`
/// is the local registry's `DeviceIdentity` record for the envelope's
/// sender.
pub async fn open_multi_recipient_envelope(
    session_manager: &SessionManager,
    device: &mut DeviceIdentity,
    local_username: &str,
    local_device_id: Uuid,
    envelope: &MultiRecipientEnvelope,
) -> Result<OpenedEnvelope, CoreError> {
    let container = envelope
        .key_for(local_username, local_device_id)
        .ok_or_else(|| CoreError::BadInput("envelope carries no container key for this device".into()))?;

    let signal = session_manager.read_with_ratchet(device, &container.message).await?;
    let key_bytes = match signal.outcome {
        crate::session::ReadOutcome::Decrypted(bytes) => bytes,
        crate::session::ReadOutcome::Stale => return Ok(OpenedEnvelope::Stale),
        crate::session::ReadOutcome::Failed => return Ok(OpenedEnvelope::Failed),
    };
    let content_key: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| CoreError::InvalidMultiRecipientKey)?;

    let plaintext = aead::open(&content_key, &envelope.ciphertext, b"")?;

    verify_envelope(&device.identity, envelope)?;

    Ok(OpenedEnvelope::Decrypted(plaintext.to_vec()))
}

fn sign_envelope(
    identity: &IdentityKeyPair,
    envelope_id: Uuid,
    sender_username: &str,
    sender_device_id: Uuid,
    sent_at: DateTime<Utc>,
    ciphertext: &[u8],
) -> Vec<u8> {
    let payload = EnvelopeSignaturePayload {
        envelope_id,
        sender_username,
        sender_device_id,
        sent_at,
        ciphertext,
    };
    let signable = codec::canonical_bytes(&payload).expect("envelope payload always encodes");
    identity.sign(&signable)
}

fn verify_envelope(sender_identity: &cypher_crypto::identity::PublicKeyBytes, envelope: &MultiRecipientEnvelope) -> Result<(), CoreError> {
    let payload = EnvelopeSignaturePayload {
        envelope_id: envelope.envelope_id,
        sender_username: &envelope.sender_username,
        sender_device_id: envelope.sender_device_id,
        sent_at: envelope.sent_at,
        ciphertext: &envelope.ciphertext,
    };
    let signable = codec::canonical_bytes(&payload)?;
    IdentityKeyPair::verify(sender_identity, &signable, &envelope.signature).map_err(|_| CoreError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::NoopPlugin;
    use cypher_crypto::x3dh::generate_signed_prekey;
    use serde::Deserialize;
    use std::sync::Arc;
    use uuid::Uuid;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Body {
        text: String,
    }

    fn device_identity(username: &str, identity_pub: cypher_crypto::identity::PublicKeyBytes, spk_pub: [u8; 32], spk_sig: Vec<u8>) -> DeviceIdentity {
        DeviceIdentity {
            id: Uuid::new_v4(),
            username: username.to_string(),
            device_id: Uuid::new_v4(),
            sender_id: 1,
            public_key: cypher_crypto::identity::PublicKeyBytes(spk_pub),
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
    async fn round_trips_to_a_single_recipient() {
        let alice_identity = IdentityKeyPair::generate().unwrap();
        let bob_identity = IdentityKeyPair::generate().unwrap();
        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_identity);

        let alice_manager = SessionManager::new(
            IdentityKeyPair::from_bytes(alice_identity.secret_bytes()).unwrap(),
            x25519_dalek::StaticSecret::random_from_rng(rand_core::OsRng),
            "alice".into(),
            Arc::new(NoopPlugin),
        );
        let bob_manager = SessionManager::new(
            IdentityKeyPair::from_bytes(bob_identity.secret_bytes()).unwrap(),
            bob_spk_secret,
            "bob".into(),
            Arc::new(NoopPlugin),
        );

        let mut alice_view_of_bob = device_identity("bob", bob_identity.public.clone(), bob_spk_pub, bob_spk_sig);
        let bob_device_id = alice_view_of_bob.device_id;

        let envelope = build_multi_recipient_envelope(
            &alice_manager,
            &alice_identity,
            "alice",
            Uuid::new_v4(),
            &Body { text: "hi".into() },
            std::slice::from_mut(&mut alice_view_of_bob),
        )
        .await
        .unwrap();

        let mut bob_view_of_alice = device_identity("alice", alice_identity.public.clone(), [0u8; 32], Vec::new());

        let opened = open_multi_recipient_envelope(&bob_manager, &mut bob_view_of_alice, "bob", bob_device_id, &envelope)
            .await
            .unwrap();
        let OpenedEnvelope::Decrypted(plaintext) = opened else {
            panic!("expected a decrypted envelope");
        };
        let body: Body = codec::from_bson_bytes(&plaintext).unwrap();
        assert_eq!(body.text, "hi");
    }
}
