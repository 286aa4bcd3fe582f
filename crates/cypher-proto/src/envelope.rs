//! Envelopes: the signed ratchet container (§4.4) and the multi-recipient
//! fan-out envelope (§4.5, §6.3).

use chrono::{DateTime, Utc};
use cypher_crypto::{ratchet::RatchetHeader, x3dh::X3dhInitHeader};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One ratchet-encrypted payload, signed by the sender's long-term
/// identity key (§4.4 "Signed-envelope contract").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetedCypherMessage {
    pub header: RatchetHeader,
    pub ciphertext: Vec<u8>,
    /// True when this message carries a fresh handshake (`rekey` per §4.4).
    pub rekey: bool,
    /// Present only on the first message of a freshly initiated session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x3dh_header: Option<X3dhInitHeader>,
    /// Used by the replay/ordering defense (§4.4): messages at or before
    /// the receiving device's `lastRekey` are dropped.
    pub created_at: DateTime<Utc>,
    /// Ed25519 signature over the canonical BSON of every field above,
    /// by the sender's long-term signing key.
    pub signature: Vec<u8>,
}

/// One recipient device's wrapped copy of a multi-recipient content key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerKey {
    pub username: String,
    pub device_id: Uuid,
    pub message: RatchetedCypherMessage,
}

/// One AEAD-sealed payload plus one ratchet-wrapped copy of its content key
/// per recipient device (§4.5, GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiRecipientEnvelope {
    pub envelope_id: Uuid,
    pub sender_username: String,
    pub sender_device_id: Uuid,
    pub sent_at: DateTime<Utc>,
    /// AES-GCM-256 combined (`nonce ‖ ciphertext ‖ tag`) of the BSON-encoded
    /// message body, under a random per-envelope content key.
    pub ciphertext: Vec<u8>,
    /// Ed25519 signature over `ciphertext`, by the sender's device
    /// identity key.
    pub signature: Vec<u8>,
    pub keys: Vec<ContainerKey>,
}

impl MultiRecipientEnvelope {
    /// Locate the key entry addressed to `(username, device_id)`, if any.
    pub fn key_for(&self, username: &str, device_id: Uuid) -> Option<&ContainerKey> {
        self.keys
            .iter()
            .find(|k| k.username == username && k.device_id == device_id)
    }
}
