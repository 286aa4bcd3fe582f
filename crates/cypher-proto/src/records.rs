//! Persisted record shapes (§3). These are the plaintext views a sealed
//! record decrypts into — `cypher-store` owns sealing/unsealing, this
//! crate only owns the shape and its BSON encoding.

use chrono::{DateTime, Utc};
use cypher_crypto::{identity::PublicKeyBytes, ratchet::RatchetStateSnapshot};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `registryMode` (§3 DeviceConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryMode {
    Master,
    Child,
    Unregistered,
}

/// One app instance's local configuration — exactly one per install (§3).
#[derive(Serialize, Deserialize)]
pub struct DeviceConfig {
    pub username: String,
    pub device_id: Uuid,
    pub registry_mode: RegistryMode,
    /// Ed25519 identity signing key, present only on the device that
    /// minted the account or that has synced it via `_/devices/announce`.
    pub identity_secret: [u8; 32],
    pub device_secret: [u8; 32],
    /// X25519 static secret behind this device's advertised signed prekey
    /// (§4.3 PrekeyBundle); paired with the `public_key` published in this
    /// device's `UserDeviceConfig`.
    pub signed_prekey_secret: [u8; 32],
    /// Seals every record other than this one (§4.1, §6.1).
    pub database_encryption_key: [u8; 32],
    pub last_known_user_config: Option<UserConfig>,
}

/// A single device's advertised public material, as distributed inside a
/// `UserConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDeviceConfig {
    pub device_id: Uuid,
    pub device_name: String,
    /// X25519 signed-prekey public key (§4.3 PrekeyBundle.signed_prekey).
    pub public_key: PublicKeyBytes,
    /// Signature by this user's identity key over `public_key`, carried
    /// alongside it so any peer can build a `PrekeyBundle` without a
    /// separate round trip.
    pub signed_prekey_signature: Vec<u8>,
    pub is_master_device: bool,
}

/// The signed, registry-fetched view of one user's device list (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub identity_public_key: PublicKeyBytes,
    pub devices: Vec<UserDeviceConfig>,
    /// Ed25519 signature over the canonical BSON of `devices`, by
    /// `identity_public_key` (§6.3).
    pub signature: Vec<u8>,
}

/// A local record of one known remote device, one per (username, deviceId)
/// pair the Identity & Device Registry has seen (§3, §4.2).
#[derive(Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: Uuid,
    pub username: String,
    pub device_id: Uuid,
    /// Stable among this user's known device identities, assigned once at
    /// creation, drawn uniformly from `[1, 2^63)` (§4.2). Rust has no native
    /// 63-bit unsigned type, so the sign bit of the backing `i64` is always
    /// clear.
    pub sender_id: i64,
    pub public_key: PublicKeyBytes,
    pub signed_prekey_signature: Vec<u8>,
    pub identity: PublicKeyBytes,
    pub is_master_device: bool,
    /// Locally assigned, defaults to none; set by `_/devices/rename` (§4.7).
    #[serde(default)]
    pub device_name: Option<String>,
    pub ratchet_state: Option<RatchetStateSnapshot>,
    pub last_rekey: Option<DateTime<Utc>>,
    pub server_verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub username: String,
    pub user_config: UserConfig,
    pub metadata: bson::Document,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub members: Vec<String>,
    pub kicked_members: Vec<String>,
    pub metadata: bson::Document,
    pub local_order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    None,
    Undelivered,
    Received,
    Read,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: i64,
    pub order: i64,
    /// Globally unique, allocated by the sender; persistence rejects
    /// duplicates (§3, §8 Idempotence).
    pub remote_id: String,
    pub send_date: DateTime<Utc>,
    pub receive_date: Option<DateTime<Utc>>,
    pub delivery_state: DeliveryState,
    pub text: Option<String>,
    pub metadata: bson::Document,
    pub sender_user: String,
    pub sender_device_id: Uuid,
    /// Per-recipient-device delivery state, for messages addressed to more
    /// than one device.
    pub per_device_delivery_states: std::collections::HashMap<Uuid, DeliveryState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task_key: String,
    pub payload: bson::Document,
    pub scheduled_at: DateTime<Utc>,
    pub delayed_until: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub is_background_task: bool,
}
