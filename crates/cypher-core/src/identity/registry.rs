//! Identity & Device Registry (§4.2): tracks peers and their device lists,
//! enforces per-peer identity consistency, and creates local
//! [`DeviceIdentity`] records.

use std::collections::HashSet;
use std::sync::Arc;

use cypher_crypto::identity::PublicKeyBytes;
use cypher_proto::{
    codec,
    records::{Contact, DeviceIdentity, UserConfig, UserDeviceConfig},
};
use parking_lot::Mutex;
use rand::Rng;
use uuid::Uuid;

use crate::error::CoreError;
use crate::transport::Transport;
use cypher_store::{KeyStore, Storage};

/// Result of reconciling a freshly fetched [`UserConfig`] against a known
/// contact (§4.2 `updateUserIdentity`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityUpdate {
    NewIdentity,
    ChangedIdentity,
    Consistent,
}

pub struct IdentityRegistry {
    storage: Arc<dyn Storage>,
    key_store: KeyStore,
    transport: Arc<dyn Transport>,
    local_username: String,
    local_device_id: Uuid,
    /// Per-process memo of usernames already rediscovered this run (§4.2).
    rediscovered_usernames: Mutex<HashSet<String>>,
}

impl IdentityRegistry {
    pub fn new(
        storage: Arc<dyn Storage>,
        key_store: KeyStore,
        transport: Arc<dyn Transport>,
        local_username: String,
        local_device_id: Uuid,
    ) -> Self {
        Self {
            storage,
            key_store,
            transport,
            local_username,
            local_device_id,
            rediscovered_usernames: Mutex::new(HashSet::new()),
        }
    }

    /// §4.2 `updateUserIdentity`.
    pub async fn update_user_identity(&self, username: &str, new_config: UserConfig) -> Result<IdentityUpdate, CoreError> {
        match self.storage.find_contact_by_username(username).await? {
            None => {
                let contact = Contact {
                    id: Uuid::new_v4(),
                    username: username.to_string(),
                    user_config: new_config,
                    metadata: bson::Document::new(),
                };
                let sealed = self.key_store.seal(&contact).await?;
                self.storage.put_contact(contact.id, &sealed, username).await?;
                Ok(IdentityUpdate::NewIdentity)
            }
            Some((id, sealed)) => {
                let mut contact: Contact = self.key_store.open(&sealed).await?;
                if contact.user_config.identity_public_key == new_config.identity_public_key {
                    Ok(IdentityUpdate::Consistent)
                } else {
                    contact.user_config = new_config;
                    let sealed = self.key_store.seal(&contact).await?;
                    self.storage.put_contact(id, &sealed, username).await?;
                    Ok(IdentityUpdate::ChangedIdentity)
                }
            }
        }
    }

    /// §4.2 `createDeviceIdentity`. Refuses to shadow the local device and
    /// rejects a publicKey/identity mismatch against an existing entry for
    /// the same (username, deviceId) as `InvalidSignature`. `identity_key`
    /// is the user's long-term Ed25519 signing key (one per user, shared by
    /// every device) — callers already hold it from the enclosing
    /// `UserConfig`.
    pub async fn create_device_identity(
        &self,
        for_username: &str,
        identity_key: &PublicKeyBytes,
        device_config: &UserDeviceConfig,
    ) -> Result<DeviceIdentity, CoreError> {
        if for_username == self.local_username && device_config.device_id == self.local_device_id {
            return Err(CoreError::BadInput("refusing to create a DeviceIdentity for the local device".into()));
        }

        if let Some((id, sealed)) = self
            .storage
            .find_device_identity(for_username, device_config.device_id)
            .await?
        {
            let existing: DeviceIdentity = self.key_store.open(&sealed).await?;
            if existing.public_key != device_config.public_key || existing.identity != *identity_key {
                return Err(CoreError::InvalidSignature);
            }
            let _ = id;
            return Ok(existing);
        }

        let existing_sender_ids: HashSet<i64> = self.storage.all_sender_ids().await?.into_iter().collect();
        let sender_id = self.fresh_sender_id(&existing_sender_ids);

        let identity = DeviceIdentity {
            id: Uuid::new_v4(),
            username: for_username.to_string(),
            device_id: device_config.device_id,
            sender_id,
            public_key: device_config.public_key.clone(),
            signed_prekey_signature: device_config.signed_prekey_signature.clone(),
            identity: identity_key.clone(),
            is_master_device: device_config.is_master_device,
            device_name: Some(device_config.device_name.clone()),
            ratchet_state: None,
            last_rekey: None,
            server_verified: false,
        };
        let sealed = self.key_store.seal(&identity).await?;
        self.storage
            .put_device_identity(identity.id, &sealed, for_username, identity.device_id, sender_id)
            .await?;
        Ok(identity)
    }

    /// Draw uniformly from `[1, 2^63)`, resampling on any collision with a
    /// known senderId. `i64::MAX` is `2^63 - 1`, so the sign bit stays clear.
    fn fresh_sender_id(&self, existing: &HashSet<i64>) -> i64 {
        let mut rng = rand::thread_rng();
        loop {
            let candidate = rng.gen_range(1..=i64::MAX);
            if !existing.contains(&candidate) {
                return candidate;
            }
        }
    }

    /// §4.2 `rediscoverDeviceIdentities`: fetch the signed `UserConfig`,
    /// validate device signatures, reconcile identity, then reconcile each
    /// advertised device against known `DeviceIdentity` records.
    pub async fn rediscover_device_identities(&self, username: &str) -> Result<Vec<DeviceIdentity>, CoreError> {
        let config = self.transport.read_key_bundle(username).await?;
        self.verify_device_signature(&config)?;
        self.update_user_identity(username, config.clone()).await?;

        let mut identities = Vec::with_capacity(config.devices.len());
        for device in &config.devices {
            let identity = self.create_device_identity(username, &config.identity_public_key, device).await?;
            identities.push(identity);
        }
        self.rediscovered_usernames.lock().insert(username.to_string());
        Ok(identities)
    }

    fn verify_device_signature(&self, config: &UserConfig) -> Result<(), CoreError> {
        let payload = codec::canonical_bytes(&config.devices)?;
        cypher_crypto::identity::IdentityKeyPair::verify(&config.identity_public_key, &payload, &config.signature)
            .map_err(|_| CoreError::InvalidUserConfig)
    }

    /// §4.2 `fetchDeviceIdentities`: returns known devices, rediscovering
    /// from the registry only if none are known for a remote user.
    pub async fn fetch_device_identities(&self, username: &str) -> Result<Vec<DeviceIdentity>, CoreError> {
        let known = self.storage.device_identities_for_user(username).await?;
        if !known.is_empty() || username == self.local_username {
            let mut out = Vec::with_capacity(known.len());
            for (_, sealed) in known {
                out.push(self.key_store.open(&sealed).await?);
            }
            return Ok(out);
        }
        if self.rediscovered_usernames.lock().contains(username) {
            return Ok(Vec::new());
        }
        if !self.transport.is_authenticated() {
            return Ok(Vec::new());
        }
        self.rediscover_device_identities(username).await
    }

    /// Bulk variant of [`Self::fetch_device_identities`]: one rediscover per
    /// missing user.
    pub async fn fetch_device_identities_bulk(&self, usernames: &[String]) -> Result<Vec<DeviceIdentity>, CoreError> {
        let mut out = Vec::new();
        for username in usernames {
            out.extend(self.fetch_device_identities(username).await?);
        }
        Ok(out)
    }

    pub async fn save_device_identity(&self, identity: &DeviceIdentity) -> Result<(), CoreError> {
        let sealed = self.key_store.seal(identity).await?;
        self.storage
            .put_device_identity(identity.id, &sealed, &identity.username, identity.device_id, identity.sender_id)
            .await?;
        Ok(())
    }

    pub async fn find_device_identity(&self, username: &str, device_id: Uuid) -> Result<Option<DeviceIdentity>, CoreError> {
        match self.storage.find_device_identity(username, device_id).await? {
            Some((_, sealed)) => Ok(Some(self.key_store.open(&sealed).await?)),
            None => Ok(None),
        }
    }

    pub fn local_identity(&self) -> (&str, Uuid) {
        (&self.local_username, self.local_device_id)
    }
}
