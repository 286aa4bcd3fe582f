//! KeyStore & Sealed Records (§4.1).
//!
//! Two key tiers:
//!   - `appEncryptionKey`, derived from the user's password and a per-install
//!     device salt, seals/opens the `DeviceConfig` blob itself.
//!   - `databaseEncryptionKey`, a random key carried inside the now-open
//!     `DeviceConfig`, seals every other record. It lives in memory only
//!     while the store is unlocked.

use cypher_crypto::{aead, kdf};
use cypher_proto::{codec, records::DeviceConfig};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::ZeroizeOnDrop;

use crate::error::StoreError;

const RECORD_AAD: &[u8] = b"cypher-record-v1";

#[derive(ZeroizeOnDrop)]
struct Unlocked {
    database_encryption_key: [u8; 32],
}

/// Holds the in-memory `databaseEncryptionKey` once unlocked; zeroized on
/// lock and on drop.
#[derive(Clone)]
pub struct KeyStore {
    inner: Arc<RwLock<Option<Unlocked>>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    /// Derive `appEncryptionKey` from `password`/`device_salt`, open the
    /// sealed `DeviceConfig` blob, and hold its `databaseEncryptionKey` in
    /// memory for subsequent record seal/open calls.
    pub async fn unlock(
        &self,
        password: &[u8],
        device_salt: &[u8],
        sealed_device_config: &[u8],
    ) -> Result<DeviceConfig, StoreError> {
        let app_key = kdf::app_key_from_password(password, device_salt)?;
        let plaintext = aead::open(&app_key.0, sealed_device_config, b"")
            .map_err(|_| StoreError::CorruptConfig)?;
        let config: DeviceConfig = codec::from_bson_bytes(&plaintext)?;

        let mut guard = self.inner.write().await;
        *guard = Some(Unlocked {
            database_encryption_key: config.database_encryption_key,
        });
        Ok(config)
    }

    /// `canDecrypt` (§4.1): password verification without mutating state.
    pub fn can_unlock(password: &[u8], device_salt: &[u8], sealed_device_config: &[u8]) -> bool {
        match kdf::app_key_from_password(password, device_salt) {
            Ok(app_key) => aead::can_decrypt(&app_key.0, sealed_device_config, b""),
            Err(_) => false,
        }
    }

    /// Seal a fresh or updated `DeviceConfig` under its `appEncryptionKey`.
    pub fn seal_device_config(
        password: &[u8],
        device_salt: &[u8],
        config: &DeviceConfig,
    ) -> Result<Vec<u8>, StoreError> {
        let app_key = kdf::app_key_from_password(password, device_salt)?;
        let plaintext = codec::to_bson_bytes(config)?;
        Ok(aead::seal(&app_key.0, &plaintext, b"")?)
    }

    pub async fn lock(&self) {
        let mut guard = self.inner.write().await;
        *guard = None;
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.read().await.is_none()
    }

    /// Serialize `value` to BSON and seal it under the in-memory
    /// `databaseEncryptionKey`.
    pub async fn seal<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StoreError> {
        let guard = self.inner.read().await;
        let unlocked = guard.as_ref().ok_or(StoreError::Locked)?;
        let plaintext = codec::to_bson_bytes(value)?;
        Ok(aead::seal(&unlocked.database_encryption_key, &plaintext, RECORD_AAD)?)
    }

    pub async fn open<T: DeserializeOwned>(&self, blob: &[u8]) -> Result<T, StoreError> {
        let guard = self.inner.read().await;
        let unlocked = guard.as_ref().ok_or(StoreError::Locked)?;
        let plaintext = aead::open(&unlocked.database_encryption_key, blob, RECORD_AAD)?;
        Ok(codec::from_bson_bytes(&plaintext)?)
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        value: String,
    }

    #[tokio::test]
    async fn seal_open_requires_unlock() {
        let store = KeyStore::new();
        let err = store.seal(&Sample { value: "x".into() }).await;
        assert!(matches!(err, Err(StoreError::Locked)));
    }

    #[tokio::test]
    async fn device_config_unlock_roundtrip() {
        let password = b"correct horse battery staple";
        let salt = b"per-install-salt";
        let config = DeviceConfig {
            username: "alice".into(),
            device_id: uuid::Uuid::new_v4(),
            registry_mode: cypher_proto::records::RegistryMode::Master,
            identity_secret: [1u8; 32],
            device_secret: [2u8; 32],
            signed_prekey_secret: [4u8; 32],
            database_encryption_key: [3u8; 32],
            last_known_user_config: None,
        };

        let sealed = KeyStore::seal_device_config(password, salt, &config).unwrap();
        assert!(KeyStore::can_unlock(password, salt, &sealed));
        assert!(!KeyStore::can_unlock(b"wrong password", salt, &sealed));

        let store = KeyStore::new();
        let opened = store.unlock(password, salt, &sealed).await.unwrap();
        assert_eq!(opened.username, "alice");

        let sealed_record = store.seal(&Sample { value: "hi".into() }).await.unwrap();
        let opened_record: Sample = store.open(&sealed_record).await.unwrap();
        assert_eq!(opened_record.value, "hi");
    }
}
