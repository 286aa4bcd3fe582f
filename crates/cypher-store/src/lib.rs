//! Sealed-record persistence for the Cypher Protocol (§4.1, §6.1).
//!
//! # Encryption strategy
//! Every persisted record is BSON-encoded, then AES-GCM-256-sealed under a
//! device-local `databaseEncryptionKey` held only in memory while the
//! [`keystore::KeyStore`] is unlocked. The `DeviceConfig` that carries that
//! key is itself sealed under a password-derived `appEncryptionKey`.
//! Secondary indices (conversation id, remote id, sender id, scheduled
//! time) are stored in the clear to allow efficient queries — see §6.1.
//!
//! Persistence backend is pluggable (§1 Non-goals): implement [`Storage`]
//! directly for anything other than SQLite.

pub mod cache;
pub mod error;
pub mod keystore;
pub mod store;

pub use cache::DecryptedCache;
pub use error::StoreError;
pub use keystore::KeyStore;
pub use store::{SqliteStorage, Storage};
