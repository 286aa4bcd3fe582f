//! The core's unified error taxonomy (§7). Crypto/store/proto errors are
//! composed in; everything else names a specific configuration, input, or
//! network condition the spec calls out by name.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Crypto(#[from] cypher_crypto::CryptoError),

    #[error(transparent)]
    Store(#[from] cypher_store::StoreError),

    #[error(transparent)]
    Proto(#[from] cypher_proto::ProtoError),

    // --- Configuration / State (surfaced to caller, not retried) ---
    #[error("stored user config is corrupt")]
    CorruptUserConfig,

    #[error("user config failed signature validation")]
    InvalidUserConfig,

    #[error("the app is locked")]
    AppLocked,

    #[error("operation requires the master device")]
    NotMasterDevice,

    #[error("no local device config found")]
    CannotFindDeviceConfig,

    #[error("device registration failed: {0}")]
    CannotRegisterDeviceConfig(String),

    // --- Crypto (on receive: caller swallows and triggers rekey recovery) ---
    #[error("signature verification failed")]
    InvalidSignature,

    #[error("handshake is invalid or incomplete")]
    InvalidHandshake,

    #[error("multi-recipient container key was not exactly 32 bytes")]
    InvalidMultiRecipientKey,

    #[error("ratchet decrypt failed")]
    RatchetDecryptError,

    // --- Input ---
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("invalid transport configuration: {0}")]
    InvalidTransport(String),

    // --- Network / Availability ---
    #[error("transport is offline")]
    Offline,
}
