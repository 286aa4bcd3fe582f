use thiserror::Error;

/// Unified error type for every crypto operation in the core. Propagation
/// policy for each variant is specified at the call site, not here — see
/// SPEC_FULL.md §7.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch)")]
    AeadDecrypt,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("ratchet session not initialised")]
    SessionNotInitialised,

    #[error("ratchet decrypt failed: {0}")]
    RatchetDecrypt(String),

    #[error("skipped-message-key budget exceeded ({0} > 100)")]
    SkippedKeyBudgetExceeded(u64),

    #[error("prekey bundle error: {0}")]
    PrekeyError(String),

    #[error("header encode/decode error: {0}")]
    HeaderCodec(String),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
