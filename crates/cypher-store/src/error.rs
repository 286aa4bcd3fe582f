use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("key store is locked")]
    Locked,

    #[error("crypto error: {0}")]
    Crypto(#[from] cypher_crypto::CryptoError),

    #[error("wire codec error: {0}")]
    Proto(#[from] cypher_proto::ProtoError),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("duplicate remote id: {0}")]
    DuplicateRemoteId(String),

    /// `CorruptConfig` (§4.1): `open` failed — wrong key or tampered blob.
    #[error("device config is corrupt or the password is wrong")]
    CorruptConfig,
}
