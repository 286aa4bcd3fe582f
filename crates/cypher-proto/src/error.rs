//! Wire/codec errors (§6.3, §7 `BadInput`).

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("BSON encode failed: {0}")]
    BsonEncode(#[from] bson::ser::Error),

    #[error("BSON decode failed: {0}")]
    BsonDecode(#[from] bson::de::Error),

    #[error("malformed ratchet header: {0}")]
    InvalidHeader(String),

    #[error("magic subtype not recognised: {0}")]
    UnknownMagicSubtype(String),
}
