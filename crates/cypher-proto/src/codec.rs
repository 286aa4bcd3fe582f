//! BSON encode/decode helpers and the canonical-bytes construction used for
//! Ed25519 signing (§6.3: "signed values embed the payload and an Ed25519
//! signature over the canonical BSON").

use serde::{de::DeserializeOwned, Serialize};

use crate::error::ProtoError;

/// Serialize `value` to a BSON document, then to its raw byte encoding.
pub fn to_bson_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtoError> {
    let doc = bson::to_document(value)?;
    let mut out = Vec::new();
    doc.to_writer(&mut out)?;
    Ok(out)
}

pub fn from_bson_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtoError> {
    let doc = bson::Document::from_reader(bytes)?;
    Ok(bson::from_document(doc)?)
}

/// The exact byte sequence a sender signs and a receiver re-derives to
/// verify: BSON's field order follows struct declaration order under
/// `serde`, so two calls over equal values always agree byte-for-byte.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtoError> {
    to_bson_bytes(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        a: i32,
        b: String,
    }

    #[test]
    fn bson_roundtrip() {
        let sample = Sample { a: 7, b: "hi".into() };
        let bytes = to_bson_bytes(&sample).unwrap();
        let back: Sample = from_bson_bytes(&bytes).unwrap();
        assert_eq!(sample, back);
    }

    #[test]
    fn canonical_bytes_is_deterministic() {
        let sample = Sample { a: 1, b: "x".into() };
        assert_eq!(canonical_bytes(&sample).unwrap(), canonical_bytes(&sample).unwrap());
    }
}
