//! Wire types, records, and BSON serialisation for the Cypher Protocol.
//!
//! # Modules
//! - `records`  — persisted entity shapes (§3)
//! - `envelope` — signed ratchet container and multi-recipient fan-out (§4.4, §4.5)
//! - `message`  — plaintext content carried inside an envelope (§4.7)
//! - `job`      — durable job task payloads (§4.6)
//! - `codec`    — BSON encode/decode and the canonical-bytes signing construction

pub mod codec;
pub mod envelope;
pub mod error;
pub mod job;
pub mod message;
pub mod records;

pub use envelope::{ContainerKey, MultiRecipientEnvelope, RatchetedCypherMessage};
pub use error::ProtoError;
pub use job::JobPayload;
pub use message::{CypherMessage, MessageTarget, MessageType, SingleCypherMessage};
