//! Plaintext message shapes carried inside a decrypted envelope (§4.7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved magic-subtype namespace (§6.3, §4.7): any subtype beginning
/// with `_/` is consumed by the core; application subtypes MUST NOT use
/// this prefix.
pub mod magic {
    pub const PREFIX: &str = "_/";
    pub const DEVICES_ANNOUNCE: &str = "_/devices/announce";
    pub const DEVICES_RENAME: &str = "_/devices/rename";
    pub const P2P_PREFIX: &str = "_/p2p/0/";
    pub const IGNORE: &str = "_/ignore";
    pub const RESEND_MESSAGE: &str = "_/resend/message";

    pub fn is_magic(subtype: &str) -> bool {
        subtype.starts_with(PREFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Media,
    Magic,
}

/// Where a [`SingleCypherMessage`] is routed (§4.7 target dispatch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageTarget {
    CurrentUser,
    OtherUser { username: String },
    GroupChat { id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleCypherMessage {
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_subtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub metadata: bson::Document,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_date: Option<DateTime<Utc>>,
    pub order: i64,
    pub target: MessageTarget,
}

/// Inbound decrypted content is a sum type: a single message or an ordered
/// sequence of them (§4.7). Adjacently tagged rather than `untagged`: a bare
/// `Sequence` payload serializes to a top-level BSON array, which neither
/// `to_bson_bytes` nor `from_bson_bytes` can carry (both require a
/// document), so the tag/content wrapper keeps every variant's wire form a
/// document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "form", content = "body", rename_all = "snake_case")]
pub enum CypherMessage {
    Single(SingleCypherMessage),
    Sequence(Vec<SingleCypherMessage>),
}

impl CypherMessage {
    /// Flatten into an ordered slice of individual messages.
    pub fn into_messages(self) -> Vec<SingleCypherMessage> {
        match self {
            CypherMessage::Single(m) => vec![m],
            CypherMessage::Sequence(ms) => ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn sample(order: i64) -> SingleCypherMessage {
        SingleCypherMessage {
            message_type: MessageType::Text,
            message_subtype: None,
            text: Some(format!("message {order}")),
            metadata: bson::Document::new(),
            sent_date: Some(Utc::now()),
            order,
            target: MessageTarget::OtherUser { username: "bob".into() },
        }
    }

    #[test]
    fn single_round_trips_through_bson() {
        let body = CypherMessage::Single(sample(0));
        let bytes = codec::to_bson_bytes(&body).unwrap();
        let decoded: CypherMessage = codec::from_bson_bytes(&bytes).unwrap();
        assert_eq!(decoded.into_messages(), body.into_messages());
    }

    #[test]
    fn sequence_round_trips_through_bson() {
        let body = CypherMessage::Sequence(vec![sample(0), sample(1), sample(2)]);
        let bytes = codec::to_bson_bytes(&body).unwrap();
        let decoded: CypherMessage = codec::from_bson_bytes(&bytes).unwrap();
        let messages = decoded.into_messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].text.as_deref(), Some("message 1"));
    }
}
