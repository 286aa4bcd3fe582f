//! Job task payloads (§3, §4.6). Persisted BSON-encoded and dispatched by
//! `taskKey` to a registered decoder; unknown keys fall back to the core's
//! own decoder (§9 "dynamic task dispatch").

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{envelope::MultiRecipientEnvelope, message::SingleCypherMessage, records::DeliveryState};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "taskKey", rename_all = "snake_case")]
pub enum JobPayload {
    /// Encrypt-and-send one message to the given target (already resolved
    /// to its concrete recipient device set by the caller).
    Send {
        conversation_id: Uuid,
        message: SingleCypherMessage,
        /// Devices this send must reach; empty for self-only magic sends.
        recipients: Vec<(String, Uuid)>,
    },
    /// An inbound envelope that arrived while offline and was queued for
    /// processing rather than handled inline.
    Receive { envelope: MultiRecipientEnvelope },
    DeliverStateChange {
        chat_message_id: Uuid,
        remote_id: String,
        to_username: String,
        to_device_id: Uuid,
        new_state: DeliveryState,
    },
    /// Enqueued by rekey recovery (§4.4) and by `_/resend/message` (§4.7).
    ResendRequest {
        to_username: String,
        to_device_id: Uuid,
        remote_id: String,
    },
}

impl JobPayload {
    pub fn task_key(&self) -> &'static str {
        match self {
            JobPayload::Send { .. } => "send",
            JobPayload::Receive { .. } => "receive",
            JobPayload::DeliverStateChange { .. } => "deliver_state_change",
            JobPayload::ResendRequest { .. } => "resend_request",
        }
    }

    /// Whether the task may only run while the transport is authenticated
    /// (§4.6 "Connectivity requirement").
    pub fn requires_connectivity(&self) -> bool {
        !matches!(self, JobPayload::DeliverStateChange { .. })
    }
}
