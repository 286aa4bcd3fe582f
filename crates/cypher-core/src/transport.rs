//! The relay transport contract (§6.2). An external collaborator: the core
//! calls into it for key-bundle exchange, message delivery, and receipts,
//! and the transport pushes server events back via [`TransportDelegate`].

use async_trait::async_trait;
use cypher_proto::{envelope::RatchetedCypherMessage, MultiRecipientEnvelope};
use uuid::Uuid;

use crate::error::CoreError;

/// Server-side push events a transport delivers to the core (§6.2).
#[derive(Debug, Clone)]
pub enum TransportEvent {
    MessageSent { message_id: String },
    MultiRecipientMessageSent { envelope_id: Uuid },
    MessageDisplayed { message_id: String, by_username: String, by_device_id: Uuid },
    MessageReceived { envelope: MultiRecipientEnvelope },
    RequestDeviceRegistery { username: String },
}

/// How an outbound message should be pushed to the recipient device, if the
/// transport supports platform push notifications. Pluggable, per §1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushType {
    None,
    Silent,
    Alert,
}

/// §6.2: the relay/server protocol. Implementations decide the wire format;
/// the core only requires these operations and their delegate events.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn read_key_bundle(&self, username: &str) -> Result<cypher_proto::records::UserConfig, CoreError>;
    async fn publish_key_bundle(&self, config: &cypher_proto::records::UserConfig) -> Result<(), CoreError>;

    async fn send_message(
        &self,
        message: &RatchetedCypherMessage,
        to_username: &str,
        to_device_id: Uuid,
        push_type: PushType,
        message_id: &str,
    ) -> Result<(), CoreError>;

    /// Gated by [`Transport::supports_multi_recipient`].
    async fn send_multi_recipient_message(
        &self,
        envelope: &MultiRecipientEnvelope,
        push_type: PushType,
        message_id: &str,
    ) -> Result<(), CoreError>;

    fn supports_multi_recipient(&self) -> bool {
        false
    }

    async fn send_message_received_receipt(&self, to_username: &str, to_device_id: Uuid, remote_id: &str) -> Result<(), CoreError>;
    async fn send_message_read_receipt(&self, to_username: &str, to_device_id: Uuid, remote_id: &str) -> Result<(), CoreError>;

    async fn request_device_registery(&self, config: &cypher_proto::records::UserDeviceConfig) -> Result<(), CoreError>;

    /// Whether the transport currently holds an authenticated connection
    /// (§4.6 "Connectivity requirement", §7 `Offline`).
    fn is_authenticated(&self) -> bool;
}
