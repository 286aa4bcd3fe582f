//! The host application's capability set (§9): every place the original
//! listener protocol let the embedding app observe or steer a decision is
//! re-expressed here as one defaulted async trait method.

use async_trait::async_trait;
use cypher_proto::records::{ChatMessage, Contact, Conversation, DeviceIdentity};
use cypher_proto::SingleCypherMessage;
use uuid::Uuid;

/// Returned by [`CorePlugin::on_receive_message`]: whether an inbound
/// non-magic message should be kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveDecision {
    Ignore,
    Save,
}

/// Returned by [`CorePlugin::on_send_message`]: whether an outbound message
/// is also persisted locally as sent (as opposed to fire-and-forget).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    Send,
    SaveAndSend,
}

/// Host application hooks. Every method has a sensible default so a caller
/// need only override the ones it cares about.
#[async_trait]
pub trait CorePlugin: Send + Sync {
    async fn on_message_change(&self, _message: &ChatMessage) {}

    async fn on_create_contact(&self, _contact: &Contact) {}

    async fn on_create_conversation(&self, _conversation: &Conversation) {}

    /// A session was cleared and a fresh handshake begun (§4.4 rekey recovery).
    async fn on_rekey(&self, _username: &str, _device_id: Uuid) {}

    async fn on_device_registery(&self, _device: &DeviceIdentity) {}

    /// A peer's signing key changed (§4.2 `ChangedIdentity`). Per §9 design
    /// notes, the core never drops ratchet state on its own — this is purely
    /// advisory.
    async fn on_contact_identity_change(&self, _username: &str) {}

    async fn on_receive_message(&self, _message: &SingleCypherMessage, _conversation: &Conversation) -> SaveDecision {
        SaveDecision::Save
    }

    async fn on_send_message(&self, _message: &SingleCypherMessage) -> SendDecision {
        SendDecision::SaveAndSend
    }

    async fn on_p2p_client_open(&self, _username: &str, _device_id: Uuid) {}

    async fn on_p2p_client_close(&self, _username: &str, _device_id: Uuid) {}

    async fn create_contact_metadata(&self, _username: &str) -> bson::Document {
        bson::Document::new()
    }

    async fn create_private_chat_metadata(&self, _username: &str) -> bson::Document {
        bson::Document::new()
    }
}

/// A plugin that observes nothing and accepts every default decision.
pub struct NoopPlugin;

#[async_trait]
impl CorePlugin for NoopPlugin {}
