//! Message Pipeline (§4.7): turns one decrypted [`MultiRecipientEnvelope`]
//! into persisted chat state, magic-subtype side effects, and outgoing
//! receipts/resends. Grounded on the teacher's `cmd_poll_inbox` per-envelope
//! dispatch loop (session lookup, decrypt, persist, ack-only-after-success),
//! generalized from its single `currentUser` flow to the full
//! `currentUser`/`otherUser`/`groupChat` target table.

use std::sync::Arc;

use cypher_proto::{
    codec,
    message::magic,
    records::{ChatMessage, Conversation, DeliveryState, DeviceIdentity, RegistryMode, UserDeviceConfig},
    CypherMessage, JobPayload, MessageTarget, MessageType, MultiRecipientEnvelope, SingleCypherMessage,
};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::envelope::{open_multi_recipient_envelope, OpenedEnvelope};
use crate::error::CoreError;
use crate::identity::IdentityRegistry;
use crate::jobqueue::JobQueue;
use crate::plugin::{CorePlugin, SaveDecision};
use crate::session::SessionManager;
use cypher_store::{KeyStore, Storage};

/// Private-chat and internal-chat conversation ids are derived
/// deterministically from their member set rather than tracked in a
/// separate members index, since `Storage` only keys conversations by id
/// (§4.7 has no dedicated "find conversation by members" operation).
const CONVERSATION_NAMESPACE: Uuid = Uuid::from_bytes([
    0x63, 0x79, 0x70, 0x68, 0x65, 0x72, 0x2d, 0x63, 0x6f, 0x6e, 0x76, 0x6f, 0x2d, 0x76, 0x31, 0x00,
]);

const P2P_FRESHNESS_SECS: i64 = 15;

/// Outcome of [`transition_delivery_state`] (§4.7 delivery state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryTransition {
    Applied(DeliveryState),
    NotModified,
    Invalid,
}

/// §4.7 delivery state transition table. Invalid transitions are reported
/// but leave state unchanged — callers must not persist on `Invalid`.
pub fn transition_delivery_state(from: DeliveryState, to: DeliveryState) -> DeliveryTransition {
    use DeliveryState::*;
    if from == to {
        return DeliveryTransition::NotModified;
    }
    let allowed = matches!(
        (from, to),
        (None, Received) | (None, Read) | (None, Revoked)
            | (Undelivered, Received) | (Undelivered, Read) | (Undelivered, Revoked)
            | (Received, Read) | (Received, Revoked)
            | (Read, Revoked)
    );
    if allowed {
        DeliveryTransition::Applied(to)
    } else {
        DeliveryTransition::Invalid
    }
}

#[derive(serde::Deserialize)]
struct DeviceRenamePayload {
    device_id: Uuid,
    device_name: String,
}

pub struct Pipeline {
    identity_registry: Arc<IdentityRegistry>,
    session_manager: Arc<SessionManager>,
    job_queue: Arc<JobQueue>,
    storage: Arc<dyn Storage>,
    key_store: KeyStore,
    plugin: Arc<dyn CorePlugin>,
    local_username: String,
    local_device_id: Uuid,
    /// In-memory mirror of `DeviceConfig.registryMode`; persisting the
    /// change back to the password-sealed `DeviceConfig` blob is the
    /// messenger's job, since only it holds the unlock password.
    local_registry_mode: Mutex<RegistryMode>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity_registry: Arc<IdentityRegistry>,
        session_manager: Arc<SessionManager>,
        job_queue: Arc<JobQueue>,
        storage: Arc<dyn Storage>,
        key_store: KeyStore,
        plugin: Arc<dyn CorePlugin>,
        local_username: String,
        local_device_id: Uuid,
        local_registry_mode: RegistryMode,
    ) -> Self {
        Self {
            identity_registry,
            session_manager,
            job_queue,
            storage,
            key_store,
            plugin,
            local_username,
            local_device_id,
            local_registry_mode: Mutex::new(local_registry_mode),
        }
    }

    pub fn registry_mode(&self) -> RegistryMode {
        *self.local_registry_mode.lock()
    }

    /// Entry point: decrypt one inbound envelope and dispatch every message
    /// it carries. Errors here mean "do not ack the envelope" to the
    /// transport — everything else (unknown magic subtypes, duplicate
    /// remoteIds, unauthorized resend requests) is swallowed per §7.
    pub async fn handle_envelope(&self, envelope: &MultiRecipientEnvelope) -> Result<(), CoreError> {
        let mut sender = self.resolve_sender_device(envelope).await?;

        let opened = open_multi_recipient_envelope(
            &self.session_manager,
            &mut sender,
            &self.local_username,
            self.local_device_id,
            envelope,
        )
        .await?;
        self.identity_registry.save_device_identity(&sender).await?;

        let plaintext = match opened {
            OpenedEnvelope::Decrypted(plaintext) => plaintext,
            // Replay/ordering defense (§4.4): belongs to a session we have
            // since rekeyed. We have no content to dispatch, only a resend
            // to request.
            OpenedEnvelope::Stale => return self.enqueue_resend_request(&sender, envelope).await,
            // Rekey recovery could not decrypt even the embedded X3DH
            // response (§4.4, §8 scenario 3): force the sender to see a
            // fresh handshake and ask it to resend.
            OpenedEnvelope::Failed => {
                self.enqueue_ignore(&sender).await?;
                return self.enqueue_resend_request(&sender, envelope).await;
            }
        };

        let body: CypherMessage = codec::from_bson_bytes(&plaintext)?;
        for (order, message) in body.into_messages().into_iter().enumerate() {
            if let Err(err) = self
                .dispatch_message(envelope, order as i64, &sender, &message)
                .await
            {
                tracing::warn!(?err, envelope_id = %envelope.envelope_id, order, "pipeline message dispatch failed");
            }
        }
        Ok(())
    }

    async fn resolve_sender_device(&self, envelope: &MultiRecipientEnvelope) -> Result<DeviceIdentity, CoreError> {
        if let Some(device) = self
            .identity_registry
            .find_device_identity(&envelope.sender_username, envelope.sender_device_id)
            .await?
        {
            return Ok(device);
        }
        self.identity_registry
            .fetch_device_identities(&envelope.sender_username)
            .await?;
        self.identity_registry
            .find_device_identity(&envelope.sender_username, envelope.sender_device_id)
            .await?
            .ok_or_else(|| CoreError::BadInput("envelope sender device is not known to the registry".into()))
    }

    /// `remoteId` has no dedicated field on `SingleCypherMessage` — it is
    /// derived from the envelope id (sender-allocated, globally unique) and
    /// the message's position within the envelope's body, which is stable
    /// across redelivery of the same envelope.
    fn remote_id(envelope: &MultiRecipientEnvelope, order: i64) -> String {
        format!("{}:{}", envelope.envelope_id, order)
    }

    /// §4.4 rekey recovery: forces `sender`'s own ratchet into a fresh
    /// handshake on its next send rather than stalling on an ack for a
    /// message we could not read.
    async fn enqueue_ignore(&self, sender: &DeviceIdentity) -> Result<(), CoreError> {
        let ignore = SingleCypherMessage {
            message_type: MessageType::Magic,
            message_subtype: Some(magic::IGNORE.to_string()),
            text: None,
            metadata: bson::Document::new(),
            sent_date: Some(chrono::Utc::now()),
            order: 0,
            target: MessageTarget::OtherUser { username: sender.username.clone() },
        };
        self.job_queue
            .queue_task(
                JobPayload::Send {
                    conversation_id: Uuid::new_v4(),
                    message: ignore,
                    recipients: vec![(sender.username.clone(), sender.device_id)],
                },
                false,
            )
            .await
    }

    /// §4.4/§8 scenario 3: asks `sender` to resend a message we dropped
    /// (stale, or undecryptable even after rekey recovery). The envelope's
    /// body was never decoded, so the request always names its first
    /// message — the common case of one message per envelope.
    async fn enqueue_resend_request(&self, sender: &DeviceIdentity, envelope: &MultiRecipientEnvelope) -> Result<(), CoreError> {
        let mut metadata = bson::Document::new();
        metadata.insert("remote_id", Self::remote_id(envelope, 0));
        let resend = SingleCypherMessage {
            message_type: MessageType::Magic,
            message_subtype: Some(magic::RESEND_MESSAGE.to_string()),
            text: None,
            metadata,
            sent_date: Some(chrono::Utc::now()),
            order: 0,
            target: MessageTarget::OtherUser { username: sender.username.clone() },
        };
        self.job_queue
            .queue_task(
                JobPayload::Send {
                    conversation_id: Uuid::new_v4(),
                    message: resend,
                    recipients: vec![(sender.username.clone(), sender.device_id)],
                },
                false,
            )
            .await
    }

    async fn dispatch_message(
        &self,
        envelope: &MultiRecipientEnvelope,
        order: i64,
        sender: &DeviceIdentity,
        message: &SingleCypherMessage,
    ) -> Result<(), CoreError> {
        match &message.target {
            MessageTarget::CurrentUser => self.handle_current_user(envelope, order, sender, message).await,
            MessageTarget::OtherUser { username } => {
                self.handle_other_user(envelope, order, sender, username, message).await
            }
            MessageTarget::GroupChat { id } => self.handle_group_chat(envelope, order, sender, *id, message).await,
        }
    }

    // -- currentUser -----------------------------------------------------

    async fn handle_current_user(
        &self,
        envelope: &MultiRecipientEnvelope,
        order: i64,
        sender: &DeviceIdentity,
        message: &SingleCypherMessage,
    ) -> Result<(), CoreError> {
        if sender.username != self.local_username || sender.device_id == self.local_device_id {
            tracing::debug!(sender = %sender.username, "dropping currentUser message from a non-sibling device");
            return Ok(());
        }

        if let Some(subtype) = message.message_subtype.as_deref().filter(|s| magic::is_magic(s)) {
            return match subtype {
                magic::DEVICES_ANNOUNCE => self.handle_devices_announce(sender.is_master_device, message).await,
                magic::DEVICES_RENAME => self.handle_devices_rename(message).await,
                _ => self.handle_shared_magic(subtype, sender, message).await,
            };
        }

        let conversation = self.internal_chat_conversation().await?;
        let decision = self.plugin.on_receive_message(message, &conversation).await;
        if decision == SaveDecision::Save {
            self.persist_chat_message(envelope, order, &conversation, sender, message)
                .await?;
        }
        Ok(())
    }

    async fn handle_devices_announce(&self, sender_is_master: bool, message: &SingleCypherMessage) -> Result<(), CoreError> {
        if !sender_is_master {
            return Err(CoreError::NotMasterDevice);
        }
        let device_config: UserDeviceConfig = bson::from_document(message.metadata.clone()).map_err(cypher_proto::ProtoError::BsonDecode)?;

        if device_config.device_id == self.local_device_id {
            *self.local_registry_mode.lock() = RegistryMode::Child;
            return Ok(());
        }

        let identity_key = self.session_manager.local_identity_public_key().clone();
        let identity = self
            .identity_registry
            .create_device_identity(&self.local_username, &identity_key, &device_config)
            .await?;
        self.plugin.on_device_registery(&identity).await;
        Ok(())
    }

    /// A contact's master device announcing a new sibling device of
    /// *theirs* (§4.2, §8 scenario 2), as opposed to [`Self::
    /// handle_devices_announce`]'s own-sibling case: the new
    /// `DeviceIdentity` is registered under `sender.username`, and there is
    /// no local registry mode to flip since the announcing user isn't us.
    async fn handle_contact_devices_announce(&self, sender: &DeviceIdentity, message: &SingleCypherMessage) -> Result<(), CoreError> {
        if !sender.is_master_device {
            return Err(CoreError::NotMasterDevice);
        }
        let device_config: UserDeviceConfig = bson::from_document(message.metadata.clone()).map_err(cypher_proto::ProtoError::BsonDecode)?;
        if device_config.device_id == sender.device_id {
            return Ok(());
        }
        let identity = self
            .identity_registry
            .create_device_identity(&sender.username, &sender.identity.clone(), &device_config)
            .await?;
        self.plugin.on_device_registery(&identity).await;
        Ok(())
    }

    async fn handle_devices_rename(&self, message: &SingleCypherMessage) -> Result<(), CoreError> {
        let payload: DeviceRenamePayload = bson::from_document(message.metadata.clone()).map_err(cypher_proto::ProtoError::BsonDecode)?;
        if let Some(mut device) = self
            .identity_registry
            .find_device_identity(&self.local_username, payload.device_id)
            .await?
        {
            device.device_name = Some(payload.device_name);
            self.identity_registry.save_device_identity(&device).await?;
        }
        Ok(())
    }

    // -- otherUser / groupChat -------------------------------------------

    async fn handle_other_user(
        &self,
        envelope: &MultiRecipientEnvelope,
        order: i64,
        sender: &DeviceIdentity,
        addressed_username: &str,
        message: &SingleCypherMessage,
    ) -> Result<(), CoreError> {
        if addressed_username != self.local_username {
            tracing::debug!(addressed_username, "dropping otherUser message not addressed to us");
            return Ok(());
        }

        if let Some(subtype) = message.message_subtype.as_deref().filter(|s| magic::is_magic(s)) {
            if subtype == magic::DEVICES_ANNOUNCE {
                return self.handle_contact_devices_announce(sender, message).await;
            }
            return self.handle_shared_magic(subtype, sender, message).await;
        }

        let conversation = self.private_chat_conversation(&sender.username).await?;
        if let Some(chat_message) = self
            .persist_chat_message(envelope, order, &conversation, sender, message)
            .await?
        {
            self.enqueue_receipt(&chat_message, sender, DeliveryState::Received).await?;
        }
        Ok(())
    }

    async fn handle_group_chat(
        &self,
        envelope: &MultiRecipientEnvelope,
        order: i64,
        sender: &DeviceIdentity,
        group_id: Uuid,
        message: &SingleCypherMessage,
    ) -> Result<(), CoreError> {
        if let Some(subtype) = message.message_subtype.as_deref().filter(|s| magic::is_magic(s)) {
            return self.handle_shared_magic(subtype, sender, message).await;
        }

        let Some(conversation) = self.open_conversation(group_id).await? else {
            tracing::debug!(%group_id, "dropping message for an unknown group");
            return Ok(());
        };

        if let Some(chat_message) = self
            .persist_chat_message(envelope, order, &conversation, sender, message)
            .await?
        {
            self.enqueue_receipt(&chat_message, sender, DeliveryState::Received).await?;
        }
        Ok(())
    }

    /// Subtypes meaningful regardless of target (§4.7 "same magic-subtype
    /// rules"): `_/ignore`, `_/resend/message`, `_/p2p/0/*`. Unknown `_/…`
    /// subtypes are dropped.
    async fn handle_shared_magic(&self, subtype: &str, sender: &DeviceIdentity, message: &SingleCypherMessage) -> Result<(), CoreError> {
        if subtype == magic::IGNORE {
            return Ok(());
        }
        if subtype == magic::RESEND_MESSAGE {
            return self.handle_resend_message(sender, message).await;
        }
        if let Some(path) = subtype.strip_prefix(magic::P2P_PREFIX) {
            return self.handle_p2p(path, sender, message).await;
        }
        tracing::debug!(subtype, "dropping unknown magic subtype");
        Ok(())
    }

    async fn handle_p2p(&self, path: &str, sender: &DeviceIdentity, message: &SingleCypherMessage) -> Result<(), CoreError> {
        if let Some(sent_date) = message.sent_date {
            let age = chrono::Utc::now().signed_duration_since(sent_date);
            if age.num_seconds().unsigned_abs() >= P2P_FRESHNESS_SECS as u64 {
                return Ok(());
            }
        }
        // `path` is everything after `_/p2p/0/`, e.g. `<transport>/open` —
        // only the trailing action segment selects the dispatch arm.
        match path.rsplit('/').next() {
            Some("open") => self.plugin.on_p2p_client_open(&sender.username, sender.device_id).await,
            Some("close") => self.plugin.on_p2p_client_close(&sender.username, sender.device_id).await,
            _ => tracing::debug!(path, "dropping unrecognised p2p side-channel path"),
        }
        Ok(())
    }

    async fn handle_resend_message(&self, sender: &DeviceIdentity, message: &SingleCypherMessage) -> Result<(), CoreError> {
        let remote_id = message
            .metadata
            .get_str("remote_id")
            .map_err(|_| CoreError::BadInput("resend request missing remote_id".into()))?;

        let Some((_, sealed)) = self.storage.get_chat_message_by_remote_id(remote_id).await? else {
            return Ok(());
        };
        let chat_message: ChatMessage = self.key_store.open(&sealed).await?;

        if !self.authorized_for_conversation(sender, chat_message.conversation_id).await? {
            return Err(CoreError::BadInput("resend requester is not a member of this conversation".into()));
        }

        self.job_queue
            .queue_task(
                JobPayload::ResendRequest {
                    to_username: sender.username.clone(),
                    to_device_id: sender.device_id,
                    remote_id: remote_id.to_string(),
                },
                false,
            )
            .await
    }

    async fn authorized_for_conversation(&self, sender: &DeviceIdentity, conversation_id: Uuid) -> Result<bool, CoreError> {
        if sender.username == self.local_username {
            return Ok(true);
        }
        match self.open_conversation(conversation_id).await? {
            Some(conversation) => Ok(conversation.members.iter().any(|m| m == &sender.username)),
            None => Ok(false),
        }
    }

    // -- persistence helpers ----------------------------------------------

    /// Persists a non-magic message as a `ChatMessage`. A duplicate
    /// `remoteId` is not an error (§7, §8 Idempotence) — it is reported by
    /// returning `Ok(None)` so callers skip the receipt enqueue a second
    /// time.
    async fn persist_chat_message(
        &self,
        envelope: &MultiRecipientEnvelope,
        order: i64,
        conversation: &Conversation,
        sender: &DeviceIdentity,
        message: &SingleCypherMessage,
    ) -> Result<Option<ChatMessage>, CoreError> {
        let remote_id = Self::remote_id(envelope, order);
        let chat_message = ChatMessage {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            sender_id: sender.sender_id,
            order: message.order,
            remote_id: remote_id.clone(),
            send_date: message.sent_date.unwrap_or(envelope.sent_at),
            receive_date: Some(chrono::Utc::now()),
            delivery_state: DeliveryState::Received,
            text: message.text.clone(),
            metadata: message.metadata.clone(),
            sender_user: sender.username.clone(),
            sender_device_id: sender.device_id,
            per_device_delivery_states: std::collections::HashMap::new(),
        };

        let sealed = self.key_store.seal(&chat_message).await?;
        match self
            .storage
            .put_chat_message(chat_message.id, &sealed, conversation.id, &remote_id, message.order, sender.sender_id)
            .await
        {
            Ok(()) => {
                self.plugin.on_message_change(&chat_message).await;
                Ok(Some(chat_message))
            }
            Err(cypher_store::StoreError::DuplicateRemoteId(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn enqueue_receipt(&self, chat_message: &ChatMessage, sender: &DeviceIdentity, new_state: DeliveryState) -> Result<(), CoreError> {
        self.job_queue
            .queue_task(
                JobPayload::DeliverStateChange {
                    chat_message_id: chat_message.id,
                    remote_id: chat_message.remote_id.clone(),
                    to_username: sender.username.clone(),
                    to_device_id: sender.device_id,
                    new_state,
                },
                true,
            )
            .await
    }

    /// Applies the §4.7 delivery transition to a chat message's per-device
    /// state and persists only if the transition was `Applied`.
    pub async fn apply_delivery_state_change(
        &self,
        remote_id: &str,
        device_id: Uuid,
        new_state: DeliveryState,
    ) -> Result<DeliveryTransition, CoreError> {
        let Some((id, sealed)) = self.storage.get_chat_message_by_remote_id(remote_id).await? else {
            return Ok(DeliveryTransition::Invalid);
        };
        let mut chat_message: ChatMessage = self.key_store.open(&sealed).await?;
        let current = chat_message
            .per_device_delivery_states
            .get(&device_id)
            .copied()
            .unwrap_or(DeliveryState::None);

        let outcome = transition_delivery_state(current, new_state);
        if let DeliveryTransition::Applied(applied) = outcome {
            chat_message.per_device_delivery_states.insert(device_id, applied);
            if chat_message
                .per_device_delivery_states
                .values()
                .all(|state| *state == applied)
            {
                chat_message.delivery_state = applied;
            }
            let sealed = self.key_store.seal(&chat_message).await?;
            self.storage.update_chat_message(id, &sealed).await?;
            self.plugin.on_message_change(&chat_message).await;
        }
        Ok(outcome)
    }

    async fn open_conversation(&self, id: Uuid) -> Result<Option<Conversation>, CoreError> {
        match self.storage.get_conversation(id).await? {
            Some(sealed) => Ok(Some(self.key_store.open(&sealed).await?)),
            None => Ok(None),
        }
    }

    async fn internal_chat_conversation(&self) -> Result<Conversation, CoreError> {
        self.find_or_create_conversation(&[self.local_username.as_str()]).await
    }

    async fn private_chat_conversation(&self, other_username: &str) -> Result<Conversation, CoreError> {
        self.find_or_create_conversation(&[self.local_username.as_str(), other_username])
            .await
    }

    async fn find_or_create_conversation(&self, members: &[&str]) -> Result<Conversation, CoreError> {
        let mut sorted: Vec<&str> = members.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let key = sorted.join("\u{0}");
        let id = Uuid::new_v5(&CONVERSATION_NAMESPACE, key.as_bytes());

        if let Some(conversation) = self.open_conversation(id).await? {
            return Ok(conversation);
        }

        let conversation = Conversation {
            id,
            members: sorted.into_iter().map(str::to_string).collect(),
            kicked_members: Vec::new(),
            metadata: bson::Document::new(),
            local_order: 0,
        };
        let sealed = self.key_store.seal(&conversation).await?;
        self.storage.put_conversation(id, &sealed).await?;
        self.plugin.on_create_conversation(&conversation).await;
        Ok(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_transitions_match_the_table() {
        use DeliveryState::*;

        assert_eq!(transition_delivery_state(None, Undelivered), DeliveryTransition::Invalid);
        assert_eq!(transition_delivery_state(None, Received), DeliveryTransition::Applied(Received));
        assert_eq!(transition_delivery_state(Undelivered, Undelivered), DeliveryTransition::NotModified);
        assert_eq!(transition_delivery_state(Received, Undelivered), DeliveryTransition::Invalid);
        assert_eq!(transition_delivery_state(Received, Read), DeliveryTransition::Applied(Read));
        assert_eq!(transition_delivery_state(Read, Received), DeliveryTransition::Invalid);
        assert_eq!(transition_delivery_state(Revoked, Read), DeliveryTransition::Invalid);
        assert_eq!(transition_delivery_state(Revoked, Revoked), DeliveryTransition::NotModified);
    }
}
