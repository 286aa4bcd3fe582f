//! The `Messenger` façade (§9): wires the Identity & Device Registry,
//! Session Manager, Message Pipeline, and Job Queue into the library's
//! single public entry point.
//!
//! §9 calls for the façade to own every subcomponent and pass itself in as
//! an explicit context parameter rather than let subcomponents hold a
//! back-pointer to it. Concretely: the job queue's [`TaskRunner`] is a
//! small free-standing [`CoreTaskRunner`] holding only the Arcs it needs
//! (registry, session manager, transport, storage) — never a pointer back
//! to `Messenger`. `Pipeline` and `CoreTaskRunner` still refer to each
//! other (the queue runs `Receive` jobs through the pipeline; the pipeline
//! enqueues receipts and resends through the queue), so that one edge is
//! resolved with a `OnceLock` set right after both are constructed, rather
//! than threading a back-pointer through either one's public API.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use cypher_crypto::identity::IdentityKeyPair;
use cypher_proto::{
    codec,
    message::magic,
    records::{Contact, DeliveryState, RegistryMode, UserConfig, UserDeviceConfig},
    CypherMessage, JobPayload, MessageTarget, MessageType, SingleCypherMessage,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;
use x25519_dalek::StaticSecret;

use crate::envelope::build_multi_recipient_envelope;
use crate::error::CoreError;
use crate::identity::IdentityRegistry;
use crate::jobqueue::{JobQueue, TaskOutcome, TaskRunner};
use crate::pipeline::Pipeline;
use crate::plugin::CorePlugin;
use crate::session::SessionManager;
use crate::transport::{PushType, Transport, TransportEvent};
use cypher_store::{KeyStore, Storage};

/// Executes every [`JobPayload`] variant (§4.6/§4.7). Holds only the Arcs
/// it needs directly; the one edge back to [`Pipeline`] (for `Receive`
/// jobs) is late-bound through `pipeline` once `Messenger::new` has built
/// both, rather than making `Pipeline` take a `Weak<Self>`.
struct CoreTaskRunner {
    identity: IdentityKeyPair,
    identity_registry: Arc<IdentityRegistry>,
    session_manager: Arc<SessionManager>,
    storage: Arc<dyn Storage>,
    key_store: KeyStore,
    transport: Arc<dyn Transport>,
    local_username: String,
    local_device_id: Uuid,
    pipeline: OnceLock<Arc<Pipeline>>,
}

#[async_trait]
impl TaskRunner for CoreTaskRunner {
    async fn run(&self, payload: &JobPayload) -> Result<TaskOutcome, CoreError> {
        match payload {
            JobPayload::Send { message, recipients, .. } => self.run_send(message, recipients).await,
            JobPayload::Receive { envelope } => self.run_receive(envelope).await,
            JobPayload::DeliverStateChange { to_username, to_device_id, remote_id, new_state, .. } => {
                self.run_deliver_state_change(to_username, *to_device_id, remote_id, *new_state).await
            }
            JobPayload::ResendRequest { to_username, to_device_id, remote_id } => {
                self.run_resend_request(to_username, *to_device_id, remote_id).await
            }
        }
    }

    async fn on_delayed(&self, payload: &JobPayload) {
        tracing::info!(task_key = payload.task_key(), "job halted awaiting connectivity or an external wake");
    }
}

impl CoreTaskRunner {
    fn pipeline(&self) -> &Arc<Pipeline> {
        self.pipeline.get().expect("CoreTaskRunner.pipeline set before the queue is spawned")
    }

    async fn run_send(&self, message: &SingleCypherMessage, recipients: &[(String, Uuid)]) -> Result<TaskOutcome, CoreError> {
        if recipients.is_empty() {
            return Ok(TaskOutcome::Success);
        }

        let mut devices = Vec::with_capacity(recipients.len());
        for (username, device_id) in recipients {
            match self.identity_registry.find_device_identity(username, *device_id).await? {
                Some(device) => devices.push(device),
                None => {
                    tracing::warn!(username, %device_id, "send target device is not yet known to the registry");
                    return Ok(TaskOutcome::Retry { delay: Duration::from_secs(30), max_attempts: Some(10) });
                }
            }
        }

        let body = CypherMessage::Single(message.clone());
        let envelope = match build_multi_recipient_envelope(
            &self.session_manager,
            &self.identity,
            &self.local_username,
            self.local_device_id,
            &body,
            &mut devices,
        )
        .await
        {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(?err, "multi-recipient envelope construction failed");
                return Ok(TaskOutcome::Retry { delay: Duration::from_secs(10), max_attempts: Some(5) });
            }
        };

        for device in &devices {
            self.identity_registry.save_device_identity(device).await?;
        }

        // `Transport::send_message` takes a bare `RatchetedCypherMessage`
        // with no container-key wrapper, but `Pipeline::handle_envelope`
        // only ever decodes a `MultiRecipientEnvelope` (it's the only shape
        // `TransportEvent::MessageReceived` carries) — so every outbound
        // send, even to a single recipient, goes out multi-recipient.
        if !self.transport.supports_multi_recipient() {
            tracing::error!("transport does not support multi-recipient delivery; dropping send");
            return Ok(TaskOutcome::FailNever);
        }

        match self
            .transport
            .send_multi_recipient_message(&envelope, PushType::Alert, &envelope.envelope_id.to_string())
            .await
        {
            Ok(()) => Ok(TaskOutcome::Success),
            Err(CoreError::Offline) => Ok(TaskOutcome::RetryAlways),
            Err(err) => {
                tracing::warn!(?err, "send failed");
                Ok(TaskOutcome::Retry { delay: Duration::from_secs(30), max_attempts: Some(10) })
            }
        }
    }

    async fn run_receive(&self, envelope: &cypher_proto::MultiRecipientEnvelope) -> Result<TaskOutcome, CoreError> {
        // A decrypt/dispatch failure here must not fail the job, or it would
        // retry forever; the pipeline already swallows per-message failures
        // and magic-subtype errors per §7.
        if let Err(err) = self.pipeline().handle_envelope(envelope).await {
            tracing::warn!(?err, envelope_id = %envelope.envelope_id, "failed to process inbound envelope");
        }
        Ok(TaskOutcome::Success)
    }

    async fn run_deliver_state_change(
        &self,
        to_username: &str,
        to_device_id: Uuid,
        remote_id: &str,
        new_state: DeliveryState,
    ) -> Result<TaskOutcome, CoreError> {
        if !self.transport.is_authenticated() {
            return Ok(TaskOutcome::Retry { delay: Duration::from_secs(15), max_attempts: None });
        }

        let result = match new_state {
            DeliveryState::Received => self.transport.send_message_received_receipt(to_username, to_device_id, remote_id).await,
            DeliveryState::Read => self.transport.send_message_read_receipt(to_username, to_device_id, remote_id).await,
            _ => Ok(()),
        };

        match result {
            Ok(()) => Ok(TaskOutcome::Success),
            Err(err) => {
                tracing::warn!(?err, remote_id, "delivery receipt send failed");
                Ok(TaskOutcome::Retry { delay: Duration::from_secs(15), max_attempts: Some(5) })
            }
        }
    }

    /// A resend request carries only a `remoteId`; the original message
    /// content has to be reloaded from storage and re-delivered through the
    /// same path as a fresh `Send` job. The reconstructed message loses its
    /// original `target`/`messageType` (neither is preserved on `ChatMessage`)
    /// — it is re-addressed `OtherUser { username: to_username }`, which is
    /// the only target a resend is ever requested against.
    async fn run_resend_request(&self, to_username: &str, to_device_id: Uuid, remote_id: &str) -> Result<TaskOutcome, CoreError> {
        let Some((_, sealed)) = self.storage.get_chat_message_by_remote_id(remote_id).await? else {
            return Ok(TaskOutcome::FailNever);
        };
        let chat_message: cypher_proto::records::ChatMessage = self.key_store.open(&sealed).await?;

        let message = SingleCypherMessage {
            message_type: MessageType::Text,
            message_subtype: None,
            text: chat_message.text,
            metadata: chat_message.metadata,
            sent_date: Some(chat_message.send_date),
            order: chat_message.order,
            target: MessageTarget::OtherUser { username: to_username.to_string() },
        };

        self.run_send(&message, &[(to_username.to_string(), to_device_id)]).await
    }
}

/// Library entry point: one instance per logged-in device.
pub struct Messenger {
    identity_registry: Arc<IdentityRegistry>,
    pipeline: Arc<Pipeline>,
    job_queue: Arc<JobQueue>,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    key_store: KeyStore,
    identity: IdentityKeyPair,
    local_username: String,
    local_device_id: Uuid,
    /// In-memory mirror of the signed devices list; publishing it is the
    /// messenger's job, persisting the backing `DeviceConfig` (which needs
    /// the unlock password) is the embedding app's.
    local_devices: Mutex<Vec<UserDeviceConfig>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Messenger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: IdentityKeyPair,
        signed_prekey_secret: StaticSecret,
        local_username: String,
        local_device_id: Uuid,
        local_devices: Vec<UserDeviceConfig>,
        registry_mode: RegistryMode,
        storage: Arc<dyn Storage>,
        key_store: KeyStore,
        transport: Arc<dyn Transport>,
        plugin: Arc<dyn CorePlugin>,
    ) -> Arc<Self> {
        let identity_for_session = IdentityKeyPair::from_bytes(identity.secret_bytes()).expect("identity secret is always 32 bytes");
        let identity_for_runner = IdentityKeyPair::from_bytes(identity.secret_bytes()).expect("identity secret is always 32 bytes");

        let identity_registry = Arc::new(IdentityRegistry::new(
            storage.clone(),
            key_store.clone(),
            transport.clone(),
            local_username.clone(),
            local_device_id,
        ));
        let session_manager = Arc::new(SessionManager::new(identity_for_session, signed_prekey_secret, local_username.clone(), plugin.clone()));

        let runner = Arc::new(CoreTaskRunner {
            identity: identity_for_runner,
            identity_registry: identity_registry.clone(),
            session_manager: session_manager.clone(),
            storage: storage.clone(),
            key_store: key_store.clone(),
            transport: transport.clone(),
            local_username: local_username.clone(),
            local_device_id,
            pipeline: OnceLock::new(),
        });
        let job_queue = JobQueue::new(storage.clone(), key_store.clone(), transport.clone(), runner.clone());

        let pipeline = Arc::new(Pipeline::new(
            identity_registry.clone(),
            session_manager.clone(),
            job_queue.clone(),
            storage.clone(),
            key_store.clone(),
            plugin.clone(),
            local_username.clone(),
            local_device_id,
            registry_mode,
        ));
        runner.pipeline.set(pipeline.clone()).ok();

        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            identity_registry,
            pipeline,
            job_queue,
            transport,
            storage,
            key_store,
            identity,
            local_username,
            local_device_id,
            local_devices: Mutex::new(local_devices),
            shutdown_tx,
        })
    }

    /// Spawns the job queue worker and the transport event-delegate loop
    /// (§6.2). `events` is the receiving half of the `mpsc` channel the
    /// caller handed the transport's sending half at construction.
    pub fn spawn(self: &Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) -> tokio::task::JoinHandle<()> {
        self.job_queue.clone().spawn();

        let messenger = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(event) => messenger.handle_transport_event(event).await,
                            None => return,
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { return; }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.job_queue.shutdown();
    }

    /// §6.2: "The core MUST acknowledge events only after enqueueing the
    /// corresponding task" — every inbound envelope is durably queued, not
    /// processed inline, so it survives a crash between receipt and ack.
    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::MessageReceived { envelope } => {
                if let Err(err) = self.job_queue.queue_task(JobPayload::Receive { envelope }, false).await {
                    tracing::error!(?err, "failed to enqueue inbound envelope");
                }
            }
            TransportEvent::MessageDisplayed { message_id, by_device_id, .. } => {
                if let Err(err) = self.pipeline.apply_delivery_state_change(&message_id, by_device_id, DeliveryState::Read).await {
                    tracing::warn!(?err, message_id, "failed to apply read receipt");
                }
            }
            TransportEvent::RequestDeviceRegistery { username } => {
                if let Err(err) = self.identity_registry.rediscover_device_identities(&username).await {
                    tracing::warn!(?err, username, "rediscovery failed for a requested registry");
                }
            }
            TransportEvent::MessageSent { message_id } => {
                tracing::debug!(message_id, "relay accepted message");
            }
            TransportEvent::MultiRecipientMessageSent { envelope_id } => {
                tracing::debug!(%envelope_id, "relay accepted multi-recipient envelope");
            }
        }
    }

    /// Enqueues one message for delivery to the given devices (§4.6 `Send`).
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        message: SingleCypherMessage,
        recipients: Vec<(String, Uuid)>,
    ) -> Result<(), CoreError> {
        self.job_queue.queue_task(JobPayload::Send { conversation_id, message, recipients }, false).await
    }

    /// Signs and republishes the current devices list as-is, with no new
    /// device added and no contact announced. This is the first thing a
    /// freshly bootstrapped device should call: until some `UserConfig` has
    /// been published under `local_username`, every contact's
    /// `fetch_device_identities`/`rediscover_device_identities` call against
    /// this user has nothing to discover.
    pub async fn publish_own_bundle(&self) -> Result<(), CoreError> {
        let devices = self.local_devices.lock().clone();
        let signature = self.identity.sign(&codec::canonical_bytes(&devices)?);
        let user_config = UserConfig {
            username: self.local_username.clone(),
            identity_public_key: self.identity.public.clone(),
            devices,
            signature,
        };
        self.transport.publish_key_bundle(&user_config).await
    }

    /// §8 scenario 2: master-only. Adds `device_config` to the signed
    /// devices list, republishes the key bundle, then announces the new
    /// device to every existing contact. `device_config` must describe a
    /// sibling device, not the calling device itself — re-publishing the
    /// local device's own bundle is [`Messenger::publish_own_bundle`]'s job.
    pub async fn add_device(&self, device_config: UserDeviceConfig) -> Result<(), CoreError> {
        if self.pipeline.registry_mode() != RegistryMode::Master {
            return Err(CoreError::NotMasterDevice);
        }
        if device_config.device_id == self.local_device_id {
            return Err(CoreError::BadInput("add_device is for sibling devices; use publish_own_bundle to republish the local device".into()));
        }

        let devices = {
            let mut guard = self.local_devices.lock();
            guard.retain(|d| d.device_id != device_config.device_id);
            guard.push(device_config.clone());
            guard.clone()
        };
        let signature = self.identity.sign(&codec::canonical_bytes(&devices)?);
        let user_config = UserConfig {
            username: self.local_username.clone(),
            identity_public_key: self.identity.public.clone(),
            devices,
            signature,
        };
        self.transport.publish_key_bundle(&user_config).await?;

        let sibling = self
            .identity_registry
            .create_device_identity(&self.local_username, &self.identity.public.clone(), &device_config)
            .await?;
        self.identity_registry.save_device_identity(&sibling).await?;

        self.announce_device_to_contacts(&device_config).await
    }

    async fn announce_device_to_contacts(&self, device_config: &UserDeviceConfig) -> Result<(), CoreError> {
        for (_, sealed) in self.storage.all_contacts().await? {
            let contact: Contact = self.key_store.open(&sealed).await?;
            let devices = self.identity_registry.fetch_device_identities(&contact.username).await?;
            let recipients: Vec<(String, Uuid)> = devices.into_iter().map(|d| (d.username, d.device_id)).collect();
            if recipients.is_empty() {
                continue;
            }
            // Targeted `OtherUser` at the contact (not `CurrentUser`, which
            // is reserved for this account's own sibling devices) so the
            // contact's `handle_other_user` path picks it up and registers
            // the new device under our own username.
            let announce = SingleCypherMessage {
                message_type: MessageType::Magic,
                message_subtype: Some(magic::DEVICES_ANNOUNCE.to_string()),
                text: None,
                metadata: bson::to_document(device_config).map_err(cypher_proto::ProtoError::BsonEncode)?,
                sent_date: Some(chrono::Utc::now()),
                order: 0,
                target: MessageTarget::OtherUser { username: contact.username.clone() },
            };
            // One envelope per contact: the conversation id is irrelevant to
            // delivery, and every contact device receives their own copy.
            self.send_message(Uuid::new_v4(), announce.clone(), recipients).await?;
        }
        Ok(())
    }

    pub fn local_identity(&self) -> (&str, Uuid) {
        (&self.local_username, self.local_device_id)
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn identity_registry(&self) -> &Arc<IdentityRegistry> {
        &self.identity_registry
    }

    pub fn job_queue(&self) -> &Arc<JobQueue> {
        &self.job_queue
    }
}
