//! Two-user demo: wires up a `Messenger` per user over an in-process
//! `InMemoryTransport` that hands envelopes straight from one user's
//! outbox to the other's `TransportEvent` channel, skipping an actual
//! network. Exercises device bootstrap, key-bundle discovery, and a
//! round-trip private message.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::Parser;
use cypher_core::{CorePlugin, CoreError, Messenger, PushType, Transport, TransportEvent};
use cypher_crypto::identity::IdentityKeyPair;
use cypher_crypto::x3dh::generate_signed_prekey;
use cypher_proto::{MessageTarget, MessageType, MultiRecipientEnvelope, RatchetedCypherMessage, SingleCypherMessage};
use cypher_proto::records::{DeviceConfig, RegistryMode, UserConfig, UserDeviceConfig};
use cypher_store::{KeyStore, SqliteStorage, Storage};
use parking_lot::Mutex as SyncMutex;
use rand::RngCore;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;
use x25519_dalek::StaticSecret;

#[derive(Parser)]
#[command(name = "cypher-cli")]
#[command(about = "Demo: two users exchange an end-to-end encrypted message", long_about = None)]
struct Cli {
    /// Text to send from alice to bob.
    #[arg(default_value = "hello from alice")]
    message: String,
}

/// Routes key-bundle publication and envelope delivery between two
/// in-process `Messenger`s. Stands in for an actual relay server.
struct Relay {
    user_configs: Mutex<HashMap<String, UserConfig>>,
    event_senders: Mutex<HashMap<String, mpsc::Sender<TransportEvent>>>,
}

impl Relay {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            user_configs: Mutex::new(HashMap::new()),
            event_senders: Mutex::new(HashMap::new()),
        })
    }

    async fn register(&self, username: &str, sender: mpsc::Sender<TransportEvent>) {
        self.event_senders.lock().await.insert(username.to_string(), sender);
    }
}

struct InMemoryTransport {
    relay: Arc<Relay>,
    local_username: String,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn read_key_bundle(&self, username: &str) -> Result<UserConfig, CoreError> {
        self.relay
            .user_configs
            .lock()
            .await
            .get(username)
            .cloned()
            .ok_or_else(|| CoreError::BadInput(format!("no key bundle published for {username}")))
    }

    async fn publish_key_bundle(&self, config: &UserConfig) -> Result<(), CoreError> {
        self.relay.user_configs.lock().await.insert(config.username.clone(), config.clone());
        Ok(())
    }

    async fn send_message(
        &self,
        _message: &RatchetedCypherMessage,
        _to_username: &str,
        _to_device_id: Uuid,
        _push_type: PushType,
        _message_id: &str,
    ) -> Result<(), CoreError> {
        Err(CoreError::UnsupportedTransport(
            "this demo only delivers multi-recipient envelopes".into(),
        ))
    }

    async fn send_multi_recipient_message(
        &self,
        envelope: &MultiRecipientEnvelope,
        _push_type: PushType,
        _message_id: &str,
    ) -> Result<(), CoreError> {
        let senders = self.relay.event_senders.lock().await;
        for key in &envelope.keys {
            if key.username == self.local_username {
                continue;
            }
            if let Some(sender) = senders.get(&key.username) {
                let _ = sender
                    .send(TransportEvent::MessageReceived { envelope: envelope.clone() })
                    .await;
            }
        }
        Ok(())
    }

    fn supports_multi_recipient(&self) -> bool {
        true
    }

    async fn send_message_received_receipt(&self, to_username: &str, to_device_id: Uuid, remote_id: &str) -> Result<(), CoreError> {
        tracing::info!(to_username, %to_device_id, remote_id, "received receipt (demo: not delivered)");
        Ok(())
    }

    async fn send_message_read_receipt(&self, to_username: &str, to_device_id: Uuid, remote_id: &str) -> Result<(), CoreError> {
        tracing::info!(to_username, %to_device_id, remote_id, "read receipt (demo: not delivered)");
        Ok(())
    }

    async fn request_device_registery(&self, config: &UserDeviceConfig) -> Result<(), CoreError> {
        tracing::info!(device_id = %config.device_id, "device registry request (demo: not delivered)");
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        true
    }
}

/// Prints every message the embedding app would otherwise have to poll for.
struct DemoPlugin {
    label: &'static str,
    received: SyncMutex<Vec<String>>,
}

impl DemoPlugin {
    fn new(label: &'static str) -> Self {
        Self { label, received: SyncMutex::new(Vec::new()) }
    }
}

#[async_trait]
impl CorePlugin for DemoPlugin {
    async fn on_message_change(&self, message: &cypher_proto::records::ChatMessage) {
        if let Some(text) = &message.text {
            println!("[{}] received: {text}", self.label);
            self.received.lock().push(text.clone());
        }
    }
}

struct DemoUser {
    username: String,
    device_id: Uuid,
    device_config: UserDeviceConfig,
    messenger: Arc<Messenger>,
    plugin: Arc<DemoPlugin>,
}

async fn bootstrap_user(relay: &Arc<Relay>, username: &str, label: &'static str) -> Result<(DemoUser, mpsc::Receiver<TransportEvent>)> {
    let identity = IdentityKeyPair::generate().map_err(|e| anyhow!(e))?;
    let device_id = Uuid::new_v4();
    let (spk_secret, spk_public, spk_signature) = generate_signed_prekey(&identity);

    let mut database_encryption_key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut database_encryption_key);
    let password = b"demo-password";
    let salt = b"demo-device-salt";

    let device_config_blob = DeviceConfig {
        username: username.to_string(),
        device_id,
        registry_mode: RegistryMode::Master,
        identity_secret: *identity.secret_bytes(),
        device_secret: [0u8; 32],
        signed_prekey_secret: spk_secret.to_bytes(),
        database_encryption_key,
        last_known_user_config: None,
    };
    let sealed_device_config = KeyStore::seal_device_config(password, salt, &device_config_blob)?;

    let key_store = KeyStore::new();
    key_store.unlock(password, salt, &sealed_device_config).await?;

    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open_in_memory().await?);
    let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport { relay: relay.clone(), local_username: username.to_string() });
    let plugin = Arc::new(DemoPlugin::new(label));

    let device_config = UserDeviceConfig {
        device_id,
        device_name: format!("{username}'s demo device"),
        public_key: cypher_crypto::identity::PublicKeyBytes(spk_public),
        signed_prekey_signature: spk_signature,
        is_master_device: true,
    };

    let messenger = Messenger::new(
        identity,
        StaticSecret::from(spk_secret.to_bytes()),
        username.to_string(),
        device_id,
        vec![device_config.clone()],
        RegistryMode::Master,
        storage,
        key_store,
        transport,
        plugin.clone(),
    );

    let (event_tx, event_rx) = mpsc::channel(32);
    relay.register(username, event_tx).await;

    Ok((
        DemoUser { username: username.to_string(), device_id, device_config, messenger, plugin },
        event_rx,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let relay = Relay::new();
    let (alice, alice_events) = bootstrap_user(&relay, "alice", "alice").await?;
    let (bob, bob_events) = bootstrap_user(&relay, "bob", "bob").await?;

    alice.messenger.publish_own_bundle().await?;
    bob.messenger.publish_own_bundle().await?;

    alice.messenger.identity_registry().fetch_device_identities(&bob.username).await?;
    bob.messenger.identity_registry().fetch_device_identities(&alice.username).await?;

    alice.messenger.spawn(alice_events);
    bob.messenger.spawn(bob_events);

    let message = SingleCypherMessage {
        message_type: MessageType::Text,
        message_subtype: None,
        text: Some(cli.message.clone()),
        metadata: bson::Document::new(),
        sent_date: Some(chrono::Utc::now()),
        order: 0,
        target: MessageTarget::OtherUser { username: bob.username.clone() },
    };

    alice
        .messenger
        .send_message(Uuid::new_v4(), message, vec![(bob.username.clone(), bob.device_id)])
        .await?;

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    if bob.plugin.received.lock().is_empty() {
        println!("(no message observed yet — this demo is timing-sensitive; rerun or raise the sleep)");
    }

    alice.messenger.shutdown();
    bob.messenger.shutdown();
    Ok(())
}
