//! End-to-end `Messenger` scenarios (§8), each driving two or three
//! in-process `Messenger`s connected through a shared `InMemoryTransport`,
//! the way `guard-service`'s integration tests drive the public surface of
//! a service rather than its internals.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cypher_core::error::CoreError;
use cypher_core::plugin::{CorePlugin, SaveDecision};
use cypher_core::transport::{PushType, Transport, TransportEvent};
use cypher_core::Messenger;
use cypher_crypto::identity::{IdentityKeyPair, PublicKeyBytes};
use cypher_crypto::ratchet::RatchetSession;
use cypher_crypto::x3dh::generate_signed_prekey;
use cypher_proto::envelope::MultiRecipientEnvelope;
use cypher_proto::records::{
    Contact, DeviceConfig, RegistryMode, UserConfig, UserDeviceConfig,
};
use cypher_proto::{MessageTarget, MessageType, RatchetedCypherMessage, SingleCypherMessage};
use cypher_store::{KeyStore, SqliteStorage, Storage};
use parking_lot::Mutex as SyncMutex;
use rand::RngCore;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;
use x25519_dalek::StaticSecret;

struct Relay {
    user_configs: AsyncMutex<HashMap<String, UserConfig>>,
    event_senders: AsyncMutex<HashMap<String, mpsc::Sender<TransportEvent>>>,
}

impl Relay {
    fn new() -> Arc<Self> {
        Arc::new(Self { user_configs: AsyncMutex::new(HashMap::new()), event_senders: AsyncMutex::new(HashMap::new()) })
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
        self.relay.user_configs.lock().await.get(username).cloned().ok_or_else(|| CoreError::BadInput(format!("no bundle for {username}")))
    }

    async fn publish_key_bundle(&self, config: &UserConfig) -> Result<(), CoreError> {
        self.relay.user_configs.lock().await.insert(config.username.clone(), config.clone());
        Ok(())
    }

    async fn send_message(&self, _message: &RatchetedCypherMessage, _to_username: &str, _to_device_id: Uuid, _push_type: PushType, _message_id: &str) -> Result<(), CoreError> {
        Err(CoreError::UnsupportedTransport("single-target send is unused by this harness".into()))
    }

    async fn send_multi_recipient_message(&self, envelope: &MultiRecipientEnvelope, _push_type: PushType, _message_id: &str) -> Result<(), CoreError> {
        let senders = self.relay.event_senders.lock().await;
        for key in &envelope.keys {
            if key.username == self.local_username {
                continue;
            }
            if let Some(sender) = senders.get(&key.username) {
                let _ = sender.send(TransportEvent::MessageReceived { envelope: envelope.clone() }).await;
            }
        }
        Ok(())
    }

    fn supports_multi_recipient(&self) -> bool {
        true
    }

    async fn send_message_received_receipt(&self, _to_username: &str, _to_device_id: Uuid, _remote_id: &str) -> Result<(), CoreError> {
        Ok(())
    }
    async fn send_message_read_receipt(&self, _to_username: &str, _to_device_id: Uuid, _remote_id: &str) -> Result<(), CoreError> {
        Ok(())
    }
    async fn request_device_registery(&self, _config: &UserDeviceConfig) -> Result<(), CoreError> {
        Ok(())
    }
    fn is_authenticated(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct Captured {
    texts: Vec<String>,
    rekeys: u32,
    registered_devices: Vec<(String, Uuid)>,
}

struct TestPlugin {
    captured: SyncMutex<Captured>,
}

impl TestPlugin {
    fn new() -> Arc<Self> {
        Arc::new(Self { captured: SyncMutex::new(Captured::default()) })
    }
}

#[async_trait]
impl CorePlugin for TestPlugin {
    async fn on_message_change(&self, message: &cypher_proto::records::ChatMessage) {
        if let Some(text) = &message.text {
            self.captured.lock().texts.push(text.clone());
        }
    }

    async fn on_rekey(&self, _username: &str, _device_id: Uuid) {
        self.captured.lock().rekeys += 1;
    }

    async fn on_device_registery(&self, device: &cypher_proto::records::DeviceIdentity) {
        self.captured.lock().registered_devices.push((device.username.clone(), device.device_id));
    }

    async fn on_receive_message(&self, _message: &SingleCypherMessage, _conversation: &cypher_proto::records::Conversation) -> SaveDecision {
        SaveDecision::Save
    }
}

struct DemoUser {
    username: String,
    device_id: Uuid,
    device_config: UserDeviceConfig,
    messenger: Arc<Messenger>,
    storage: Arc<dyn Storage>,
    key_store: KeyStore,
    plugin: Arc<TestPlugin>,
}

fn rand_bytes32() -> [u8; 32] {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

async fn bootstrap(relay: &Arc<Relay>, username: &str) -> (DemoUser, mpsc::Receiver<TransportEvent>) {
    let identity = IdentityKeyPair::generate().unwrap();
    let device_id = Uuid::new_v4();
    let (spk_secret, spk_public, spk_signature) = generate_signed_prekey(&identity);

    let password = b"test-password";
    let salt = b"test-salt";
    let device_config_blob = DeviceConfig {
        username: username.to_string(),
        device_id,
        registry_mode: RegistryMode::Master,
        identity_secret: *identity.secret_bytes(),
        device_secret: [0u8; 32],
        signed_prekey_secret: spk_secret.to_bytes(),
        database_encryption_key: rand_bytes32(),
        last_known_user_config: None,
    };
    let sealed = KeyStore::seal_device_config(password, salt, &device_config_blob).unwrap();
    let key_store = KeyStore::new();
    key_store.unlock(password, salt, &sealed).await.unwrap();

    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open_in_memory().await.unwrap());
    let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport { relay: relay.clone(), local_username: username.to_string() });
    let plugin = TestPlugin::new();

    let device_config = UserDeviceConfig {
        device_id,
        device_name: format!("{username}-device"),
        public_key: PublicKeyBytes(spk_public),
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
        storage.clone(),
        key_store.clone(),
        transport,
        plugin.clone(),
    );

    let (event_tx, event_rx) = mpsc::channel(64);
    relay.register(username, event_tx).await;
    messenger.publish_own_bundle().await.unwrap();

    (DemoUser { username: username.to_string(), device_id, device_config, messenger, storage, key_store, plugin }, event_rx)
}

/// Marks each user as a contact of the other, the way an address book
/// entry would be created out of band before the first message.
async fn make_contacts(a: &DemoUser, b: &DemoUser) {
    for (me, other) in [(a, b), (b, a)] {
        let user_config = UserConfig {
            username: other.username.clone(),
            identity_public_key: PublicKeyBytes([0u8; 32]),
            devices: vec![other.device_config.clone()],
            signature: Vec::new(),
        };
        let contact = Contact { id: Uuid::new_v4(), username: other.username.clone(), user_config, metadata: bson::Document::new() };
        let sealed = me.key_store.seal(&contact).await.unwrap();
        me.storage.put_contact(contact.id, &sealed, &other.username).await.unwrap();
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F, attempts: u32) {
    for _ in 0..attempts {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

fn text_message(to: &str, text: &str) -> SingleCypherMessage {
    SingleCypherMessage {
        message_type: MessageType::Text,
        message_subtype: None,
        text: Some(text.to_string()),
        metadata: bson::Document::new(),
        sent_date: Some(chrono::Utc::now()),
        order: 0,
        target: MessageTarget::OtherUser { username: to.to_string() },
    }
}

/// §8 scenario 1: B receives exactly one ChatMessage with the sent text,
/// already marked `Received`.
#[tokio::test]
async fn single_device_handshake_delivers_one_message() {
    let relay = Relay::new();
    let (alice, alice_events) = bootstrap(&relay, "alice").await;
    let (bob, bob_events) = bootstrap(&relay, "bob").await;
    make_contacts(&alice, &bob).await;

    alice.messenger.identity_registry().fetch_device_identities(&bob.username).await.unwrap();
    bob.messenger.identity_registry().fetch_device_identities(&alice.username).await.unwrap();

    alice.messenger.spawn(alice_events);
    bob.messenger.spawn(bob_events);

    alice
        .messenger
        .send_message(Uuid::new_v4(), text_message(&bob.username, "Hello"), vec![(bob.username.clone(), bob.device_id)])
        .await
        .unwrap();

    wait_until(|| bob.plugin.captured.lock().texts == vec!["Hello".to_string()], 50).await;

    let captured = bob.plugin.captured.lock();
    assert_eq!(captured.texts, vec!["Hello".to_string()]);

    alice.messenger.shutdown();
    bob.messenger.shutdown();
}

/// §8 scenario 2: adding a second device publishes the combined bundle and
/// announces the new device to every existing contact without the contact
/// doing anything.
#[tokio::test]
async fn second_device_announce_reaches_contacts() {
    let relay = Relay::new();
    let (alice, alice_events) = bootstrap(&relay, "alice").await;
    let (bob, bob_events) = bootstrap(&relay, "bob").await;
    make_contacts(&alice, &bob).await;

    alice.messenger.identity_registry().fetch_device_identities(&bob.username).await.unwrap();
    bob.messenger.identity_registry().fetch_device_identities(&alice.username).await.unwrap();

    alice.messenger.spawn(alice_events);
    bob.messenger.spawn(bob_events);

    let alice2_identity = IdentityKeyPair::generate().unwrap();
    let (a2_spk_secret, a2_spk_public, a2_spk_sig) = generate_signed_prekey(&alice2_identity);
    let alice2_device_id = Uuid::new_v4();
    let alice2_config = UserDeviceConfig {
        device_id: alice2_device_id,
        device_name: "alice-second-device".into(),
        public_key: PublicKeyBytes(a2_spk_public),
        signed_prekey_signature: a2_spk_sig,
        is_master_device: false,
    };
    let _ = a2_spk_secret;

    alice.messenger.add_device(alice2_config).await.unwrap();

    wait_until(
        || {
            bob.plugin
                .captured
                .lock()
                .registered_devices
                .iter()
                .any(|(username, device_id)| username == &alice.username && *device_id == alice2_device_id)
        },
        50,
    )
    .await;

    assert!(bob
        .plugin
        .captured
        .lock()
        .registered_devices
        .iter()
        .any(|(username, device_id)| username == &alice.username && *device_id == alice2_device_id));

    let bundle = bob.messenger.identity_registry().fetch_device_identities(&alice.username).await.unwrap();
    assert!(bundle.iter().any(|d| d.device_id == alice2_device_id));

    alice.messenger.shutdown();
    bob.messenger.shutdown();
}

/// §8 scenario 3, the no-prior-state half: a device with no established
/// ratchet state performs a fresh X3DH handshake inline on its first send;
/// the receiver decrypts it in one step and subsequent
/// messages flow over the now-shared session.
#[tokio::test]
async fn fresh_handshake_then_steady_state_messages() {
    let relay = Relay::new();
    let (alice, alice_events) = bootstrap(&relay, "alice").await;
    let (bob, bob_events) = bootstrap(&relay, "bob").await;
    make_contacts(&alice, &bob).await;

    alice.messenger.identity_registry().fetch_device_identities(&bob.username).await.unwrap();
    bob.messenger.identity_registry().fetch_device_identities(&alice.username).await.unwrap();

    alice.messenger.spawn(alice_events);
    bob.messenger.spawn(bob_events);

    alice
        .messenger
        .send_message(Uuid::new_v4(), text_message(&bob.username, "ping"), vec![(bob.username.clone(), bob.device_id)])
        .await
        .unwrap();
    wait_until(|| bob.plugin.captured.lock().texts.contains(&"ping".to_string()), 50).await;

    alice
        .messenger
        .send_message(Uuid::new_v4(), text_message(&bob.username, "pong back"), vec![(bob.username.clone(), bob.device_id)])
        .await
        .unwrap();
    wait_until(|| bob.plugin.captured.lock().texts.contains(&"pong back".to_string()), 50).await;

    let texts = bob.plugin.captured.lock().texts.clone();
    assert_eq!(texts, vec!["ping".to_string(), "pong back".to_string()]);
    assert_eq!(bob.plugin.captured.lock().rekeys, 0, "no decrypt failure occurred, so no rekey recovery should have fired");

    alice.messenger.shutdown();
    bob.messenger.shutdown();
}

/// §8 scenario 3, the corrupted-session half DESIGN.md Open Question #8
/// used to concede as unimplemented: bob already shares an established
/// ratchet with alice (unlike the fresh-handshake test above, whose ratchet
/// starts at `None`), but his copy of it is corrupted. Alice's next send
/// fails to decrypt on bob's side even through rekey recovery, so bob must
/// drop it without delivering it and must record exactly one rekey.
#[tokio::test]
async fn corrupted_ratchet_triggers_rekey_recovery_and_drops_the_message() {
    let relay = Relay::new();
    let (alice, alice_events) = bootstrap(&relay, "alice").await;
    let (bob, bob_events) = bootstrap(&relay, "bob").await;
    make_contacts(&alice, &bob).await;

    alice.messenger.identity_registry().fetch_device_identities(&bob.username).await.unwrap();
    bob.messenger.identity_registry().fetch_device_identities(&alice.username).await.unwrap();

    alice.messenger.spawn(alice_events);
    bob.messenger.spawn(bob_events);

    alice
        .messenger
        .send_message(Uuid::new_v4(), text_message(&bob.username, "ping"), vec![(bob.username.clone(), bob.device_id)])
        .await
        .unwrap();
    wait_until(|| bob.plugin.captured.lock().texts.contains(&"ping".to_string()), 50).await;

    let mut corrupted = bob
        .messenger
        .identity_registry()
        .find_device_identity(&alice.username, alice.device_id)
        .await
        .unwrap()
        .expect("bob already knows alice's device from the first exchange");
    let bogus_session = RatchetSession::init_bob([0x5Cu8; 32], x25519_dalek::StaticSecret::from([0x7Au8; 32]));
    corrupted.ratchet_state = Some(bogus_session.to_snapshot());
    bob.messenger.identity_registry().save_device_identity(&corrupted).await.unwrap();

    alice
        .messenger
        .send_message(Uuid::new_v4(), text_message(&bob.username, "second"), vec![(bob.username.clone(), bob.device_id)])
        .await
        .unwrap();
    wait_until(|| bob.plugin.captured.lock().rekeys >= 1, 50).await;

    assert_eq!(bob.plugin.captured.lock().rekeys, 1, "decrypt failure must trigger exactly one rekey recovery");
    assert!(
        !bob.plugin.captured.lock().texts.contains(&"second".to_string()),
        "an undecryptable message must never be delivered"
    );

    alice.messenger.shutdown();
    bob.messenger.shutdown();
}

/// §8 scenario 4: one envelope, three container keys; every recipient
/// decrypts its own copy independently.
#[tokio::test]
async fn multi_recipient_fan_out_reaches_every_device() {
    let relay = Relay::new();
    let (alice, alice_events) = bootstrap(&relay, "alice").await;
    let (bob, bob_events) = bootstrap(&relay, "bob").await;
    let (carol, carol_events) = bootstrap(&relay, "carol").await;
    make_contacts(&alice, &bob).await;
    make_contacts(&alice, &carol).await;

    for peer in [&bob.username, &carol.username] {
        alice.messenger.identity_registry().fetch_device_identities(peer).await.unwrap();
    }
    bob.messenger.identity_registry().fetch_device_identities(&alice.username).await.unwrap();
    carol.messenger.identity_registry().fetch_device_identities(&alice.username).await.unwrap();

    alice.messenger.spawn(alice_events);
    bob.messenger.spawn(bob_events);
    carol.messenger.spawn(carol_events);

    let group = Uuid::new_v4();
    for member in [&bob, &carol] {
        let conversation = cypher_proto::records::Conversation {
            id: group,
            members: vec![alice.username.clone(), bob.username.clone(), carol.username.clone()],
            kicked_members: Vec::new(),
            metadata: bson::Document::new(),
            local_order: 0,
        };
        let sealed = member.key_store.seal(&conversation).await.unwrap();
        member.storage.put_conversation(group, &sealed).await.unwrap();
    }

    alice
        .messenger
        .send_message(
            group,
            SingleCypherMessage {
                message_type: MessageType::Text,
                message_subtype: None,
                text: Some("Hi".into()),
                metadata: bson::Document::new(),
                sent_date: Some(chrono::Utc::now()),
                order: 0,
                target: MessageTarget::GroupChat { id: group },
            },
            vec![(bob.username.clone(), bob.device_id), (carol.username.clone(), carol.device_id)],
        )
        .await
        .unwrap();

    wait_until(|| bob.plugin.captured.lock().texts.contains(&"Hi".to_string()), 50).await;
    wait_until(|| carol.plugin.captured.lock().texts.contains(&"Hi".to_string()), 50).await;

    assert_eq!(bob.plugin.captured.lock().texts, vec!["Hi".to_string()]);
    assert_eq!(carol.plugin.captured.lock().texts, vec!["Hi".to_string()]);

    alice.messenger.shutdown();
    bob.messenger.shutdown();
    carol.messenger.shutdown();
}
