//! Integration tests for the encryption manager.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use calliope_core::serde::Base64;
use calliope_core::UnixMillis;
use calliope_rtc::transport::{KeyTransport, KeyTransportError, ReceivedKey};
use calliope_rtc::{
    EncryptionConfig, EncryptionManager, MediaKeySink, ParticipantDevice, ParticipantId,
    SessionMember,
};

use common::session_member;

#[derive(Clone, Debug)]
struct SentKey {
    key: String,
    index: u8,
    targets: Vec<String>,
}

struct MockTransport {
    sends: Mutex<Vec<SentKey>>,
    tx: broadcast::Sender<ReceivedKey>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self { sends: Mutex::new(Vec::new()), tx })
    }

    fn sends(&self) -> Vec<SentKey> {
        self.sends.lock().unwrap().clone()
    }

    fn inject(&self, key: ReceivedKey) {
        self.tx.send(key).unwrap();
    }
}

#[async_trait]
impl KeyTransport for MockTransport {
    async fn start(&self) {}

    async fn stop(&self) {}

    async fn send_key(
        &self,
        key: &str,
        index: u8,
        members: &[ParticipantDevice],
    ) -> Result<(), KeyTransportError> {
        let mut targets: Vec<String> = members
            .iter()
            .map(|member| member.participant_id().to_string())
            .collect();
        targets.sort();
        self.sends.lock().unwrap().push(SentKey {
            key: key.to_owned(),
            index,
            targets,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ReceivedKey> {
        self.tx.subscribe()
    }
}

#[derive(Default)]
struct MockSink {
    keys: Mutex<Vec<(Vec<u8>, u8, String)>>,
}

impl MockSink {
    fn keys(&self) -> Vec<(Vec<u8>, u8, String)> {
        self.keys.lock().unwrap().clone()
    }

    fn keys_for(&self, participant: &str) -> Vec<(Vec<u8>, u8)> {
        self.keys()
            .into_iter()
            .filter(|(_, _, p)| p == participant)
            .map(|(key, index, _)| (key, index))
            .collect()
    }
}

impl MediaKeySink for MockSink {
    fn on_encryption_key(&self, key: &[u8], index: u8, participant: &ParticipantId) {
        self.keys
            .lock()
            .unwrap()
            .push((key.to_vec(), index, participant.to_string()));
    }
}

const SELF_ID: &str = "@alice:hs:ALICEDEV";
const BOB_ID: &str = "@bob:hs:BOB";
const CAROL_ID: &str = "@carol:hs:CAROL";

fn me() -> SessionMember {
    session_member("@alice:hs", "ALICEDEV", 1)
}

fn bob() -> SessionMember {
    session_member("@bob:hs", "BOB", 10)
}

fn carol() -> SessionMember {
    session_member("@carol:hs", "CAROL", 20)
}

fn setup() -> (Arc<MockTransport>, Arc<MockSink>, EncryptionManager) {
    let transport = MockTransport::new();
    let sink = Arc::new(MockSink::default());
    let manager = EncryptionManager::new(
        "@alice:hs".into(),
        "ALICEDEV".into(),
        transport.clone(),
        sink.clone(),
        EncryptionConfig::default(),
    );
    (transport, sink, manager)
}

#[tokio::test(start_paused = true)]
async fn the_first_key_reaches_the_media_layer_immediately() {
    let (transport, sink, manager) = setup();

    manager.join().await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let keys = sink.keys_for(SELF_ID);
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].1, 0);
    assert_eq!(keys[0].0.len(), 16);
    assert!(transport.sends().is_empty());
}

#[tokio::test(start_paused = true)]
async fn joiners_within_the_grace_window_share_the_existing_key() {
    let (transport, sink, manager) = setup();
    manager.join().await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    manager.on_memberships_update(vec![me(), bob()]);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let sends = transport.sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].index, 0);
    assert_eq!(sends[0].targets, vec![BOB_ID.to_owned()]);

    // Two seconds into a ten second grace window a joiner receives the
    // existing key, addressed to it alone, and no rotation happens.
    tokio::time::sleep(Duration::from_secs(2)).await;
    manager.on_memberships_update(vec![me(), bob(), carol()]);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let sends = transport.sends();
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[1].index, 0);
    assert_eq!(sends[1].key, sends[0].key);
    assert_eq!(sends[1].targets, vec![CAROL_ID.to_owned()]);

    assert_eq!(sink.keys_for(SELF_ID).len(), 1);
    assert_eq!(manager.statistics().keys_sent, 2);
}

#[tokio::test(start_paused = true)]
async fn a_departure_rotates_the_key() {
    let (transport, sink, manager) = setup();
    manager.join().await;
    manager.on_memberships_update(vec![me(), bob(), carol()]);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(transport.sends().len(), 1);

    manager.on_memberships_update(vec![me(), bob()]);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let sends = transport.sends();
    assert_eq!(sends.len(), 2);
    // The new key has the next id and goes to the remaining participants
    // only.
    assert_eq!(sends[1].index, 1);
    assert_ne!(sends[1].key, sends[0].key);
    assert_eq!(sends[1].targets, vec![BOB_ID.to_owned()]);

    // After the activation delay the media layer switches to the new key.
    let own_keys = sink.keys_for(SELF_ID);
    assert_eq!(own_keys.len(), 2);
    assert_eq!(own_keys[1].1, 1);
    assert_eq!(
        own_keys[1].0,
        Base64::parse(&sends[1].key).unwrap().into_inner()
    );
}

#[tokio::test(start_paused = true)]
async fn joiners_after_the_grace_window_trigger_a_rotation() {
    let (transport, _sink, manager) = setup();
    manager.join().await;
    manager.on_memberships_update(vec![me(), bob()]);
    tokio::time::sleep(Duration::from_millis(5)).await;

    tokio::time::sleep(Duration::from_secs(11)).await;
    manager.on_memberships_update(vec![me(), bob(), carol()]);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let sends = transport.sends();
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[1].index, 1);
    assert_eq!(
        sends[1].targets,
        vec![BOB_ID.to_owned(), CAROL_ID.to_owned()]
    );
}

#[tokio::test(start_paused = true)]
async fn a_rejoining_device_is_treated_as_a_fresh_recipient() {
    let (transport, _sink, manager) = setup();
    manager.join().await;
    manager.on_memberships_update(vec![me(), bob()]);
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Same device, new membership timestamp: its key context is stale.
    manager.on_memberships_update(vec![me(), session_member("@bob:hs", "BOB", 99)]);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let sends = transport.sends();
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[1].index, 0);
    assert_eq!(sends[1].targets, vec![BOB_ID.to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn out_of_order_inbound_keys_are_dropped() {
    let (_transport, sink, manager) = setup();
    manager.join().await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let fresh = Base64::new(b"0123456789abcdef".to_vec()).encode();
    let stale = Base64::new(vec![9u8; 16]).encode();

    manager.on_new_key_received("@bob:hs".into(), "BOB".into(), &fresh, 0, UnixMillis(100));
    manager.on_new_key_received("@bob:hs".into(), "BOB".into(), &stale, 0, UnixMillis(90));

    let bob_keys = sink.keys_for(BOB_ID);
    assert_eq!(bob_keys.len(), 1);
    assert_eq!(bob_keys[0].0, b"0123456789abcdef");
    assert_eq!(manager.statistics().keys_received, 1);

    let stored = manager.get_encryption_keys();
    let participant = ParticipantId::new("@bob:hs".into(), "BOB".into());
    assert_eq!(stored[&participant][0].creation_ts, UnixMillis(100));
}

#[tokio::test(start_paused = true)]
async fn keys_arrive_through_the_transport_subscription() {
    let (transport, sink, manager) = setup();
    manager.join().await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    transport.inject(ReceivedKey {
        user_id: "@bob:hs".into(),
        device_id: "BOB".into(),
        key: Base64::new(vec![7u8; 16]).encode(),
        index: 3,
        timestamp: UnixMillis(1000),
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(sink.keys_for(BOB_ID), vec![(vec![7u8; 16], 3)]);
}

#[tokio::test(start_paused = true)]
async fn leave_clears_the_participant_keys() {
    let (_transport, _sink, manager) = setup();
    manager.join().await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let key = Base64::new(vec![1u8; 16]).encode();
    manager.on_new_key_received("@bob:hs".into(), "BOB".into(), &key, 0, UnixMillis(1));
    assert_eq!(manager.get_encryption_keys().len(), 1);

    manager.leave().await;
    assert!(manager.get_encryption_keys().is_empty());
}
