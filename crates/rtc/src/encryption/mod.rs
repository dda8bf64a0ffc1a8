//! The encryption manager.
//!
//! Owns the single outbound media key for the local sender, rotates it with
//! leaver/joiner semantics, distributes it over the configured
//! [`KeyTransport`] to exactly the current co-participants, and ingests
//! inbound keys from the other participants.

mod key_buffer;

pub use key_buffer::InboundKey;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::RngCore;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use calliope_core::serde::Base64;
use calliope_core::{DeviceId, OwnedDeviceId, OwnedUserId, UnixMillis, UserId};

use crate::config::EncryptionConfig;
use crate::participant::{ParticipantDevice, ParticipantId, SessionMember};
use crate::transport::{KeyTransport, ReceivedKey};

use self::key_buffer::KeyBuffer;

/// Receives media keys on behalf of the frame encryption layer.
pub trait MediaKeySink: Send + Sync {
    /// A key became authoritative for `participant` at `index`.
    ///
    /// For the local participant this is the outbound key to encrypt with
    /// from now on; for remote participants it is the key their frames
    /// decrypt with.
    fn on_encryption_key(&self, key: &[u8], index: u8, participant: &ParticipantId);
}

/// Counters for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct KeyStatistics {
    /// Outbound distribution cycles that reached the transport.
    pub keys_sent: u64,
    /// Inbound keys accepted and forwarded to the media layer.
    pub keys_received: u64,
}

#[derive(Default)]
struct Stats {
    keys_sent: AtomicU64,
    keys_received: AtomicU64,
}

/// The current outbound key of the local sender.
struct OutboundSession {
    key: [u8; 16],
    key_id: u8,
    creation_ts: Instant,
    shared_with: HashSet<ParticipantDevice>,
}

impl OutboundSession {
    fn fresh(key_id: u8) -> Self {
        let mut key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            key,
            key_id,
            creation_ts: Instant::now(),
            shared_with: HashSet::new(),
        }
    }

    fn rotate(&mut self) {
        *self = Self::fresh(self.key_id.wrapping_add(1));
    }
}

struct RunningState {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct EncryptionInner {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    participant_id: ParticipantId,
    transport: Arc<dyn KeyTransport>,
    sink: Arc<dyn MediaKeySink>,
    config: EncryptionConfig,
    memberships: Mutex<Vec<SessionMember>>,
    buffer: Mutex<KeyBuffer>,
    stats: Stats,
    distribute: Notify,
    running: Mutex<Option<RunningState>>,
}

impl EncryptionInner {
    fn buffer(&self) -> MutexGuard<'_, KeyBuffer> {
        self.buffer.lock().expect("key buffer poisoned")
    }

    fn ingest(&self, received: ReceivedKey) {
        let participant = ParticipantId::new(&received.user_id, &received.device_id);
        let key = match Base64::parse(&received.key) {
            Ok(key) => key.into_inner(),
            Err(error) => {
                warn!(
                    participant = %participant,
                    "dropping inbound media key that is not valid base64: {error}"
                );
                return;
            }
        };

        let accepted = self.buffer().insert(
            &participant,
            InboundKey {
                index: received.index,
                key: key.clone(),
                creation_ts: received.timestamp,
            },
        );
        if !accepted {
            trace!(participant = %participant, index = received.index, "dropping outdated key");
            return;
        }

        self.stats.keys_received.fetch_add(1, Ordering::Relaxed);
        self.sink.on_encryption_key(&key, received.index, &participant);
    }
}

/// Distributes the local sender's media key and collects everyone else's.
///
/// Distribution cycles are serialized; requests arriving while a cycle is
/// in flight coalesce into exactly one follow-up cycle.
pub struct EncryptionManager {
    inner: Arc<EncryptionInner>,
}

impl EncryptionManager {
    /// Creates a new manager for the given device.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        transport: Arc<dyn KeyTransport>,
        sink: Arc<dyn MediaKeySink>,
        config: EncryptionConfig,
    ) -> Self {
        let participant_id = ParticipantId::new(&user_id, &device_id);
        Self {
            inner: Arc::new(EncryptionInner {
                user_id,
                device_id,
                participant_id,
                transport,
                sink,
                config,
                memberships: Mutex::new(Vec::new()),
                buffer: Mutex::new(KeyBuffer::default()),
                stats: Stats::default(),
                distribute: Notify::new(),
                running: Mutex::new(None),
            }),
        }
    }

    /// Starts the transport, subscribes to inbound keys and triggers the
    /// initial key distribution.
    ///
    /// The first outbound key carries index 0 and is handed to the media
    /// layer immediately; later keys are delayed by
    /// [`use_key_delay`](EncryptionConfig::use_key_delay).
    pub async fn join(&self) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut running = self.inner.running.lock().expect("running state poisoned");
            if running.is_some() {
                debug!("encryption manager is already running, ignoring join");
                return;
            }
            *running = Some(RunningState { shutdown: shutdown_tx, tasks: Vec::new() });
        }

        self.inner.transport.start().await;
        let inbound = self.inner.transport.subscribe();

        let tasks = vec![
            tokio::spawn(receive_loop(
                self.inner.clone(),
                inbound,
                shutdown_rx.clone(),
            )),
            tokio::spawn(rollout_loop(self.inner.clone(), shutdown_rx)),
        ];
        if let Some(running) = self
            .inner
            .running
            .lock()
            .expect("running state poisoned")
            .as_mut()
        {
            running.tasks = tasks;
        }
    }

    /// Stops the transport and drops all participant keys.
    pub async fn leave(&self) {
        let running = self
            .inner
            .running
            .lock()
            .expect("running state poisoned")
            .take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown.send(true);
        for task in running.tasks {
            task.abort();
        }
        self.inner.transport.stop().await;
        self.inner.buffer().clear();
    }

    /// Feeds the currently observed memberships of the session into the
    /// manager and requests a distribution cycle.
    pub fn on_memberships_update(&self, memberships: Vec<SessionMember>) {
        let current: HashSet<ParticipantId> = memberships
            .iter()
            .map(|member| ParticipantId::new(&member.user_id, member.device_id()))
            .collect();
        *self
            .inner
            .memberships
            .lock()
            .expect("membership snapshot poisoned") = memberships;

        // Keys of participants that left are only kept for a short idle
        // window.
        self.inner
            .buffer()
            .prune_idle(|id| current.contains(id), self.inner.config.key_buffer_ttl);

        self.inner.distribute.notify_one();
    }

    /// Ingests an inbound key, normally called by the transport
    /// subscription.
    ///
    /// Out-of-order keys older than the freshest already seen for the same
    /// `(participant, index)` slot are dropped.
    pub fn on_new_key_received(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        key: &str,
        index: u8,
        timestamp: UnixMillis,
    ) {
        self.inner.ingest(ReceivedKey {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            key: key.to_owned(),
            index,
            timestamp,
        });
    }

    /// A snapshot of all stored inbound keys by participant.
    pub fn get_encryption_keys(&self) -> BTreeMap<ParticipantId, Vec<InboundKey>> {
        self.inner.buffer().snapshot()
    }

    /// A snapshot of the distribution counters.
    pub fn statistics(&self) -> KeyStatistics {
        KeyStatistics {
            keys_sent: self.inner.stats.keys_sent.load(Ordering::Relaxed),
            keys_received: self.inner.stats.keys_received.load(Ordering::Relaxed),
        }
    }
}

async fn receive_loop(
    inner: Arc<EncryptionInner>,
    mut inbound: broadcast::Receiver<ReceivedKey>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = inbound.recv() => match received {
                Ok(key) => inner.ingest(key),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("dropped {count} inbound key events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn rollout_loop(inner: Arc<EncryptionInner>, mut shutdown: watch::Receiver<bool>) {
    let mut outbound = OutboundSession::fresh(0);
    // The first key is used right away; there is nothing encrypted with it
    // in flight yet.
    inner
        .sink
        .on_encryption_key(&outbound.key, outbound.key_id, &inner.participant_id);

    loop {
        rollout_outbound_key(&inner, &mut outbound).await;
        tokio::select! {
            _ = inner.distribute.notified() => {}
            _ = shutdown.changed() => break,
        }
    }
}

/// One distribution cycle.
async fn rollout_outbound_key(inner: &EncryptionInner, outbound: &mut OutboundSession) {
    let to_share: HashSet<ParticipantDevice> = {
        let memberships = inner
            .memberships
            .lock()
            .expect("membership snapshot poisoned");
        memberships
            .iter()
            .filter(|member| !member.is_device(&inner.user_id, &inner.device_id))
            .map(SessionMember::to_device)
            .collect()
    };

    // A device that rejoined shows up with a new membership timestamp; its
    // prior key context is stale and it must be treated as a fresh joiner.
    outbound.shared_with.retain(|device| {
        to_share.contains(device)
            || !to_share.iter().any(|other| other.is_same_device(device))
    });

    let any_left: Vec<ParticipantDevice> =
        outbound.shared_with.difference(&to_share).cloned().collect();
    let any_joined: Vec<ParticipantDevice> =
        to_share.difference(&outbound.shared_with).cloned().collect();

    let mut has_key_changed = false;
    let target: Vec<ParticipantDevice>;

    if !any_left.is_empty() {
        debug!(
            left = any_left.len(),
            "rotating the outbound key because participants left"
        );
        outbound.rotate();
        has_key_changed = true;
        target = to_share.into_iter().collect();
    } else if !any_joined.is_empty() {
        if outbound.creation_ts.elapsed() < inner.config.key_rotation_grace_period {
            // Within the grace window joiners get the existing key; this
            // suppresses rotation storms while a call fills up.
            target = any_joined;
        } else {
            outbound.rotate();
            has_key_changed = true;
            target = to_share.into_iter().collect();
        }
    } else {
        return;
    }

    if !target.is_empty() {
        let encoded = Base64::new(outbound.key.to_vec()).encode();
        match inner
            .transport
            .send_key(&encoded, outbound.key_id, &target)
            .await
        {
            Ok(()) => {
                outbound.shared_with.extend(target);
                inner.stats.keys_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                // The targets stay outside `shared_with`, so the next
                // membership update retargets them.
                warn!("failed to distribute the media key: {error}");
            }
        }
    }

    if has_key_changed {
        tokio::time::sleep(inner.config.use_key_delay).await;
        inner
            .sink
            .on_encryption_key(&outbound.key, outbound.key_id, &inner.participant_id);
    }
}
