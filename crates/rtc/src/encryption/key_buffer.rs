//! Per-participant storage of inbound media keys, with the outdated-key
//! filter.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use calliope_core::UnixMillis;

use crate::participant::ParticipantId;

/// An inbound media key of a remote participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundKey {
    /// The index of the key in its sender's stream.
    pub index: u8,

    /// The raw key material.
    pub key: Vec<u8>,

    /// When the sender created this key, by its own clock.
    pub creation_ts: UnixMillis,
}

struct ParticipantKeys {
    by_index: HashMap<u8, InboundKey>,
    last_insert: Instant,
}

/// Holds the freshest key per `(participant, key index)`.
///
/// A candidate is rejected if and only if a previously accepted key at the
/// same slot carries a strictly greater `creation_ts`; everything arriving
/// out of order behind it is dropped.
#[derive(Default)]
pub(crate) struct KeyBuffer {
    participants: HashMap<ParticipantId, ParticipantKeys>,
}

impl KeyBuffer {
    /// Offers a key to the buffer. Returns `false` when the key is outdated
    /// and was dropped.
    pub fn insert(&mut self, participant: &ParticipantId, key: InboundKey) -> bool {
        let entry = self
            .participants
            .entry(participant.clone())
            .or_insert_with(|| ParticipantKeys {
                by_index: HashMap::new(),
                last_insert: Instant::now(),
            });
        entry.last_insert = Instant::now();

        match entry.by_index.get(&key.index) {
            Some(existing) if existing.creation_ts > key.creation_ts => false,
            _ => {
                entry.by_index.insert(key.index, key);
                true
            }
        }
    }

    /// Drops entries of participants for which `keep` returns `false` once
    /// they have been idle for longer than `ttl`.
    pub fn prune_idle(&mut self, keep: impl Fn(&ParticipantId) -> bool, ttl: Duration) {
        self.participants
            .retain(|id, keys| keep(id) || keys.last_insert.elapsed() <= ttl);
    }

    /// A snapshot of all stored keys, sorted by participant and key index.
    pub fn snapshot(&self) -> BTreeMap<ParticipantId, Vec<InboundKey>> {
        self.participants
            .iter()
            .map(|(id, keys)| {
                let mut keys: Vec<InboundKey> = keys.by_index.values().cloned().collect();
                keys.sort_by_key(|key| key.index);
                (id.clone(), keys)
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}
