//! Replicated key/value store.
//!
//! A state-based add/remove set of *blocks*. Every `put` creates a new block
//! for the key and tombstones the blocks it supersedes; every `delete`
//! tombstones all live blocks. A key's visible value is the live block with
//! the greatest `(priority, value)`, so replicas that hold the same blocks
//! and tombstones agree regardless of delivery order.
//!
//! # Storage layout
//!
//! ```text
//! /<ns>/s/e/<key>/<block>  →  priority (u64 BE) ‖ value
//! /<ns>/s/t/<key>/<block>  →  unix seconds (u64 BE)
//! ```
//!
//! Tombstones are kept until [`CrdtStore::compact_tombstones`] prunes them
//! together with their element.

mod broadcast;
mod compaction;
pub mod datastore;

pub use broadcast::{Broadcaster, GossipBroadcaster, run_rebroadcast, run_receiver};
pub use compaction::CompactionError;
pub use datastore::{Batch, Datastore, MemoryDatastore, RedbDatastore, StoreError};

use crate::peer::now_unix;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

const PRIORITY_BYTES: usize = 8;
pub(crate) const TIMESTAMP_BYTES: usize = 8;

/// Receives visible-value changes, local or remote.
#[async_trait]
pub trait StoreObserver: Send + Sync {
    async fn on_put(&self, key: &str, value: &[u8]);
    async fn on_delete(&self, key: &str);
}

/// An observer that ignores everything.
pub struct NoopObserver;

#[async_trait]
impl StoreObserver for NoopObserver {
    async fn on_put(&self, _key: &str, _value: &[u8]) {}
    async fn on_delete(&self, _key: &str) {}
}

/// A replicated element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementEntry {
    pub key: String,
    pub block: String,
    pub priority: u64,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
}

/// A replicated deletion marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneEntry {
    pub key: String,
    pub block: String,
    /// Unix seconds when the block was first deleted.
    #[serde(default)]
    pub timestamp: u64,
}

/// Unit of replication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub elements: Vec<ElementEntry>,
    #[serde(default)]
    pub tombstones: Vec<TombstoneEntry>,
}

impl Delta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.tombstones.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

struct Block {
    id: String,
    priority: u64,
    value: Vec<u8>,
}

/// The replicated store engine.
pub struct CrdtStore {
    namespace: String,
    replica: String,
    datastore: Arc<dyn Datastore>,
    observer: Arc<dyn StoreObserver>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    counter: AtomicU64,
    write_gate: Mutex<()>,
}

impl CrdtStore {
    /// Create a store over `datastore`. `namespace` is normalised to a
    /// leading-slash path; `replica` is this node's ID.
    pub fn new(
        namespace: &str,
        replica: impl Into<String>,
        datastore: Arc<dyn Datastore>,
        observer: Arc<dyn StoreObserver>,
        broadcaster: Option<Arc<dyn Broadcaster>>,
    ) -> Self {
        Self {
            namespace: format!("/{}", namespace.trim_matches('/')),
            replica: replica.into(),
            datastore,
            observer,
            broadcaster,
            counter: AtomicU64::new(0),
            write_gate: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub(crate) fn datastore(&self) -> &dyn Datastore {
        self.datastore.as_ref()
    }

    pub(crate) fn elems_prefix(&self) -> String {
        format!("{}/s/e", self.namespace)
    }

    pub(crate) fn tombs_prefix(&self) -> String {
        format!("{}/s/t", self.namespace)
    }

    fn elem_key(&self, key: &str, block: &str) -> String {
        format!("{}{}/{block}", self.elems_prefix(), normalize_key(key))
    }

    fn tomb_key(&self, key: &str, block: &str) -> String {
        format!("{}{}/{block}", self.tombs_prefix(), normalize_key(key))
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current visible value of `key`.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.visible(key)?.map(|b| b.value))
    }

    /// Every key with a visible value.
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let prefix = self.elems_prefix();
        let mut keys = BTreeSet::new();
        for (full, _) in self.datastore.query(&format!("{prefix}/"))? {
            if let Some((key, _)) = split_entry_key(&full, &prefix) {
                keys.insert(key);
            }
        }
        let mut visible = Vec::new();
        for key in keys {
            if self.visible(&key)?.is_some() {
                visible.push(key);
            }
        }
        Ok(visible)
    }

    /// Write `value` under `key`, superseding the current value.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let key = normalize_key(key);
        let delta = {
            let _gate = self.lock();
            let blocks = self.element_blocks(&key)?;
            let priority = blocks.iter().map(|b| b.priority).max().unwrap_or(0) + 1;
            let block = self.new_block_id(&key, value);

            let mut delta = Delta::default();
            let now = unix_seconds();
            for old in blocks {
                if !self.is_tombstoned(&key, &old.id)? {
                    self.datastore
                        .put(&self.tomb_key(&key, &old.id), &now.to_be_bytes())?;
                    delta.tombstones.push(TombstoneEntry {
                        key: key.clone(),
                        block: old.id,
                        timestamp: now,
                    });
                }
            }
            self.datastore
                .put(&self.elem_key(&key, &block), &encode_element(priority, value))?;
            delta.elements.push(ElementEntry {
                key: key.clone(),
                block,
                priority,
                value: value.to_vec(),
            });
            delta
        };

        self.observer.on_put(&key, value).await;
        self.broadcast(&delta).await;
        Ok(())
    }

    /// Tombstone every live block of `key`.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = normalize_key(key);
        let delta = {
            let _gate = self.lock();
            let now = unix_seconds();
            let mut delta = Delta::default();
            for block in self.live_blocks(&key)? {
                self.datastore
                    .put(&self.tomb_key(&key, &block.id), &now.to_be_bytes())?;
                delta.tombstones.push(TombstoneEntry {
                    key: key.clone(),
                    block: block.id,
                    timestamp: now,
                });
            }
            delta
        };

        if delta.is_empty() {
            return Ok(());
        }
        self.observer.on_delete(&key).await;
        self.broadcast(&delta).await;
        Ok(())
    }

    /// Merge a remote delta, notifying the observer of visible changes.
    pub async fn merge(&self, delta: &Delta) -> Result<(), StoreError> {
        let changes = {
            let _gate = self.lock();
            let touched: BTreeSet<String> = delta
                .elements
                .iter()
                .map(|e| normalize_key(&e.key))
                .chain(delta.tombstones.iter().map(|t| normalize_key(&t.key)))
                .collect();

            let mut before = Vec::with_capacity(touched.len());
            for key in &touched {
                before.push(self.visible(key)?.map(|b| b.value));
            }

            // Tombstones first so that an element and its tombstone arriving
            // together never surface the element.
            for tomb in &delta.tombstones {
                if !valid_segment(&tomb.block) {
                    continue;
                }
                let tomb_key = self.tomb_key(&tomb.key, &tomb.block);
                if self.datastore.get(&tomb_key)?.is_none() {
                    let timestamp = if tomb.timestamp == 0 {
                        unix_seconds()
                    } else {
                        tomb.timestamp
                    };
                    self.datastore.put(&tomb_key, &timestamp.to_be_bytes())?;
                }
            }
            for elem in &delta.elements {
                if !valid_segment(&elem.block) || self.is_tombstoned(&elem.key, &elem.block)? {
                    continue;
                }
                let elem_key = self.elem_key(&elem.key, &elem.block);
                if self.datastore.get(&elem_key)?.is_none() {
                    self.datastore
                        .put(&elem_key, &encode_element(elem.priority, &elem.value))?;
                }
            }

            let mut changes = Vec::new();
            for (key, old) in touched.into_iter().zip(before) {
                let new = self.visible(&key)?.map(|b| b.value);
                if new != old {
                    changes.push((key, new));
                }
            }
            changes
        };

        for (key, value) in changes {
            match value {
                Some(value) => {
                    debug!(key = %key, "replicated put");
                    self.observer.on_put(&key, &value).await;
                }
                None => {
                    debug!(key = %key, "replicated delete");
                    self.observer.on_delete(&key).await;
                }
            }
        }
        Ok(())
    }

    /// Every live element and every tombstone, for anti-entropy rebroadcast.
    pub fn state(&self) -> Result<Delta, StoreError> {
        let mut delta = Delta::default();

        let tombs_prefix = self.tombs_prefix();
        let mut tombstoned = BTreeSet::new();
        for (full, value) in self.datastore.query(&format!("{tombs_prefix}/"))? {
            let Some((key, block)) = split_entry_key(&full, &tombs_prefix) else {
                continue;
            };
            tombstoned.insert((key.clone(), block.clone()));
            delta.tombstones.push(TombstoneEntry {
                key,
                block,
                timestamp: decode_timestamp(&value),
            });
        }

        let elems_prefix = self.elems_prefix();
        for (full, value) in self.datastore.query(&format!("{elems_prefix}/"))? {
            let Some((key, block)) = split_entry_key(&full, &elems_prefix) else {
                continue;
            };
            if tombstoned.contains(&(key.clone(), block.clone())) {
                continue;
            }
            let (priority, value) = decode_element(&full, &value)?;
            delta.elements.push(ElementEntry {
                key,
                block,
                priority,
                value,
            });
        }
        Ok(delta)
    }

    async fn broadcast(&self, delta: &Delta) {
        let Some(broadcaster) = &self.broadcaster else {
            return;
        };
        match delta.encode() {
            Ok(bytes) => broadcaster.broadcast(bytes).await,
            Err(e) => warn!(error = %e, "failed to encode delta"),
        }
    }

    fn new_block_id(&self, key: &str, value: &[u8]) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(self.replica.as_bytes());
        hasher.update(counter.to_be_bytes());
        hasher.update(unix_seconds().to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update(value);
        hex::encode(hasher.finalize())
    }

    fn is_tombstoned(&self, key: &str, block: &str) -> Result<bool, StoreError> {
        Ok(self.datastore.get(&self.tomb_key(key, block))?.is_some())
    }

    fn element_blocks(&self, key: &str) -> Result<Vec<Block>, StoreError> {
        let prefix = format!("{}{}/", self.elems_prefix(), normalize_key(key));
        let mut blocks = Vec::new();
        for (full, value) in self.datastore.query(&prefix)? {
            let id = &full[prefix.len()..];
            // Deeper keys share the prefix but are not blocks of this key.
            if id.contains('/') || id.is_empty() {
                continue;
            }
            let (priority, value) = decode_element(&full, &value)?;
            blocks.push(Block {
                id: id.to_string(),
                priority,
                value,
            });
        }
        Ok(blocks)
    }

    fn live_blocks(&self, key: &str) -> Result<Vec<Block>, StoreError> {
        let mut live = Vec::new();
        for block in self.element_blocks(key)? {
            if !self.is_tombstoned(key, &block.id)? {
                live.push(block);
            }
        }
        Ok(live)
    }

    fn visible(&self, key: &str) -> Result<Option<Block>, StoreError> {
        Ok(self
            .live_blocks(key)?
            .into_iter()
            .max_by(|a, b| (a.priority, &a.value).cmp(&(b.priority, &b.value))))
    }
}

/// `/`-prefixed key without a trailing slash.
fn normalize_key(key: &str) -> String {
    format!("/{}", key.trim_matches('/'))
}

fn valid_segment(block: &str) -> bool {
    !block.is_empty() && !block.contains('/')
}

fn unix_seconds() -> u64 {
    u64::try_from(now_unix()).unwrap_or(0)
}

fn encode_element(priority: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PRIORITY_BYTES + value.len());
    out.extend_from_slice(&priority.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_element(key: &str, raw: &[u8]) -> Result<(u64, Vec<u8>), StoreError> {
    let Some((head, value)) = raw.split_first_chunk::<PRIORITY_BYTES>() else {
        return Err(StoreError::Corrupt {
            key: key.to_string(),
            reason: "element shorter than priority header".to_string(),
        });
    };
    Ok((u64::from_be_bytes(*head), value.to_vec()))
}

/// Tombstone timestamp in unix seconds; `0` when absent or short.
pub(crate) fn decode_timestamp(raw: &[u8]) -> u64 {
    raw.split_first_chunk::<TIMESTAMP_BYTES>()
        .map_or(0, |(head, _)| u64::from_be_bytes(*head))
}

/// Split `<prefix>/<key...>/<block>` into `("/<key...>", "<block>")`.
pub(crate) fn split_entry_key(full: &str, prefix: &str) -> Option<(String, String)> {
    let rest = full.strip_prefix(prefix)?;
    let (key, block) = rest.rsplit_once('/')?;
    if block.is_empty() || key.trim_matches('/').is_empty() {
        return None;
    }
    Some((key.to_string(), block.to_string()))
}
