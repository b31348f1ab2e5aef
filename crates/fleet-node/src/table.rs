//! Local peer table.
//!
//! An in-process view of the replicated registry overlaid with locally
//! observed connectivity. All access goes through one async mutex, and no
//! operation awaits network I/O while holding it.

use crate::peer::{Peer, id_from_key, now_unix, peer_key};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("malformed peer record for {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// How an update treats the `connected` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connectivity {
    /// Take the incoming value.
    Incoming,
    /// Keep the existing entry's value; new entries start disconnected.
    Preserve,
}

/// Mapping from `"/" + node ID` to [`Peer`].
#[derive(Debug, Default)]
pub struct PeerTable {
    entries: Mutex<BTreeMap<String, Peer>>,
}

impl PeerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `raw` and store it under `key`.
    ///
    /// An incoming record without `last_seen` inherits the existing one;
    /// otherwise `last_seen` is stamped with the current time and never
    /// regresses. Malformed payloads leave the table untouched.
    pub async fn update(&self, key: &str, raw: &[u8]) -> Result<Peer, TableError> {
        self.update_at(key, raw, now_unix(), Connectivity::Incoming).await
    }

    /// Like [`update`](Self::update) but keeps the locally observed
    /// `connected` flag. Used for records arriving through replication.
    pub async fn update_replicated(&self, key: &str, raw: &[u8]) -> Result<Peer, TableError> {
        self.update_at(key, raw, now_unix(), Connectivity::Preserve).await
    }

    async fn update_at(
        &self,
        key: &str,
        raw: &[u8],
        now: i64,
        connectivity: Connectivity,
    ) -> Result<Peer, TableError> {
        let key = peer_key(id_from_key(key));
        let incoming: Peer = serde_json::from_slice(raw).map_err(|source| TableError::Malformed {
            key: key.clone(),
            source,
        })?;

        let mut entries = self.entries.lock().await;
        let peer = merge(entries.get(&key), incoming, now, connectivity);
        entries.insert(key, peer.clone());
        Ok(peer)
    }

    /// Store `peer` under `key` as-is.
    pub async fn insert(&self, key: &str, peer: Peer) {
        let key = peer_key(id_from_key(key));
        self.entries.lock().await.insert(key, peer);
    }

    /// Look up or create the entry for `key`, then apply `f` to it.
    pub async fn upsert_with<F>(&self, key: &str, f: F) -> Peer
    where
        F: FnOnce(&mut Peer) + Send,
    {
        let key = peer_key(id_from_key(key));
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key)
            .or_insert_with_key(|k| Peer::with_id(id_from_key(k)));
        f(entry);
        entry.clone()
    }

    /// Apply `f` to the entry for `key` if there is one.
    pub async fn modify<F>(&self, key: &str, f: F) -> Option<Peer>
    where
        F: FnOnce(&mut Peer) + Send,
    {
        let key = peer_key(id_from_key(key));
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&key)?;
        f(entry);
        Some(entry.clone())
    }

    /// Record a direct transport observation.
    ///
    /// Connecting refreshes `last_seen`; disconnecting leaves it as the last
    /// known good time.
    pub async fn mark_connected(&self, key: &str, connected: bool, now: i64) -> Peer {
        self.upsert_with(key, |peer| {
            peer.connected = connected;
            if connected {
                peer.last_seen = peer.last_seen.max(now);
            }
        })
        .await
    }

    /// Remove the entry for `key`.
    pub async fn delete(&self, key: &str) -> Option<Peer> {
        let key = peer_key(id_from_key(key));
        self.entries.lock().await.remove(&key)
    }

    pub async fn get(&self, key: &str) -> Option<Peer> {
        let key = peer_key(id_from_key(key));
        self.entries.lock().await.get(&key).cloned()
    }

    /// Copy of the full table.
    pub async fn snapshot(&self) -> BTreeMap<String, Peer> {
        self.entries.lock().await.clone()
    }

    /// Copy of the entries currently marked connected.
    pub async fn connected_snapshot(&self) -> BTreeMap<String, Peer> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|(_, peer)| peer.connected)
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Apply `f` to every entry under a single lock acquisition; entries for
    /// which it returns `false` are removed.
    pub(crate) async fn retain<F>(&self, f: F)
    where
        F: FnMut(&String, &mut Peer) -> bool + Send,
    {
        self.entries.lock().await.retain(f);
    }
}

fn merge(existing: Option<&Peer>, mut incoming: Peer, now: i64, connectivity: Connectivity) -> Peer {
    match existing {
        Some(old) if incoming.last_seen == 0 => incoming.last_seen = old.last_seen,
        Some(old) => incoming.last_seen = now.max(old.last_seen),
        None => incoming.last_seen = now,
    }
    if connectivity == Connectivity::Preserve {
        incoming.connected = existing.is_some_and(|old| old.connected);
    }
    incoming
}
