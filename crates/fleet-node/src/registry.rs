//! Registry glue.
//!
//! Ties the replicated store, the local peer table and the transport
//! together:
//!
//! ```text
//!   CrdtStore ──on_put/on_delete──► TableObserver ──► PeerTable
//!   Transport ──Connected/Disconnected──► Registry::handle_event ──► PeerTable
//!                                               └──► announce (self record)
//! ```
//!
//! Remote records only ever reach the table through replication; this node
//! writes nothing into the store except its own record.

use crate::collaborators::HardwareInventory;
use crate::crdt::{CrdtStore, StoreError, StoreObserver};
use crate::peer::{Peer, Service, id_from_key, now_unix, peer_key};
use crate::services::{self, LocalServices, RoutingError};
use crate::table::PeerTable;
use crate::transport::{Transport, TransportEvent};
use async_trait::async_trait;
use libp2p::PeerId;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to encode peer record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Applies store mutations to the peer table.
pub struct TableObserver {
    table: Arc<PeerTable>,
    self_key: String,
}

impl TableObserver {
    pub fn new(table: Arc<PeerTable>, local_id: &str) -> Self {
        Self {
            table,
            self_key: peer_key(local_id),
        }
    }
}

#[async_trait]
impl StoreObserver for TableObserver {
    async fn on_put(&self, key: &str, value: &[u8]) {
        let result = if peer_key(id_from_key(key)) == self.self_key {
            self.table.update(key, value).await
        } else {
            self.table.update_replicated(key, value).await
        };
        if let Err(e) = result {
            warn!(key, error = %e, "dropping replicated update");
        }
    }

    async fn on_delete(&self, key: &str) {
        debug!(key, "peer record deleted");
        self.table.delete(key).await;
    }
}

/// Static facts about this node that go into its self record.
#[derive(Debug, Clone, Default)]
pub struct RegistrySettings {
    pub version: String,
    pub public_addr: Option<String>,
    pub tcp_port: u16,
}

pub struct Registry {
    store: Arc<CrdtStore>,
    table: Arc<PeerTable>,
    services: Arc<LocalServices>,
    transport: Arc<dyn Transport>,
    hardware: Arc<dyn HardwareInventory>,
    settings: RegistrySettings,
    local_id: String,
    self_key: String,
    /// Held across every read-stamp-publish of the self record.
    self_record: Mutex<()>,
}

impl Registry {
    pub fn new(
        store: Arc<CrdtStore>,
        table: Arc<PeerTable>,
        services: Arc<LocalServices>,
        transport: Arc<dyn Transport>,
        hardware: Arc<dyn HardwareInventory>,
        settings: RegistrySettings,
    ) -> Self {
        let local_id = transport.local_peer_id().to_string();
        Self {
            self_key: peer_key(&local_id),
            local_id,
            store,
            table,
            services,
            transport,
            hardware,
            settings,
            self_record: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    #[must_use]
    pub fn self_key(&self) -> &str {
        &self.self_key
    }

    #[must_use]
    pub fn table(&self) -> &Arc<PeerTable> {
        &self.table
    }

    #[must_use]
    pub fn services(&self) -> &Arc<LocalServices> {
        &self.services
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn published_self(&self) -> Peer {
        self.store
            .get(&self.self_key)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_else(|| Peer::with_id(self.local_id.clone()))
    }

    async fn stamp(&self, peer: &mut Peer) {
        peer.id = self.local_id.clone();
        peer.version = self.settings.version.clone();
        if let Some(addr) = &self.settings.public_addr {
            peer.public_address = addr.clone();
        }
        peer.hardware.gpus = self.hardware.gpus().await;
        peer.connected = true;
        peer.last_seen = now_unix();
    }

    async fn publish(&self, peer: &Peer) -> Result<(), RegistryError> {
        let raw = serde_json::to_vec(peer)?;
        self.store.put(&self.self_key, &raw).await?;
        Ok(())
    }

    /// Publish this node's record with fresh liveness, hardware and the
    /// current local services.
    pub async fn announce(&self) -> Result<Peer, RegistryError> {
        let _guard = self.self_record.lock().await;
        let mut peer = self.published_self();
        self.stamp(&mut peer).await;
        peer.service = merge_services(peer.service, self.services.snapshot().await);
        self.publish(&peer).await?;
        debug!(services = peer.service.len(), "announced self record");
        Ok(peer)
    }

    /// Register a local service and re-announce.
    pub async fn provide(&self, service: Service) -> Result<Peer, RegistryError> {
        info!(service = %service.name, host = %service.host, port = %service.port, "providing service");
        self.services.register(service).await;
        self.announce().await
    }

    /// Replace this node's record with `update`, keeping previously
    /// published services that `update` does not mention.
    pub async fn update_self(&self, update: Peer) -> Result<Peer, RegistryError> {
        let _guard = self.self_record.lock().await;
        let existing = self.published_self();
        let mut peer = update;
        peer.service = merge_services(existing.service, peer.service);
        self.stamp(&mut peer).await;
        self.publish(&peer).await?;
        Ok(peer)
    }

    /// Tombstone this node's record.
    pub async fn deregister(&self) -> Result<(), RegistryError> {
        let _guard = self.self_record.lock().await;
        self.store.delete(&self.self_key).await?;
        info!("deregistered self record");
        Ok(())
    }

    /// First service named `name` in this node's published record.
    pub async fn local_service(&self, name: &str) -> Result<Service, RoutingError> {
        let record = match self.table.get(&self.self_key).await {
            Some(peer) => peer,
            None => self.published_self(),
        };
        record
            .services_named(name)
            .next()
            .cloned()
            .ok_or_else(|| RoutingError::NotFound(name.to_string()))
    }

    /// Choose a connected provider of `name` for `payload`.
    pub async fn select_provider(&self, name: &str, payload: &[u8]) -> Result<String, RoutingError> {
        let connected = self.table.connected_snapshot().await;
        services::select_provider(&connected, name, payload)
    }

    /// A direct observation of `peer` (heartbeat, inbound message).
    pub async fn mark_seen(&self, peer: &PeerId) {
        if peer == &self.transport.local_peer_id() {
            return;
        }
        self.table
            .mark_connected(&peer.to_string(), true, now_unix())
            .await;
    }

    pub async fn mark_disconnected(&self, peer: &PeerId) {
        if peer == &self.transport.local_peer_id() {
            return;
        }
        self.table
            .mark_connected(&peer.to_string(), false, now_unix())
            .await;
    }

    pub async fn handle_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Connected(peer) if *peer != self.transport.local_peer_id() => {
                debug!(peer = %peer, "peer connected");
                self.mark_seen(peer).await;
                if let Err(e) = self.announce().await {
                    warn!(error = %e, "failed to re-announce after connect");
                }
            }
            TransportEvent::Disconnected(peer) => {
                debug!(peer = %peer, "peer disconnected");
                self.mark_disconnected(peer).await;
            }
            _ => {}
        }
    }

    /// Feed transport connection events into the table until cancelled.
    pub async fn run_events(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.transport.events();
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => self.handle_event(&event).await,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "connection event reader lagged; liveness sweep will repair");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Addresses other nodes can bootstrap from: every connected peer with a
    /// public address, this node, and this node's first listen address.
    pub async fn connected_bootstraps(&self) -> Vec<String> {
        let port = self.settings.tcp_port;
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for (key, peer) in self.table.snapshot().await {
            if peer.public_address.is_empty() || !(peer.connected || key == self.self_key) {
                continue;
            }
            let addr = format!(
                "/ip4/{}/tcp/{port}/p2p/{}",
                peer.public_address,
                id_from_key(&key)
            );
            if seen.insert(addr.clone()) {
                out.push(addr);
            }
        }
        if let Some(listen) = self.transport.listen_addrs().await.into_iter().next() {
            let addr = format!("{listen}/p2p/{}", self.local_id);
            if seen.insert(addr.clone()) {
                out.push(addr);
            }
        }
        out
    }
}

/// Union by name/host/port; entries in `preferred` replace older ones.
fn merge_services(existing: Vec<Service>, preferred: Vec<Service>) -> Vec<Service> {
    let mut merged: Vec<Service> = existing
        .into_iter()
        .filter(|old| !preferred.iter().any(|p| p.dedup_key() == old.dedup_key()))
        .collect();
    merged.extend(preferred);
    merged
}
