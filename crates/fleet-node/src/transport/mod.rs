//! Transport abstraction.
//!
//! Everything above this layer talks to the network through the
//! [`Transport`] trait. The production implementation is the libp2p swarm
//! actor in [`swarm`]; tests use an in-memory mock.
//!
//! ```text
//!   registry / reconcile / reconnect / heartbeat
//!                      │
//!                      ▼
//!              ┌───────────────┐   commands (mpsc + oneshot)
//!              │  dyn Transport │ ─────────────────────────────┐
//!              └───────────────┘                               ▼
//!                      ▲                              ┌─────────────────┐
//!                      │  TransportEvent (broadcast)  │   swarm actor   │
//!                      └───────────────────────────── │ tcp/noise/yamux │
//!                                                     │ gossipsub · kad │
//!                                                     └─────────────────┘
//! ```

pub mod swarm;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use libp2p::{Multiaddr, PeerId};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

pub use swarm::{SwarmConfig, SwarmTransport};

/// Transport-level view of a peer's reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectedness {
    Connected,
    NotConnected,
    /// A dial is in flight.
    Connecting,
}

/// Events pushed to subscribers of [`Transport::events`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// First connection to a peer was established.
    Connected(PeerId),
    /// Last connection to a peer was closed.
    Disconnected(PeerId),
    /// A gossip message arrived on a subscribed topic.
    Message {
        topic: String,
        source: Option<PeerId>,
        data: Bytes,
    },
}

/// A dial target: a peer ID (when known) and candidate addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer: Option<PeerId>,
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    #[must_use]
    pub fn new(peer: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self {
            peer: Some(peer),
            addrs,
        }
    }
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.peer, self.addrs.first()) {
            (Some(peer), _) => write!(f, "{peer}"),
            (None, Some(addr)) => write!(f, "{addr}"),
            (None, None) => write!(f, "<empty>"),
        }
    }
}

/// A peer present in the transport's address book.
#[derive(Debug, Clone)]
pub struct KnownPeer {
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
    pub connectedness: Connectedness,
}

/// Point-in-time transport resource figures, logged by the resource sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub connected_peers: usize,
    pub connections: usize,
    pub known_peers: usize,
    pub pending_dials: usize,
    pub listen_addrs: usize,
}

/// Largest gossip message the transport accepts, framing included.
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

/// Why a dial did not produce a connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DialFailure {
    #[error("dial timed out")]
    Timeout,
    #[error("dial cancelled")]
    Cancelled,
    #[error("no known addresses")]
    NoAddresses,
    #[error("dialing self")]
    SelfDial,
    #[error("dial failed: {0}")]
    Failed(String),
    #[error("transport task not running")]
    Closed,
}

impl DialFailure {
    /// Timeouts and cancellations are expected churn rather than hard faults.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Cancelled)
    }
}

/// Errors from non-dial transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to build transport: {0}")]
    Build(String),
    #[error("failed to listen on {addr}: {reason}")]
    Listen { addr: Multiaddr, reason: String },
    #[error("no peers subscribed to topic {0}")]
    NoSubscribers(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("routing bootstrap failed: {0}")]
    Routing(String),
    #[error("transport task not running")]
    Closed,
}

/// Network operations the rest of the node depends on.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Dial `target`, waiting at most `timeout` for a connection.
    async fn dial(&self, target: &PeerInfo, timeout: Duration) -> Result<(), DialFailure>;

    async fn connectedness(&self, peer: PeerId) -> Connectedness;

    async fn connected_peers(&self) -> Vec<PeerId>;

    /// Number of live connections (a peer may hold several).
    async fn connection_count(&self) -> usize;

    /// Every peer in the address book, with its current connectedness.
    async fn known_peers(&self) -> Vec<KnownPeer>;

    async fn listen_addrs(&self) -> Vec<Multiaddr>;

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe_topic(&self, topic: &str) -> Result<(), TransportError>;

    async fn add_address(&self, peer: PeerId, addr: Multiaddr);

    /// Drop a disconnected `peer` from the address book and routing table.
    async fn forget_peer(&self, peer: PeerId);

    /// Refresh the routing table (Kademlia bootstrap).
    async fn bootstrap_routing(&self) -> Result<(), TransportError>;

    async fn stats(&self) -> TransportStats;

    async fn shutdown(&self);

    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
