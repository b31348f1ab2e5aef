//! Fleetnet node core.
//!
//! A fleet of compute nodes agrees, without a central server, on who is
//! alive, reachable and offering which service:
//!
//! - **Replicated registry**: every node publishes its own [`peer::Peer`]
//!   record into a convergent key/value store replicated over gossip, with
//!   tombstone compaction.
//! - **Transport**: libp2p TCP/Noise/Yamux with gossipsub, Kademlia,
//!   identify and ping, bootstrapped from static lists, HTTP endpoints and
//!   DNS `dnsaddr` records.
//! - **Reconciliation**: periodic sweeps repair the gap between what the
//!   registry says and what is actually dialable.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               Node                                   │
//! │                                                                      │
//! │  ┌──────────┐   ┌────────────┐   ┌──────────┐   ┌─────────────────┐  │
//! │  │ HTTP API │──▶│  Registry  │──▶│ PeerTable│◀──│ Reconciler      │  │
//! │  └──────────┘   └─────┬──────┘   └────▲─────┘   │  verification   │  │
//! │                       │ put/delete    │ on_put  │  liveness       │  │
//! │                       ▼               │         │  resources      │  │
//! │                 ┌────────────┐  ┌─────┴──────┐  └───────┬─────────┘  │
//! │                 │ CrdtStore  │─▶│ Observer   │          │ dial       │
//! │                 └─────┬──────┘  └────────────┘          ▼            │
//! │            deltas     │  ▲ merge              ┌──────────────────┐   │
//! │                       ▼  │                    │ Transport        │   │
//! │                 ┌────────────┐   gossip       │ (libp2p swarm)   │   │
//! │                 │ Broadcast  │───────────────▶│                  │   │
//! │                 └────────────┘                └────────▲─────────┘   │
//! │                                                        │ redial      │
//! │  ┌───────────┐  ┌──────────────┐  ┌──────────────────┐ │             │
//! │  │ Compactor │  │  Heartbeat   │  │ AutoReconnector  │─┘             │
//! │  └───────────┘  └──────────────┘  └──────────────────┘               │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod bootstrap;
pub mod collaborators;
pub mod compactor;
pub mod config;
pub mod crdt;
pub mod heartbeat;
pub mod identity;
pub mod node;
pub mod peer;
pub mod reconcile;
pub mod reconnect;
pub mod registry;
pub mod services;
pub mod table;
pub mod transport;

pub use config::{Mode, NodeConfig};
pub use node::{Collaborators, FatalError, Node};
pub use peer::{Peer, Service};
