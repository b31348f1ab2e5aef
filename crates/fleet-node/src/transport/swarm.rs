//! libp2p swarm actor.
//!
//! The [`Swarm`] is owned by a single task. [`SwarmTransport`] is a cheap
//! handle that sends commands over an mpsc channel and awaits `oneshot`
//! replies; connection and gossip events fan out over a broadcast channel.
//!
//! Dials are tracked by [`ConnectionId`] so that a `dial()` call resolves
//! when that specific connection attempt is established or fails.

use super::{
    Connectedness, DialFailure, KnownPeer, PeerInfo, Transport, TransportError, TransportEvent,
    TransportStats,
};
use crate::identity::NodeIdentity;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic};
use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, DialError, NetworkBehaviour, SwarmEvent};
use libp2p::{Multiaddr, PeerId, Swarm, identify, noise, ping, tcp, yamux};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "/fleetnet/1.0.0";
const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 1024;
const MAX_GOSSIP_MESSAGE: usize = super::MAX_MESSAGE_SIZE;

/// Listener and connection settings.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub tcp_port: u16,
    pub idle_connection_timeout: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            tcp_port: 0,
            idle_connection_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(NetworkBehaviour)]
struct FleetBehaviour {
    gossipsub: gossipsub::Behaviour,
    kademlia: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

impl FleetBehaviour {
    fn new(key: &Keypair) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let peer_id = key.public().to_peer_id();

        let gossip_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(Duration::from_secs(1))
            .validation_mode(gossipsub::ValidationMode::Strict)
            .max_transmit_size(MAX_GOSSIP_MESSAGE)
            .build()
            .map_err(|e| e.to_string())?;
        let gossipsub =
            gossipsub::Behaviour::new(gossipsub::MessageAuthenticity::Signed(key.clone()), gossip_config)?;

        let kademlia = kad::Behaviour::new(peer_id, MemoryStore::new(peer_id));
        let identify = identify::Behaviour::new(identify::Config::new(
            PROTOCOL_VERSION.to_string(),
            key.public(),
        ));
        let ping = ping::Behaviour::new(ping::Config::new());

        Ok(Self {
            gossipsub,
            kademlia,
            identify,
            ping,
        })
    }
}

enum Command {
    Dial {
        target: PeerInfo,
        reply: oneshot::Sender<Result<(), DialFailure>>,
    },
    Connectedness {
        peer: PeerId,
        reply: oneshot::Sender<Connectedness>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    ConnectionCount {
        reply: oneshot::Sender<usize>,
    },
    KnownPeers {
        reply: oneshot::Sender<Vec<KnownPeer>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    AddAddress {
        peer: PeerId,
        addr: Multiaddr,
    },
    Forget {
        peer: PeerId,
    },
    Bootstrap {
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Stats {
        reply: oneshot::Sender<TransportStats>,
    },
    Shutdown,
}

/// Handle to the running swarm actor.
pub struct SwarmTransport {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<TransportEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SwarmTransport {
    /// Build the swarm, start listening and spawn the actor task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(identity: &NodeIdentity, config: &SwarmConfig) -> Result<Self, TransportError> {
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(identity.keypair().clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| TransportError::Build(e.to_string()))?
            .with_behaviour(FleetBehaviour::new)
            .map_err(|e| TransportError::Build(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_connection_timeout))
            .build();

        swarm
            .behaviour_mut()
            .kademlia
            .set_mode(Some(kad::Mode::Server));

        let listen = Multiaddr::empty()
            .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
            .with(Protocol::Tcp(config.tcp_port));
        swarm
            .listen_on(listen.clone())
            .map_err(|e| TransportError::Listen {
                addr: listen,
                reason: e.to_string(),
            })?;

        let local_peer_id = *swarm.local_peer_id();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

        let actor = SwarmActor {
            swarm,
            commands: command_rx,
            events: event_tx.clone(),
            pending_dials: HashMap::new(),
            address_book: HashMap::new(),
        };
        let task = tokio::spawn(actor.run());

        info!(peer_id = %local_peer_id, tcp_port = config.tcp_port, "transport started");

        Ok(Self {
            local_peer_id,
            commands: command_tx,
            events: event_tx,
            task: Mutex::new(Some(task)),
        })
    }

    async fn request<T: Send>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command + Send,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.ok()?;
        rx.await.ok()
    }
}

#[async_trait]
impl Transport for SwarmTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn dial(&self, target: &PeerInfo, timeout: Duration) -> Result<(), DialFailure> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Dial {
                target: target.clone(),
                reply: tx,
            })
            .await
            .map_err(|_| DialFailure::Closed)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DialFailure::Cancelled),
            Err(_) => Err(DialFailure::Timeout),
        }
    }

    async fn connectedness(&self, peer: PeerId) -> Connectedness {
        self.request(|reply| Command::Connectedness { peer, reply })
            .await
            .unwrap_or(Connectedness::NotConnected)
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        self.request(|reply| Command::ConnectedPeers { reply })
            .await
            .unwrap_or_default()
    }

    async fn connection_count(&self) -> usize {
        self.request(|reply| Command::ConnectionCount { reply })
            .await
            .unwrap_or_default()
    }

    async fn known_peers(&self) -> Vec<KnownPeer> {
        self.request(|reply| Command::KnownPeers { reply })
            .await
            .unwrap_or_default()
    }

    async fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.request(|reply| Command::ListenAddrs { reply })
            .await
            .unwrap_or_default()
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Publish { topic, data, reply })
            .await
            .unwrap_or(Err(TransportError::Closed))
    }

    async fn subscribe_topic(&self, topic: &str) -> Result<(), TransportError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Subscribe { topic, reply })
            .await
            .unwrap_or(Err(TransportError::Closed))
    }

    async fn add_address(&self, peer: PeerId, addr: Multiaddr) {
        if self
            .commands
            .send(Command::AddAddress { peer, addr })
            .await
            .is_err()
        {
            debug!("transport task gone, address dropped");
        }
    }

    async fn forget_peer(&self, peer: PeerId) {
        if self.commands.send(Command::Forget { peer }).await.is_err() {
            debug!("transport task gone, forget dropped");
        }
    }

    async fn bootstrap_routing(&self) -> Result<(), TransportError> {
        self.request(|reply| Command::Bootstrap { reply })
            .await
            .unwrap_or(Err(TransportError::Closed))
    }

    async fn stats(&self) -> TransportStats {
        self.request(|reply| Command::Stats { reply })
            .await
            .unwrap_or_default()
    }

    async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "transport task ended abnormally");
            }
        }
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

struct PendingDial {
    peer: Option<PeerId>,
    reply: oneshot::Sender<Result<(), DialFailure>>,
}

struct SwarmActor {
    swarm: Swarm<FleetBehaviour>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<TransportEvent>,
    pending_dials: HashMap<ConnectionId, PendingDial>,
    address_book: HashMap<PeerId, Vec<Multiaddr>>,
}

impl SwarmActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }
        info!("transport stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { target, reply } => self.start_dial(target, reply),
            Command::Connectedness { peer, reply } => {
                let _ = reply.send(self.connectedness(&peer));
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }
            Command::ConnectionCount { reply } => {
                let count = self.swarm.network_info().connection_counters().num_established();
                let _ = reply.send(count as usize);
            }
            Command::KnownPeers { reply } => {
                let _ = reply.send(self.known_peers());
            }
            Command::ListenAddrs { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
            Command::Publish { topic, data, reply } => {
                let result = match self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(IdentTopic::new(topic.clone()), data)
                {
                    Ok(_) | Err(gossipsub::PublishError::Duplicate) => Ok(()),
                    Err(gossipsub::PublishError::InsufficientPeers) => {
                        Err(TransportError::NoSubscribers(topic))
                    }
                    Err(e) => Err(TransportError::Publish(e.to_string())),
                };
                let _ = reply.send(result);
            }
            Command::Subscribe { topic, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&IdentTopic::new(topic))
                    .map(|_| ())
                    .map_err(|e| TransportError::Subscribe(e.to_string()));
                let _ = reply.send(result);
            }
            Command::AddAddress { peer, addr } => {
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer, addr.clone());
                self.remember(peer, addr);
            }
            Command::Forget { peer } => {
                if !self.swarm.is_connected(&peer) {
                    self.address_book.remove(&peer);
                    self.swarm.behaviour_mut().kademlia.remove_peer(&peer);
                }
            }
            Command::Bootstrap { reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .bootstrap()
                    .map(|_| ())
                    .map_err(|e| TransportError::Routing(e.to_string()));
                let _ = reply.send(result);
            }
            Command::Stats { reply } => {
                let stats = TransportStats {
                    connected_peers: self.swarm.connected_peers().count(),
                    connections: self
                        .swarm
                        .network_info()
                        .connection_counters()
                        .num_established() as usize,
                    known_peers: self.address_book.len(),
                    pending_dials: self.pending_dials.len(),
                    listen_addrs: self.swarm.listeners().count(),
                };
                let _ = reply.send(stats);
            }
            Command::Shutdown => {}
        }
    }

    fn start_dial(&mut self, target: PeerInfo, reply: oneshot::Sender<Result<(), DialFailure>>) {
        // Callers that timed out no longer hold a receiver.
        self.pending_dials.retain(|_, pending| !pending.reply.is_closed());

        let local = *self.swarm.local_peer_id();
        let opts = match target.peer {
            Some(peer) if peer == local => {
                let _ = reply.send(Err(DialFailure::SelfDial));
                return;
            }
            Some(peer) if self.swarm.is_connected(&peer) => {
                let _ = reply.send(Ok(()));
                return;
            }
            Some(peer) => {
                for addr in &target.addrs {
                    self.remember(peer, addr.clone());
                }
                let addrs = self.address_book.get(&peer).cloned().unwrap_or_default();
                DialOpts::peer_id(peer)
                    .addresses(addrs)
                    .condition(PeerCondition::Disconnected)
                    .build()
            }
            None => match target.addrs.first() {
                Some(addr) => DialOpts::unknown_peer_id().address(addr.clone()).build(),
                None => {
                    let _ = reply.send(Err(DialFailure::NoAddresses));
                    return;
                }
            },
        };

        let connection_id = opts.connection_id();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.insert(
                    connection_id,
                    PendingDial {
                        peer: target.peer,
                        reply,
                    },
                );
            }
            Err(DialError::NoAddresses) => {
                let _ = reply.send(Err(DialFailure::NoAddresses));
            }
            Err(e) => {
                let _ = reply.send(Err(DialFailure::Failed(e.to_string())));
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<FleetBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "listening");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                if endpoint.is_dialer() {
                    self.remember(peer_id, endpoint.get_remote_address().clone());
                }
                if let Some(pending) = self.pending_dials.remove(&connection_id) {
                    let _ = pending.reply.send(Ok(()));
                }
                if num_established.get() == 1 {
                    debug!(peer = %peer_id, "peer connected");
                    let _ = self.events.send(TransportEvent::Connected(peer_id));
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    debug!(peer = %peer_id, "peer disconnected");
                    let _ = self.events.send(TransportEvent::Disconnected(peer_id));
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                let failure = match error {
                    DialError::NoAddresses => DialFailure::NoAddresses,
                    DialError::Aborted => DialFailure::Cancelled,
                    other => DialFailure::Failed(other.to_string()),
                };
                debug!(peer = ?peer_id, error = %failure, "outgoing connection failed");
                if let Some(pending) = self.pending_dials.remove(&connection_id) {
                    let _ = pending.reply.send(Err(failure));
                }
            }
            SwarmEvent::Behaviour(FleetBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let _ = self.events.send(TransportEvent::Message {
                    topic: message.topic.into_string(),
                    source: Some(message.source.unwrap_or(propagation_source)),
                    data: Bytes::from(message.data),
                });
            }
            SwarmEvent::Behaviour(FleetBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    self.remember(peer_id, addr);
                }
            }
            SwarmEvent::Behaviour(FleetBehaviourEvent::Kademlia(kad::Event::RoutingUpdated {
                peer,
                addresses,
                ..
            })) => {
                for addr in addresses.iter() {
                    self.remember(peer, addr.clone());
                }
            }
            _ => {}
        }
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        if self.swarm.is_connected(peer) {
            Connectedness::Connected
        } else if self
            .pending_dials
            .values()
            .any(|pending| pending.peer.as_ref() == Some(peer) && !pending.reply.is_closed())
        {
            Connectedness::Connecting
        } else {
            Connectedness::NotConnected
        }
    }

    fn known_peers(&self) -> Vec<KnownPeer> {
        let local = *self.swarm.local_peer_id();
        let mut peers: HashSet<PeerId> = self.address_book.keys().copied().collect();
        peers.extend(self.swarm.connected_peers().copied());
        peers
            .into_iter()
            .filter(|peer| *peer != local)
            .map(|peer| KnownPeer {
                peer,
                addrs: self.address_book.get(&peer).cloned().unwrap_or_default(),
                connectedness: self.connectedness(&peer),
            })
            .collect()
    }

    fn remember(&mut self, peer: PeerId, addr: Multiaddr) {
        if peer == *self.swarm.local_peer_id() {
            return;
        }
        let addrs = self.address_book.entry(peer).or_default();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::keypair_from_seed;

    fn spawn_node(seed: u64) -> SwarmTransport {
        let identity = NodeIdentity::from_keypair(keypair_from_seed(seed).unwrap());
        SwarmTransport::spawn(&identity, &SwarmConfig::default()).unwrap()
    }

    async fn loopback_addr(transport: &SwarmTransport) -> Multiaddr {
        for _ in 0..50 {
            let addrs = transport.listen_addrs().await;
            if let Some(addr) = addrs.into_iter().find(|a| {
                a.iter()
                    .any(|p| matches!(p, Protocol::Ip4(ip) if ip.is_loopback()))
            }) {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no loopback listen address");
    }

    #[tokio::test]
    async fn test_dial_self_rejected() {
        let node = spawn_node(1);
        let target = PeerInfo::new(node.local_peer_id(), vec![]);
        let result = node.dial(&target, Duration::from_secs(1)).await;
        assert_eq!(result, Err(DialFailure::SelfDial));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_dial_unknown_peer_without_addresses() {
        let node = spawn_node(2);
        let target = PeerInfo::new(PeerId::random(), vec![]);
        let result = node.dial(&target, Duration::from_secs(1)).await;
        assert_eq!(result, Err(DialFailure::NoAddresses));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_nodes_connect_and_emit_events() {
        let a = spawn_node(3);
        let b = spawn_node(4);
        let mut events = a.events();
        let addr = loopback_addr(&b).await;

        a.dial(&PeerInfo::new(b.local_peer_id(), vec![addr]), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(a.connectedness(b.local_peer_id()).await, Connectedness::Connected);
        assert!(a.connection_count().await >= 1);
        assert!(
            a.known_peers()
                .await
                .iter()
                .any(|p| p.peer == b.local_peer_id())
        );

        let connected = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(TransportEvent::Connected(peer)) = events.recv().await {
                    return peer;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(connected, b.local_peer_id());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_forget_drops_address_book_entry() {
        let node = spawn_node(6);
        let departed = PeerId::random();
        node.add_address(departed, "/ip4/10.9.9.9/tcp/4001".parse().unwrap())
            .await;
        assert!(node.known_peers().await.iter().any(|p| p.peer == departed));

        node.forget_peer(departed).await;
        assert!(!node.known_peers().await.iter().any(|p| p.peer == departed));
        assert_eq!(node.stats().await.known_peers, 0);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_degrade() {
        let node = spawn_node(5);
        node.shutdown().await;
        assert!(node.connected_peers().await.is_empty());
        assert!(matches!(
            node.publish("t", b"x".to_vec()).await,
            Err(TransportError::Closed)
        ));
        let target = PeerInfo::new(PeerId::random(), vec![]);
        assert_eq!(
            node.dial(&target, Duration::from_secs(1)).await,
            Err(DialFailure::Closed)
        );
    }
}
