//! In-memory transport for unit tests.

use super::{
    Connectedness, DialFailure, KnownPeer, PeerInfo, Transport, TransportError, TransportEvent,
    TransportStats,
};
use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Default)]
struct State {
    connected: HashSet<PeerId>,
    address_book: HashMap<PeerId, Vec<Multiaddr>>,
    /// Peers (or bare addresses) a dial will succeed against.
    reachable: HashSet<PeerId>,
    reachable_addrs: HashSet<Multiaddr>,
    dials: Vec<PeerInfo>,
    published: Vec<(String, Vec<u8>)>,
    subscribed: Vec<String>,
    routing_bootstraps: usize,
    /// Simulated latency of every dial.
    dial_delay: Duration,
    shut_down: bool,
}

pub(crate) struct MockTransport {
    local: PeerId,
    state: Mutex<State>,
    events: broadcast::Sender<TransportEvent>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::with_peer_id(PeerId::random())
    }

    pub(crate) fn with_peer_id(local: PeerId) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            local,
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_connected(&self, peer: PeerId, connected: bool) {
        let mut state = self.state();
        if connected {
            state.connected.insert(peer);
            state.address_book.entry(peer).or_default();
        } else {
            state.connected.remove(&peer);
        }
    }

    pub(crate) fn add_known(&self, peer: PeerId, addrs: Vec<Multiaddr>) {
        self.state().address_book.insert(peer, addrs);
    }

    pub(crate) fn set_reachable(&self, peer: PeerId) {
        self.state().reachable.insert(peer);
    }

    pub(crate) fn set_reachable_addr(&self, addr: Multiaddr) {
        self.state().reachable_addrs.insert(addr);
    }

    pub(crate) fn set_dial_delay(&self, delay: Duration) {
        self.state().dial_delay = delay;
    }

    pub(crate) fn dials(&self) -> Vec<PeerInfo> {
        self.state().dials.clone()
    }

    pub(crate) fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state().published.clone()
    }

    pub(crate) fn subscribed(&self) -> Vec<String> {
        self.state().subscribed.clone()
    }

    pub(crate) fn routing_bootstraps(&self) -> usize {
        self.state().routing_bootstraps
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    async fn dial(&self, target: &PeerInfo, _timeout: Duration) -> Result<(), DialFailure> {
        let delay = self.state().dial_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.dials.push(target.clone());
        match target.peer {
            Some(peer) if peer == self.local => Err(DialFailure::SelfDial),
            Some(peer) if state.connected.contains(&peer) => Ok(()),
            Some(peer) if state.reachable.contains(&peer) => {
                state.connected.insert(peer);
                Ok(())
            }
            Some(peer) => {
                let known = state
                    .address_book
                    .get(&peer)
                    .is_some_and(|addrs| !addrs.is_empty());
                if known || !target.addrs.is_empty() {
                    Err(DialFailure::Timeout)
                } else {
                    Err(DialFailure::NoAddresses)
                }
            }
            None if target.addrs.iter().any(|a| state.reachable_addrs.contains(a)) => Ok(()),
            None if target.addrs.is_empty() => Err(DialFailure::NoAddresses),
            None => Err(DialFailure::Failed("connection refused".to_string())),
        }
    }

    async fn connectedness(&self, peer: PeerId) -> Connectedness {
        if self.state().connected.contains(&peer) {
            Connectedness::Connected
        } else {
            Connectedness::NotConnected
        }
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        self.state().connected.iter().copied().collect()
    }

    async fn connection_count(&self) -> usize {
        self.state().connected.len()
    }

    async fn known_peers(&self) -> Vec<KnownPeer> {
        let state = self.state();
        state
            .address_book
            .iter()
            .map(|(peer, addrs)| KnownPeer {
                peer: *peer,
                addrs: addrs.clone(),
                connectedness: if state.connected.contains(peer) {
                    Connectedness::Connected
                } else {
                    Connectedness::NotConnected
                },
            })
            .collect()
    }

    async fn listen_addrs(&self) -> Vec<Multiaddr> {
        vec!["/ip4/127.0.0.1/tcp/43905".parse().unwrap()]
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.shut_down {
            return Err(TransportError::Closed);
        }
        state.published.push((topic.to_string(), data));
        Ok(())
    }

    async fn subscribe_topic(&self, topic: &str) -> Result<(), TransportError> {
        self.state().subscribed.push(topic.to_string());
        Ok(())
    }

    async fn add_address(&self, peer: PeerId, addr: Multiaddr) {
        self.state().address_book.entry(peer).or_default().push(addr);
    }

    async fn forget_peer(&self, peer: PeerId) {
        let mut state = self.state();
        if !state.connected.contains(&peer) {
            state.address_book.remove(&peer);
        }
    }

    async fn bootstrap_routing(&self) -> Result<(), TransportError> {
        self.state().routing_bootstraps += 1;
        Ok(())
    }

    async fn stats(&self) -> TransportStats {
        let state = self.state();
        TransportStats {
            connected_peers: state.connected.len(),
            connections: state.connected.len(),
            known_peers: state.address_book.len(),
            pending_dials: 0,
            listen_addrs: 1,
        }
    }

    async fn shutdown(&self) {
        self.state().shut_down = true;
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
