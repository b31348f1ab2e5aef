//! Gossip heartbeat.
//!
//! Every node pings a shared topic; receiving any message there counts as a
//! direct observation of its sender.

use crate::registry::Registry;
use crate::transport::{TransportError, TransportEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const PING: &[u8] = b"ping";

/// Heartbeat topic for a store namespace.
#[must_use]
pub fn topic(namespace: &str) -> String {
    format!("{}-net", namespace.trim_matches('/'))
}

/// Publish [`PING`] on `topic` every `interval` until cancelled.
pub async fn run_publisher(
    registry: Arc<Registry>,
    topic: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let transport = registry.transport().clone();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match transport.publish(&topic, PING.to_vec()).await {
            Ok(()) => {}
            Err(TransportError::NoSubscribers(_)) => debug!(topic = %topic, "no peers to ping"),
            Err(e) => warn!(topic = %topic, error = %e, "failed to publish heartbeat"),
        }
    }
    debug!("heartbeat publisher stopped");
}

/// Mark the sender of every message on `topic` as seen until cancelled.
pub async fn run_reader(registry: Arc<Registry>, topic: String, cancel: CancellationToken) {
    let transport = registry.transport().clone();
    let mut events = transport.events();
    if let Err(e) = transport.subscribe_topic(&topic).await {
        warn!(topic = %topic, error = %e, "failed to subscribe to heartbeat topic");
        return;
    }
    info!(topic = %topic, "heartbeat reader started");

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(TransportEvent::Message {
                topic: received,
                source: Some(peer),
                ..
            }) if received == topic => registry.mark_seen(&peer).await,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "heartbeat reader lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    debug!("heartbeat reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::test_registry;
    use bytes::Bytes;
    use libp2p::PeerId;

    #[test]
    fn test_topic_name() {
        assert_eq!(topic("/fleetnet-crdt"), "fleetnet-crdt-net");
        assert_eq!(topic("fleetnet-crdt"), "fleetnet-crdt-net");
    }

    #[tokio::test]
    async fn test_publisher_pings() {
        let (registry, transport) = test_registry();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_publisher(
            registry,
            "fleetnet-crdt-net".to_string(),
            Duration::from_millis(10),
            cancel.clone(),
        ));
        for _ in 0..200 {
            if transport.published().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        let published = transport.published();
        assert!(published.len() >= 2);
        assert!(published.iter().all(|(t, d)| t == "fleetnet-crdt-net" && d == PING));
    }

    #[tokio::test]
    async fn test_reader_marks_sender_connected() {
        let (registry, transport) = test_registry();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_reader(
            registry.clone(),
            "fleetnet-crdt-net".to_string(),
            cancel.clone(),
        ));
        for _ in 0..100 {
            if !transport.subscribed().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let sender = PeerId::random();
        transport.emit(TransportEvent::Message {
            topic: "fleetnet-crdt-net".to_string(),
            source: Some(sender),
            data: Bytes::from_static(PING),
        });

        let mut entry = None;
        for _ in 0..100 {
            entry = registry.table().get(&sender.to_string()).await;
            if entry.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let entry = entry.unwrap();
        assert!(entry.connected);
        assert!(entry.last_seen > 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
