//! Gossip delivery of store deltas.

use super::{CrdtStore, Delta, StoreError};
use crate::transport::{MAX_MESSAGE_SIZE, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Encoded delta budget, leaving room for gossip framing and signatures.
pub const MAX_DELTA_BYTES: usize = MAX_MESSAGE_SIZE - 32 * 1024;

/// Publishes encoded deltas to other replicas.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Best effort; failures are logged, never returned.
    async fn broadcast(&self, data: Vec<u8>);
}

/// Broadcaster over a gossipsub topic.
pub struct GossipBroadcaster {
    transport: Arc<dyn Transport>,
    topic: String,
}

impl GossipBroadcaster {
    pub fn new(transport: Arc<dyn Transport>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl Broadcaster for GossipBroadcaster {
    async fn broadcast(&self, data: Vec<u8>) {
        match self.transport.publish(&self.topic, data).await {
            Ok(()) => {}
            Err(TransportError::NoSubscribers(_)) => {
                debug!(topic = %self.topic, "no peers to receive delta");
            }
            Err(e) => warn!(topic = %self.topic, error = %e, "failed to broadcast delta"),
        }
    }
}

/// Merge every delta received on `topic` until cancelled.
pub async fn run_receiver(
    store: Arc<CrdtStore>,
    transport: Arc<dyn Transport>,
    topic: String,
    cancel: CancellationToken,
) {
    let mut events = transport.events();
    if let Err(e) = transport.subscribe_topic(&topic).await {
        warn!(topic = %topic, error = %e, "failed to subscribe to store topic");
        return;
    }
    info!(topic = %topic, "replication receiver started");

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(TransportEvent::Message {
                topic: received,
                source,
                data,
            }) if received == topic => {
                let delta = match Delta::decode(&data) {
                    Ok(delta) => delta,
                    Err(e) => {
                        warn!(peer = ?source, error = %e, "dropping malformed delta");
                        continue;
                    }
                };
                if let Err(e) = store.merge(&delta).await {
                    warn!(peer = ?source, error = %e, "failed to merge delta");
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "replication receiver lagged; rebroadcast will catch up");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("replication receiver stopped");
}

/// Encode `delta` as one or more parts of at most `limit` bytes each.
///
/// Every part is a valid delta on its own, so replicas can merge them in any
/// order. An entry that exceeds `limit` by itself is dropped with a warning.
pub fn encode_chunks(delta: Delta, limit: usize) -> Result<Vec<Vec<u8>>, StoreError> {
    let encoded = delta.encode()?;
    if encoded.len() <= limit {
        return Ok(vec![encoded]);
    }
    if delta.elements.len() + delta.tombstones.len() <= 1 {
        warn!(size = encoded.len(), limit, "replicated entry exceeds message limit, dropped");
        return Ok(Vec::new());
    }
    let (left, right) = halve(delta);
    let mut chunks = encode_chunks(left, limit)?;
    chunks.extend(encode_chunks(right, limit)?);
    Ok(chunks)
}

fn halve(mut delta: Delta) -> (Delta, Delta) {
    let mid = (delta.elements.len() + delta.tombstones.len()) / 2;
    if mid <= delta.elements.len() {
        let elements = delta.elements.split_off(mid);
        let right = Delta {
            elements,
            tombstones: delta.tombstones,
        };
        let left = Delta {
            elements: delta.elements,
            tombstones: Vec::new(),
        };
        (left, right)
    } else {
        let tombstones = delta.tombstones.split_off(mid - delta.elements.len());
        (
            delta,
            Delta {
                elements: Vec::new(),
                tombstones,
            },
        )
    }
}

/// Periodically republish the full store state until cancelled.
pub async fn run_rebroadcast(
    store: Arc<CrdtStore>,
    broadcaster: Arc<dyn Broadcaster>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match store
            .state()
            .and_then(|state| encode_chunks(state, MAX_DELTA_BYTES))
        {
            Ok(chunks) => {
                if chunks.len() > 1 {
                    debug!(chunks = chunks.len(), "rebroadcasting state in parts");
                }
                for chunk in chunks {
                    broadcaster.broadcast(chunk).await;
                }
            }
            Err(e) => warn!(error = %e, "failed to snapshot store for rebroadcast"),
        }
    }
    debug!("rebroadcast stopped");
}
