//! Auto-reconnector.
//!
//! Watches for total connectivity loss and redials the bootstrap set with
//! exponential backoff and jitter.

use crate::bootstrap::{BootstrapResolver, peer_infos};
use crate::config::{Mode, ReconnectConfig};
use crate::transport::Transport;
use libp2p::Multiaddr;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Backoff before jitter: `min` for the first attempt, doubling per further
/// attempt, capped at `max`.
#[must_use]
pub fn backoff_base_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
    if attempt <= 1 {
        return min.min(max);
    }
    let factor = 1u32 << (attempt - 1).min(31);
    min.saturating_mul(factor).min(max)
}

/// [`backoff_base_delay`] plus jitter drawn uniformly from `[0, base / 3)`.
#[must_use]
pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
    let base = backoff_base_delay(attempt, min, max);
    let bound = u64::try_from((base / 3).as_nanos()).unwrap_or(u64::MAX);
    if bound == 0 {
        return base;
    }
    base + Duration::from_nanos(rand::thread_rng().gen_range(0..bound))
}

/// Outcome of dialing a bootstrap set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialSummary {
    pub attempted: usize,
    pub connected: usize,
}

/// Dial every target in `addrs`, skipping this node and peers that are
/// already connected.
pub async fn dial_bootstraps(
    transport: &dyn Transport,
    addrs: &[Multiaddr],
    timeout: Duration,
) -> DialSummary {
    let local = transport.local_peer_id();
    let connected: HashSet<_> = transport.connected_peers().await.into_iter().collect();
    let mut summary = DialSummary::default();

    for target in peer_infos(addrs) {
        if let Some(peer) = target.peer {
            if peer == local || connected.contains(&peer) {
                continue;
            }
        }
        summary.attempted += 1;
        match transport.dial(&target, timeout).await {
            Ok(()) => {
                info!(target = %target, "connected to bootstrap peer");
                summary.connected += 1;
            }
            Err(e) if e.is_transient() => debug!(target = %target, error = %e, "bootstrap dial timed out"),
            Err(e) => warn!(target = %target, error = %e, "bootstrap dial failed"),
        }
    }
    summary
}

/// Redials bootstrap peers whenever the node has no live connections.
pub struct AutoReconnector {
    transport: Arc<dyn Transport>,
    resolver: Arc<BootstrapResolver>,
    mode: Mode,
    explicit: Vec<String>,
    config: ReconnectConfig,
}

impl AutoReconnector {
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<BootstrapResolver>,
        mode: Mode,
        explicit: Vec<String>,
        config: ReconnectConfig,
    ) -> Self {
        Self {
            transport,
            resolver,
            mode,
            explicit,
            config,
        }
    }

    /// One reconnection attempt; `true` if at least one dial succeeded.
    pub async fn attempt(&self) -> bool {
        let addrs = self.resolver.resolve(self.mode, &self.explicit).await;
        if addrs.is_empty() {
            debug!("no bootstrap addresses to redial");
            return false;
        }
        let summary = dial_bootstraps(self.transport.as_ref(), &addrs, self.config.dial_timeout).await;
        summary.connected > 0
    }

    pub async fn run(self, cancel: CancellationToken) {
        let ReconnectConfig {
            health_check_interval,
            min_backoff,
            max_backoff,
            ..
        } = self.config;
        let mut ticker = tokio::time::interval(health_check_interval);
        ticker.tick().await;

        'watch: loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.transport.connection_count().await > 0 {
                continue;
            }
            warn!("no live connections, redialing bootstrap peers");

            let mut attempt: u32 = 0;
            loop {
                if self.attempt().await {
                    info!(attempts = attempt + 1, "reconnected to the overlay");
                    if let Err(e) = self.transport.bootstrap_routing().await {
                        debug!(error = %e, "routing bootstrap after reconnect failed");
                    }
                    ticker.reset();
                    continue 'watch;
                }
                attempt += 1;
                if attempt > 1 {
                    let delay = backoff_delay(attempt - 1, min_backoff, max_backoff);
                    debug!(attempt, ?delay, "reconnect failed, backing off");
                    tokio::select! {
                        () = cancel.cancelled() => break 'watch,
                        () = tokio::time::sleep(delay) => {}
                    }
                } else if cancel.is_cancelled() {
                    break 'watch;
                }
                if self.transport.connection_count().await > 0 {
                    continue 'watch;
                }
            }
        }
        debug!("auto-reconnector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootstrapConfig;
    use crate::transport::mock::MockTransport;
    use libp2p::PeerId;

    const MIN: Duration = Duration::from_secs(5);
    const MAX: Duration = Duration::from_secs(120);

    #[test]
    fn test_backoff_base_doubles_and_caps() {
        assert_eq!(backoff_base_delay(0, MIN, MAX), MIN);
        assert_eq!(backoff_base_delay(1, MIN, MAX), MIN);
        assert_eq!(backoff_base_delay(2, MIN, MAX), MIN * 2);
        assert_eq!(backoff_base_delay(3, MIN, MAX), MIN * 4);
        assert_eq!(backoff_base_delay(5, MIN, MAX), Duration::from_secs(80));
        assert_eq!(backoff_base_delay(6, MIN, MAX), MAX);
        assert_eq!(backoff_base_delay(64, MIN, MAX), MAX);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        for attempt in 1..=10 {
            let base = backoff_base_delay(attempt, MIN, MAX);
            for _ in 0..100 {
                let delay = backoff_delay(attempt, MIN, MAX);
                assert!(delay >= base);
                assert!(delay < base + base / 3);
            }
        }
        assert_eq!(backoff_delay(3, Duration::ZERO, MAX), Duration::ZERO);
    }

    fn resolver_for(addrs: Vec<String>) -> Arc<BootstrapResolver> {
        Arc::new(
            BootstrapResolver::new(BootstrapConfig {
                static_addrs: addrs,
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_dial_skips_self_and_connected() {
        let local = PeerId::random();
        let transport = MockTransport::with_peer_id(local);
        let connected = PeerId::random();
        let reachable = PeerId::random();
        transport.set_connected(connected, true);
        transport.set_reachable(reachable);

        let addrs: Vec<Multiaddr> = [local, connected, reachable]
            .iter()
            .map(|p| format!("/ip4/10.0.0.1/tcp/4001/p2p/{p}").parse().unwrap())
            .collect();
        let summary = dial_bootstraps(&transport, &addrs, Duration::from_secs(1)).await;
        assert_eq!(
            summary,
            DialSummary {
                attempted: 1,
                connected: 1
            }
        );
        assert_eq!(transport.dials().len(), 1);
        assert_eq!(transport.dials()[0].peer, Some(reachable));
    }

    #[tokio::test]
    async fn test_attempt_reports_failure() {
        let transport = Arc::new(MockTransport::new());
        let unreachable = PeerId::random();
        let reconnector = AutoReconnector::new(
            transport.clone(),
            resolver_for(vec![format!("/ip4/10.0.0.2/tcp/4001/p2p/{unreachable}")]),
            Mode::Node,
            Vec::new(),
            ReconnectConfig::default(),
        );
        assert!(!reconnector.attempt().await);
        assert_eq!(transport.dials().len(), 1);

        let standalone = AutoReconnector::new(
            transport.clone(),
            resolver_for(vec![format!("/ip4/10.0.0.2/tcp/4001/p2p/{unreachable}")]),
            Mode::Standalone,
            Vec::new(),
            ReconnectConfig::default(),
        );
        assert!(!standalone.attempt().await);
        assert_eq!(transport.dials().len(), 1);
    }

    #[tokio::test]
    async fn test_run_reconnects_when_isolated() {
        let transport = Arc::new(MockTransport::new());
        let bootstrap = PeerId::random();
        transport.set_reachable(bootstrap);
        let reconnector = AutoReconnector::new(
            transport.clone(),
            resolver_for(vec![format!("/ip4/10.0.0.3/tcp/4001/p2p/{bootstrap}")]),
            Mode::Node,
            Vec::new(),
            ReconnectConfig {
                health_check_interval: Duration::from_millis(10),
                min_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                dial_timeout: Duration::from_millis(50),
            },
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(reconnector.run(cancel.clone()));

        for _ in 0..200 {
            if transport.routing_bootstraps() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(transport.connection_count().await, 1);
        assert_eq!(transport.routing_bootstraps(), 1);
        assert_eq!(transport.dials().len(), 1);
    }
}
