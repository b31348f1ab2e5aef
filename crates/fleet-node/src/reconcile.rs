//! Reconciliation loop.
//!
//! Three independently scheduled tasks keep the peer table honest:
//!
//! - **verification**: with a fixed probability per tick, redial the
//!   bootstrap set so the fleet does not hit bootstrap peers in lockstep;
//! - **liveness**: reconcile table entries against transport connectedness,
//!   dialing peers that dropped, then run the critical health check;
//! - **resources**: log usage, re-bootstrap below the peer floor and prune
//!   stale entries.

use crate::bootstrap::BootstrapResolver;
use crate::collaborators::HealthCheck;
use crate::config::{Mode, ReconcileConfig};
use crate::node::{FatalError, report_fatal};
use crate::peer::{id_from_key, now_unix};
use crate::reconnect::dial_bootstraps;
use crate::registry::Registry;
use crate::transport::{Connectedness, KnownPeer, PeerInfo};
use futures::StreamExt;
use libp2p::PeerId;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Peers redialed at once by a liveness sweep.
const LIVENESS_DIAL_CONCURRENCY: usize = 16;

/// What a staleness sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub demoted: usize,
    pub backfilled: usize,
}

pub struct Reconciler {
    registry: Arc<Registry>,
    resolver: Arc<BootstrapResolver>,
    health: Arc<dyn HealthCheck>,
    config: ReconcileConfig,
    mode: Mode,
    explicit: Vec<String>,
    fatal: mpsc::Sender<FatalError>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<Registry>,
        resolver: Arc<BootstrapResolver>,
        health: Arc<dyn HealthCheck>,
        config: ReconcileConfig,
        mode: Mode,
        explicit: Vec<String>,
        fatal: mpsc::Sender<FatalError>,
    ) -> Self {
        Self {
            registry,
            resolver,
            health,
            config,
            mode,
            explicit,
            fatal,
        }
    }

    /// Spawn the three tasks.
    pub fn spawn(self: Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().run_verification(cancel.child_token())),
            tokio::spawn(self.clone().run_liveness(cancel.child_token())),
            tokio::spawn(self.run_resources(cancel.child_token())),
        ]
    }

    /// Redial the bootstrap set, then refresh routing.
    pub async fn reconnect(&self) -> usize {
        let transport = self.registry.transport();
        let addrs = self.resolver.resolve(self.mode, &self.explicit).await;
        let summary = dial_bootstraps(transport.as_ref(), &addrs, self.config.dial_timeout).await;
        if let Err(e) = transport.bootstrap_routing().await {
            debug!(error = %e, "routing bootstrap skipped");
        }
        summary.connected
    }

    /// One verification tick; `true` if it triggered a reconnection.
    pub async fn verify_once(&self) -> bool {
        let probability = self.config.verification_probability.clamp(0.0, 1.0);
        let roll = rand::thread_rng().gen_bool(probability);
        if roll {
            debug!("verification triggered bootstrap reconnection");
            self.reconnect().await;
        }
        roll
    }

    /// Reconcile every table entry the transport knows about.
    ///
    /// Returns `false` if the critical health check failed.
    pub async fn liveness_once(&self) -> bool {
        let transport = self.registry.transport();
        let table = self.registry.table();
        let local = transport.local_peer_id();

        let mut tracked = Vec::new();
        for known in transport.known_peers().await {
            if known.peer != local && table.get(&known.peer.to_string()).await.is_some() {
                tracked.push(known);
            }
        }

        let mut outcomes = futures::stream::iter(tracked)
            .map(|known| self.check_peer(known))
            .buffer_unordered(LIVENESS_DIAL_CONCURRENCY);
        while let Some((key, connected)) = outcomes.next().await {
            let now = now_unix();
            table
                .modify(&key, |peer| {
                    peer.connected = connected;
                    peer.last_seen = peer.last_seen.max(now);
                })
                .await;
        }

        self.health.healthy().await
    }

    /// Current reachability of one tracked peer, redialing if it dropped.
    async fn check_peer(&self, known: KnownPeer) -> (String, bool) {
        let key = known.peer.to_string();
        if known.connectedness == Connectedness::Connected {
            return (key, true);
        }
        if known.addrs.is_empty() {
            debug!(peer = %key, "no known addresses, marking disconnected");
            return (key, false);
        }
        let target = PeerInfo::new(known.peer, known.addrs);
        let connected = match self
            .registry
            .transport()
            .dial(&target, self.config.dial_timeout)
            .await
        {
            Ok(()) => {
                info!(peer = %key, "reconnected to peer");
                true
            }
            Err(e) if e.is_transient() => {
                debug!(peer = %key, error = %e, "dial timed out, marking disconnected");
                false
            }
            Err(e) => {
                warn!(peer = %key, error = %e, "dial failed, marking disconnected");
                false
            }
        };
        (key, connected)
    }

    /// Prune, demote and backfill table entries as of `now`.
    pub async fn sweep_stale(&self, now: i64) -> SweepReport {
        let stale_after = secs(self.config.stale_after);
        let window = secs(self.config.liveness_window);
        let self_key = self.registry.self_key().to_string();
        let mut report = SweepReport::default();
        let mut removed = Vec::new();

        self.registry
            .table()
            .retain(|key, peer| {
                if *key == self_key {
                    return true;
                }
                if !peer.connected && peer.last_seen > 0 && peer.last_seen.saturating_add(stale_after) < now {
                    warn!(peer = %key, last_seen = peer.last_seen, "removing stale peer");
                    report.removed += 1;
                    removed.push(key.clone());
                    return false;
                }
                if peer.connected && peer.last_seen > 0 && peer.last_seen.saturating_add(window) < now {
                    peer.connected = false;
                    report.demoted += 1;
                }
                if peer.last_seen == 0 {
                    peer.last_seen = now;
                    report.backfilled += 1;
                }
                true
            })
            .await;

        let transport = self.registry.transport();
        for key in removed {
            match id_from_key(&key).parse::<PeerId>() {
                Ok(peer) => transport.forget_peer(peer).await,
                Err(e) => debug!(key = %key, error = %e, "removed entry has no peer id"),
            }
        }
        report
    }

    /// One resource tick.
    pub async fn resources_once(&self, now: i64) -> SweepReport {
        let stats = self.registry.transport().stats().await;
        let connected = self.registry.table().connected_snapshot().await.len();
        let known = self.registry.table().len().await;
        info!(
            connected,
            known,
            connections = stats.connections,
            pending_dials = stats.pending_dials,
            "connection summary"
        );

        if connected < self.config.min_connected_peers {
            warn!(
                connected,
                floor = self.config.min_connected_peers,
                "low connection count, re-bootstrapping"
            );
            self.reconnect().await;
            if let Err(e) = self.registry.announce().await {
                warn!(error = %e, "failed to re-announce local services");
            }
        }

        let report = self.sweep_stale(now).await;
        if report != SweepReport::default() {
            debug!(?report, "staleness sweep");
        }
        report
    }

    async fn run_verification(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.verification_interval).await;
        while tick(&mut ticker, &cancel).await {
            self.verify_once().await;
        }
    }

    async fn run_liveness(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.liveness_interval).await;
        while tick(&mut ticker, &cancel).await {
            if !self.liveness_once().await {
                error!("critical dependency health check failed");
                report_fatal(&self.fatal, FatalError::UnhealthyDependency).await;
                break;
            }
        }
    }

    async fn run_resources(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.resource_interval).await;
        while tick(&mut ticker, &cancel).await {
            self.resources_once(now_unix()).await;
        }
    }
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

/// An interval whose first tick is one period from now.
async fn interval(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    ticker
}

async fn tick(ticker: &mut tokio::time::Interval, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        _ = ticker.tick() => true,
    }
}
