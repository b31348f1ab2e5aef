//! Node lifecycle.
//!
//! [`Node::new`] builds every component, [`Node::start`] spawns the
//! background tasks and the HTTP server, [`Node::shutdown`] tears them down
//! in order: stop accepting HTTP requests, deregister, wait for the
//! tombstone to propagate, cancel tasks, close the transport.

use crate::api::{self, ApiState, DescribeForwarder, Forwarder};
use crate::bootstrap::BootstrapResolver;
use crate::collaborators::{AlwaysHealthy, HardwareInventory, HealthCheck, NoHardware};
use crate::compactor;
use crate::config::{Mode, NodeConfig};
use crate::crdt::{self, CrdtStore, GossipBroadcaster, RedbDatastore};
use crate::heartbeat;
use crate::identity::NodeIdentity;
use crate::reconcile::Reconciler;
use crate::reconnect::AutoReconnector;
use crate::registry::{Registry, RegistrySettings, TableObserver};
use crate::services::{LLM_SERVICE, LlmProbe, LocalServices};
use crate::table::PeerTable;
use crate::transport::{SwarmConfig, SwarmTransport, Transport};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Conditions the node cannot recover from.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("critical dependency is unhealthy")]
    UnhealthyDependency,
    #[error("HTTP server failed: {0}")]
    HttpServer(String),
}

/// External collaborators plugged into the node.
#[derive(Clone)]
pub struct Collaborators {
    pub health: Arc<dyn HealthCheck>,
    pub hardware: Arc<dyn HardwareInventory>,
    pub forwarder: Arc<dyn Forwarder>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            health: Arc::new(AlwaysHealthy),
            hardware: Arc::new(NoHardware),
            forwarder: Arc::new(DescribeForwarder),
        }
    }
}

pub struct Node {
    config: NodeConfig,
    explicit_bootstraps: Vec<String>,
    identity: NodeIdentity,
    transport: Arc<dyn Transport>,
    store: Arc<CrdtStore>,
    registry: Arc<Registry>,
    resolver: Arc<BootstrapResolver>,
    collaborators: Collaborators,
    cancel: CancellationToken,
    http_shutdown: CancellationToken,
    http: Option<JoinHandle<()>>,
    http_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    fatal_tx: mpsc::Sender<FatalError>,
    fatal_rx: Option<mpsc::Receiver<FatalError>>,
}

impl Node {
    /// Build identity, transport, storage and registry.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: NodeConfig,
        explicit_bootstraps: Vec<String>,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;
        let home = config.home_dir();
        let identity = NodeIdentity::load_or_create(config.seed, &home)
            .context("failed to load node identity")?;
        let local_id = identity.peer_id().to_string();

        let transport: Arc<dyn Transport> = Arc::new(
            SwarmTransport::spawn(
                &identity,
                &SwarmConfig {
                    tcp_port: config.tcp_port,
                    ..Default::default()
                },
            )
            .context("failed to start transport")?,
        );

        let data_dir = identity.data_dir(&home);
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let datastore = RedbDatastore::open(data_dir.join("registry.redb"))
            .context("failed to open registry datastore")?;

        let table = Arc::new(PeerTable::new());
        let namespace = config.crdt.namespace.trim_matches('/').to_string();
        let broadcaster = Arc::new(GossipBroadcaster::new(transport.clone(), namespace.clone()));
        let store = Arc::new(CrdtStore::new(
            &namespace,
            local_id.clone(),
            Arc::new(datastore),
            Arc::new(TableObserver::new(table.clone(), &local_id)),
            Some(broadcaster),
        ));

        let registry = Arc::new(Registry::new(
            store.clone(),
            table,
            Arc::new(LocalServices::new()),
            transport.clone(),
            collaborators.hardware.clone(),
            RegistrySettings {
                version: env!("CARGO_PKG_VERSION").to_string(),
                public_addr: config.public_addr().map(str::to_string),
                tcp_port: config.tcp_port,
            },
        ));
        let resolver = Arc::new(
            BootstrapResolver::new(config.bootstrap.clone())
                .context("failed to build bootstrap resolver")?,
        );

        let (fatal_tx, fatal_rx) = mpsc::channel(4);
        info!(peer_id = %local_id, mode = %config.mode, home = %home.display(), "node initialised");

        Ok(Self {
            config,
            explicit_bootstraps,
            identity,
            transport,
            store,
            registry,
            resolver,
            collaborators,
            cancel: CancellationToken::new(),
            http_shutdown: CancellationToken::new(),
            http: None,
            http_addr: None,
            tasks: Vec::new(),
            fatal_tx,
            fatal_rx: Some(fatal_rx),
        })
    }

    #[must_use]
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Address the HTTP API is bound to, once started.
    #[must_use]
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Receiver of fatal conditions; can be taken once.
    pub fn take_fatal(&mut self) -> Option<mpsc::Receiver<FatalError>> {
        self.fatal_rx.take()
    }

    fn spawn(&mut self, task: impl Future<Output = ()> + Send + 'static) {
        self.tasks.push(tokio::spawn(task));
    }

    /// Publish the self record and spawn every background task.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let topic = self.store.namespace().trim_matches('/').to_string();
        let heartbeat_topic = heartbeat::topic(&topic);

        self.spawn(self.registry.clone().run_events(self.cancel.child_token()));
        self.spawn(crdt::run_receiver(
            self.store.clone(),
            self.transport.clone(),
            topic.clone(),
            self.cancel.child_token(),
        ));
        self.spawn(crdt::run_rebroadcast(
            self.store.clone(),
            Arc::new(GossipBroadcaster::new(self.transport.clone(), topic)),
            self.config.crdt.rebroadcast_interval,
            self.cancel.child_token(),
        ));
        self.spawn(heartbeat::run_reader(
            self.registry.clone(),
            heartbeat_topic.clone(),
            self.cancel.child_token(),
        ));
        self.spawn(heartbeat::run_publisher(
            self.registry.clone(),
            heartbeat_topic,
            self.config.heartbeat.interval,
            self.cancel.child_token(),
        ));

        self.registry
            .announce()
            .await
            .context("failed to publish self record")?;

        if let Some(handle) =
            compactor::spawn(self.store.clone(), &self.config.crdt, self.cancel.child_token())
        {
            self.tasks.push(handle);
        }

        let reconciler = Arc::new(Reconciler::new(
            self.registry.clone(),
            self.resolver.clone(),
            self.collaborators.health.clone(),
            self.config.reconcile.clone(),
            self.config.mode,
            self.explicit_bootstraps.clone(),
            self.fatal_tx.clone(),
        ));
        let initial = reconciler.clone();
        self.spawn(async move {
            let connected = initial.reconnect().await;
            debug!(connected, "initial bootstrap finished");
        });
        let handles = reconciler.spawn(&self.cancel);
        self.tasks.extend(handles);

        if self.config.mode != Mode::Standalone {
            let reconnector = AutoReconnector::new(
                self.transport.clone(),
                self.resolver.clone(),
                self.config.mode,
                self.explicit_bootstraps.clone(),
                self.config.reconnect.clone(),
            );
            self.spawn(reconnector.run(self.cancel.child_token()));
        }

        self.start_service_registration()?;
        self.start_http().await
    }

    fn start_service_registration(&mut self) -> anyhow::Result<()> {
        let service = &self.config.service;
        let (Some(name), Some(port)) = (service.name.as_deref(), service.port.as_deref()) else {
            return Ok(());
        };
        if name != LLM_SERVICE {
            debug!(service = name, "no auto-registration for service");
            return Ok(());
        }
        let probe = LlmProbe::new("localhost", port).context("failed to build LLM probe")?;
        let registry = self.registry.clone();
        let cancel = self.cancel.child_token();
        self.spawn(async move {
            match probe.discover(&cancel).await {
                Ok(service) => {
                    if let Err(e) = registry.provide(service).await {
                        warn!(error = %e, "failed to announce LLM service");
                    }
                }
                Err(e) => warn!(error = %e, "LLM service registration failed"),
            }
        });
        Ok(())
    }

    async fn start_http(&mut self) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP API on {addr}"))?;
        let bound = listener.local_addr().context("HTTP listener has no address")?;
        info!(addr = %bound, "HTTP API listening");

        let state = ApiState {
            registry: self.registry.clone(),
            forwarder: self.collaborators.forwarder.clone(),
        };
        let shutdown = self.http_shutdown.clone();
        let fatal = self.fatal_tx.clone();
        self.http = Some(tokio::spawn(async move {
            if let Err(e) = api::serve(listener, state, shutdown).await {
                error!(error = %e, "HTTP server failed");
                report_fatal(&fatal, FatalError::HttpServer(e.to_string())).await;
            }
        }));
        self.http_addr = Some(bound);
        Ok(())
    }

    /// Orderly shutdown.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        self.http_shutdown.cancel();

        if let Err(e) = self.registry.deregister().await {
            warn!(error = %e, "failed to deregister");
        }
        tokio::time::sleep(self.config.shutdown.grace_period).await;

        self.cancel.cancel();
        let timeout = self.config.shutdown.force_close_timeout;
        for task in self.tasks.drain(..) {
            join_or_abort(task, timeout).await;
        }
        self.transport.shutdown().await;

        if let Some(http) = self.http.take() {
            join_or_abort(http, timeout).await;
        }
        info!("shutdown complete");
    }
}

/// Hand `reason` to the owner of the fatal receiver; `false` if it is gone.
pub(crate) async fn report_fatal(fatal: &mpsc::Sender<FatalError>, reason: FatalError) -> bool {
    match fatal.send(reason).await {
        Ok(()) => true,
        Err(mpsc::error::SendError(reason)) => {
            warn!(%reason, "fatal channel closed, condition not delivered");
            false
        }
    }
}

async fn join_or_abort(mut handle: JoinHandle<()>, timeout: Duration) {
    if tokio::time::timeout(timeout, &mut handle).await.is_err() {
        debug!("task did not stop in time, aborting");
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigError, ShutdownConfig};
    use serde_json::Value;

    fn config(home: &std::path::Path) -> NodeConfig {
        NodeConfig {
            mode: Mode::Standalone,
            seed: 7,
            tcp_port: 0,
            http_port: 0,
            home: Some(home.to_path_buf()),
            shutdown: ShutdownConfig {
                grace_period: Duration::from_millis(10),
                force_close_timeout: Duration::from_secs(2),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_node_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut node = Node::new(config(dir.path()), Vec::new(), Collaborators::default()).unwrap();
        assert!(node.take_fatal().is_some());
        assert!(node.take_fatal().is_none());
        node.start().await.unwrap();

        let registry = node.registry().clone();
        let me = registry.table().get(registry.self_key()).await.unwrap();
        assert!(me.connected);
        assert_eq!(me.version, env!("CARGO_PKG_VERSION"));

        let port = node.http_addr().unwrap().port();
        let health: Value = reqwest::get(format!("http://127.0.0.1:{port}/v1/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let data_dir = node.identity().data_dir(dir.path());
        tokio::time::timeout(Duration::from_secs(10), node.shutdown())
            .await
            .unwrap();
        assert!(registry.table().get(registry.self_key()).await.is_none());
        assert!(data_dir.join("registry.redb").exists());
    }

    #[tokio::test]
    async fn test_report_fatal() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(report_fatal(&tx, FatalError::UnhealthyDependency).await);
        assert!(matches!(rx.recv().await, Some(FatalError::UnhealthyDependency)));

        drop(rx);
        assert!(!report_fatal(&tx, FatalError::HttpServer("bind lost".into())).await);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.reconcile.liveness_interval = Duration::ZERO;
        let err = Node::new(config, Vec::new(), Collaborators::default())
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::ZeroInterval {
                field: "reconcile.liveness_interval"
            })
        ));
    }

    #[tokio::test]
    async fn test_seeded_identity_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = NodeIdentity::load_or_create(7, dir.path()).unwrap();
        let node = Node::new(config(dir.path()), Vec::new(), Collaborators::default()).unwrap();
        assert_eq!(node.identity().peer_id(), first.peer_id());
        node.shutdown().await;
    }
}
