//! Node configuration.
//!
//! Loaded from an optional YAML file; every field has a default so an empty
//! (or missing) file yields a runnable node. Durations are written in
//! humantime form (`"30s"`, `"24h"`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Yaml(#[source] serde_yaml::Error),
    #[error("`{field}` must be greater than zero")]
    ZeroInterval { field: &'static str },
}

/// Network mode of the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// No bootstrap at all; the node forms its own overlay.
    Standalone,
    /// Bootstrap against a node on the loopback interface.
    Local,
    /// Bootstrap from configured sources.
    #[default]
    #[serde(other)]
    Node,
}

impl FromStr for Mode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "standalone" => Self::Standalone,
            "local" => Self::Local,
            _ => Self::Node,
        })
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standalone => write!(f, "standalone"),
            Self::Local => write!(f, "local"),
            Self::Node => write!(f, "node"),
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub mode: Mode,
    /// Identity seed; `0` loads or generates a persisted key instead.
    pub seed: u64,
    /// libp2p TCP listen port (`0` picks a random port).
    pub tcp_port: u16,
    /// HTTP API port.
    pub http_port: u16,
    /// Publicly reachable IPv4 address, if this node can act as a bootstrap.
    pub public_addr: Option<String>,
    /// Home directory for identity and replicated storage.
    pub home: Option<PathBuf>,
    pub log_level: String,
    /// Shell command of a critical child process, if any.
    pub subprocess: Option<String>,
    pub bootstrap: BootstrapConfig,
    pub crdt: CrdtConfig,
    pub reconcile: ReconcileConfig,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub service: ServiceConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Node,
            seed: 0,
            tcp_port: 43905,
            http_port: 8092,
            public_addr: None,
            home: None,
            log_level: "info".to_string(),
            subprocess: None,
            bootstrap: BootstrapConfig::default(),
            crdt: CrdtConfig::default(),
            reconcile: ReconcileConfig::default(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            service: ServiceConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content).map_err(|e| match e {
            ConfigError::Yaml(source) => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from YAML text. Empty text yields
    /// defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content).map_err(ConfigError::Yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject periodic task intervals of zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("crdt.rebroadcast_interval", self.crdt.rebroadcast_interval),
            ("reconcile.verification_interval", self.reconcile.verification_interval),
            ("reconcile.liveness_interval", self.reconcile.liveness_interval),
            ("reconcile.resource_interval", self.reconcile.resource_interval),
            ("reconnect.health_check_interval", self.reconnect.health_check_interval),
            ("heartbeat.interval", self.heartbeat.interval),
        ];
        match intervals.into_iter().find(|(_, period)| period.is_zero()) {
            Some((field, _)) => Err(ConfigError::ZeroInterval { field }),
            None => Ok(()),
        }
    }

    /// Resolved home directory (`~/.fleetnet` unless configured).
    #[must_use]
    pub fn home_dir(&self) -> PathBuf {
        self.home.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".fleetnet")
        })
    }

    /// Public address with surrounding whitespace removed, if non-empty.
    #[must_use]
    pub fn public_addr(&self) -> Option<&str> {
        self.public_addr
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }
}

/// Where bootstrap addresses come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// HTTP URLs, `dnsaddr://` hosts or literal addresses.
    pub sources: Vec<String>,
    /// Literal multiaddrs.
    pub static_addrs: Vec<String>,
    /// More literal multiaddrs (kept for older config files).
    pub addrs: Vec<String>,
    /// Legacy free-form field: JSON array, delimiter-separated list or one address.
    pub addr: Option<String>,
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            static_addrs: Vec::new(),
            addrs: Vec::new(),
            addr: None,
            http_timeout: Duration::from_secs(10),
        }
    }
}

/// Replicated store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrdtConfig {
    /// Namespace of the replicated keyspace.
    pub namespace: String,
    /// Tombstones older than this are compacted; zero disables compaction.
    #[serde(with = "humantime_serde")]
    pub tombstone_retention: Duration,
    #[serde(with = "humantime_serde")]
    pub tombstone_compaction_interval: Duration,
    /// Maximum removals per compaction pass (`0` uses the default).
    pub tombstone_compaction_batch: usize,
    #[serde(with = "humantime_serde")]
    pub rebroadcast_interval: Duration,
}

impl Default for CrdtConfig {
    fn default() -> Self {
        Self {
            namespace: "fleetnet-crdt".to_string(),
            tombstone_retention: Duration::from_secs(24 * 60 * 60),
            tombstone_compaction_interval: Duration::from_secs(60 * 60),
            tombstone_compaction_batch: 512,
            rebroadcast_interval: Duration::from_secs(10),
        }
    }
}

/// Reconciliation loop schedule and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    #[serde(with = "humantime_serde")]
    pub verification_interval: Duration,
    /// Chance that a verification tick triggers a bootstrap reconnection.
    pub verification_probability: f64,
    #[serde(with = "humantime_serde")]
    pub liveness_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub resource_interval: Duration,
    /// Below this many connected peers the node re-bootstraps and re-announces.
    pub min_connected_peers: usize,
    /// Disconnected entries older than this are removed.
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
    /// Connected entries not seen for this long are demoted.
    #[serde(with = "humantime_serde")]
    pub liveness_window: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            verification_interval: Duration::from_secs(60),
            verification_probability: 0.5,
            liveness_interval: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(5),
            resource_interval: Duration::from_secs(120),
            min_connected_peers: 3,
            stale_after: Duration::from_secs(10 * 60),
            liveness_window: Duration::from_secs(2 * 60),
        }
    }
}

/// Auto-reconnector schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub min_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            min_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(120),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

/// Gossip heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
        }
    }
}

/// Local service auto-registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: Option<String>,
    pub port: Option<String>,
}

/// Shutdown timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time given to the deregistration tombstone to propagate.
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// Bound on waiting for listeners to drain before aborting them.
    #[serde(with = "humantime_serde")]
    pub force_close_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            force_close_timeout: Duration::from_secs(5),
        }
    }
}
