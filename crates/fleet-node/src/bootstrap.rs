//! Bootstrap address resolution.
//!
//! Turns configuration into a deduplicated set of dialable multiaddrs.
//!
//! ```text
//!  explicit ─┐
//!  sources  ─┤   ┌────────────────┐   http(s)://…    GET {"bootstraps":[..]}
//!  static   ─┼──▶│ resolve_source │── dnsaddr://h ── TXT _dnsaddr.h  "dnsaddr=…"
//!  addrs    ─┤   └────────────────┘   anything else   literal / list
//!  legacy   ─┘            │
//!                         ▼
//!              dedupe ─▶ parse ─▶ Vec<Multiaddr>
//! ```
//!
//! A failing source is logged and skipped; resolution never fails as a whole.

use crate::config::{BootstrapConfig, Mode};
use crate::transport::PeerInfo;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Loopback bootstrap address used in `local` mode.
pub const LOCAL_BOOTSTRAP: &str = "/ip4/127.0.0.1/tcp/43905";

const DNSADDR_SCHEME: &str = "dnsaddr://";
const DNSADDR_PREFIX: &str = "dnsaddr=";

/// Wire format of an HTTP bootstrap endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapList {
    #[serde(default)]
    pub bootstraps: Vec<String>,
}

/// Failure of a single bootstrap source.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status code: {0}")]
    Status(reqwest::StatusCode),
    #[error("empty response")]
    EmptyResponse,
    #[error("invalid bootstrap payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("empty dnsaddr host")]
    EmptyHost,
    #[error("lookup failed: {0}")]
    Lookup(String),
    #[error("no dnsaddr records for {0}")]
    NoRecords(String),
}

/// DNS TXT lookups, injectable for tests.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, BootstrapError>;
}

/// System-configured DNS resolver.
pub struct SystemTxtResolver {
    resolver: TokioAsyncResolver,
}

impl SystemTxtResolver {
    #[must_use]
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            debug!(error = %e, "system resolver config unavailable, using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver }
    }
}

impl Default for SystemTxtResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxtResolver for SystemTxtResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, BootstrapError> {
        let lookup = self
            .resolver
            .txt_lookup(name)
            .await
            .map_err(|e| BootstrapError::Lookup(e.to_string()))?;
        Ok(lookup.iter().map(ToString::to_string).collect())
    }
}

/// Resolves bootstrap addresses from every configured source.
pub struct BootstrapResolver {
    config: BootstrapConfig,
    http: reqwest::Client,
    dns: Arc<dyn TxtResolver>,
}

impl BootstrapResolver {
    pub fn new(config: BootstrapConfig) -> Result<Self, BootstrapError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            config,
            http,
            dns: Arc::new(SystemTxtResolver::new()),
        })
    }

    /// Replace the DNS resolver.
    #[must_use]
    pub fn with_txt_resolver(mut self, dns: Arc<dyn TxtResolver>) -> Self {
        self.dns = dns;
        self
    }

    /// Resolve the bootstrap set for `mode`.
    ///
    /// `explicit` entries are handled like configured sources, so they may be
    /// literal addresses, HTTP endpoints or `dnsaddr://` hosts.
    pub async fn resolve(&self, mode: Mode, explicit: &[String]) -> Vec<Multiaddr> {
        match mode {
            Mode::Standalone => {
                debug!("standalone mode, no bootstrap peers");
                return Vec::new();
            }
            Mode::Local => return parse_multiaddrs(&[LOCAL_BOOTSTRAP.to_string()]),
            Mode::Node => {}
        }

        let mut sources: Vec<String> = explicit.to_vec();
        sources.extend(self.configured_sources());
        let sources = dedup_strings(sources);
        if sources.is_empty() {
            warn!("no bootstrap sources configured");
            return Vec::new();
        }

        let mut resolved = Vec::new();
        for source in &sources {
            match self.resolve_source(source).await {
                Ok(entries) => resolved.extend(entries),
                Err(e) => warn!(source = %source, error = %e, "bootstrap source failed"),
            }
        }

        let addrs = parse_multiaddrs(&dedup_strings(resolved));
        if addrs.is_empty() {
            warn!("no bootstrap addresses discovered from configured sources");
        } else {
            info!(count = addrs.len(), "resolved bootstrap addresses");
        }
        addrs
    }

    /// Every configured source string, legacy field expanded.
    #[must_use]
    pub fn configured_sources(&self) -> Vec<String> {
        let mut combined: Vec<String> = self
            .config
            .sources
            .iter()
            .chain(&self.config.static_addrs)
            .chain(&self.config.addrs)
            .cloned()
            .collect();
        if let Some(legacy) = self.config.addr.as_deref() {
            combined.extend(expand_value(legacy));
        }
        dedup_strings(combined)
    }

    async fn resolve_source(&self, source: &str) -> Result<Vec<String>, BootstrapError> {
        let source = source.trim();
        if source.is_empty() {
            return Ok(Vec::new());
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            return self.fetch_http(source).await;
        }
        if source
            .get(..DNSADDR_SCHEME.len())
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case(DNSADDR_SCHEME))
        {
            return self.fetch_dnsaddr(&source[DNSADDR_SCHEME.len()..]).await;
        }
        Ok(expand_value(source))
    }

    async fn fetch_http(&self, url: &str) -> Result<Vec<String>, BootstrapError> {
        info!(source = %url, "fetching bootstrap list");
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BootstrapError::Status(status));
        }
        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(BootstrapError::EmptyResponse);
        }
        let list: BootstrapList = serde_json::from_slice(&body)?;
        Ok(list.bootstraps)
    }

    async fn fetch_dnsaddr(&self, host: &str) -> Result<Vec<String>, BootstrapError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(BootstrapError::EmptyHost);
        }
        let records = self.dns.lookup_txt(&format!("_dnsaddr.{host}")).await?;
        let addrs: Vec<String> = records
            .iter()
            .filter_map(|record| record.trim().strip_prefix(DNSADDR_PREFIX))
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect();
        if addrs.is_empty() {
            return Err(BootstrapError::NoRecords(host.to_string()));
        }
        Ok(addrs)
    }
}

/// Expand a free-form value: a JSON array, a delimiter-separated list or a
/// single address.
#[must_use]
pub fn expand_value(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') {
        if let Ok(list) = serde_json::from_str::<Vec<String>>(trimmed) {
            return list;
        }
    }
    let segments: Vec<String> = trimmed
        .split([',', ';', '\n', '\t', ' '])
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if segments.is_empty() {
        vec![trimmed.to_string()]
    } else {
        segments
    }
}

/// Parse address strings, dropping invalid and duplicate entries.
#[must_use]
pub fn parse_multiaddrs(entries: &[String]) -> Vec<Multiaddr> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for entry in entries {
        let entry = entry.trim().trim_matches('"').trim();
        if entry.is_empty() {
            continue;
        }
        match entry.parse::<Multiaddr>() {
            Ok(addr) => {
                if seen.insert(addr.to_string()) {
                    result.push(addr);
                }
            }
            Err(e) => warn!(addr = %entry, error = %e, "skipping invalid bootstrap multiaddr"),
        }
    }
    result
}

/// Peer ID carried in a trailing `/p2p/<id>` component.
#[must_use]
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(peer)) => Some(peer),
        _ => None,
    }
}

/// Group addresses into dial targets by their `/p2p/` component.
///
/// Addresses without a peer ID each become their own address-only target.
#[must_use]
pub fn peer_infos(addrs: &[Multiaddr]) -> Vec<PeerInfo> {
    let mut infos: Vec<PeerInfo> = Vec::new();
    for addr in addrs {
        let Some(peer) = peer_id_of(addr) else {
            infos.push(PeerInfo {
                peer: None,
                addrs: vec![addr.clone()],
            });
            continue;
        };
        let mut transport_addr = addr.clone();
        transport_addr.pop();
        match infos.iter_mut().find(|info| info.peer == Some(peer)) {
            Some(info) => {
                if !info.addrs.contains(&transport_addr) {
                    info.addrs.push(transport_addr);
                }
            }
            None => infos.push(PeerInfo::new(peer, vec![transport_addr])),
        }
    }
    infos
}

fn dedup_strings(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && seen.insert(v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use std::collections::HashMap;

    const TEST_PEER_ID: &str = "12D3KooWJ7BrgG4dF1u9wB3XAGKTd7Lw1R6CQqp38zdc6PGBHFcM";

    struct StaticTxt(HashMap<String, Vec<String>>);

    #[async_trait]
    impl TxtResolver for StaticTxt {
        async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, BootstrapError> {
            Ok(self.0.get(name).cloned().unwrap_or_default())
        }
    }

    fn resolver(config: BootstrapConfig) -> BootstrapResolver {
        BootstrapResolver::new(config)
            .unwrap()
            .with_txt_resolver(Arc::new(StaticTxt(HashMap::new())))
    }

    async fn serve(body: &'static str) -> String {
        let app = Router::new().route("/v1/dnt/bootstraps", get(move || async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1/dnt/bootstraps")
    }

    #[tokio::test]
    async fn test_standalone_is_empty() {
        let config = BootstrapConfig {
            static_addrs: vec![format!("/ip4/10.0.0.1/tcp/4001/p2p/{TEST_PEER_ID}")],
            ..Default::default()
        };
        let explicit = vec![format!("/ip4/10.0.0.9/tcp/4001/p2p/{TEST_PEER_ID}")];
        assert!(resolver(config).resolve(Mode::Standalone, &explicit).await.is_empty());
    }

    #[tokio::test]
    async fn test_local_is_loopback() {
        let addrs = resolver(BootstrapConfig::default())
            .resolve(Mode::Local, &[])
            .await;
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].to_string(), LOCAL_BOOTSTRAP);
    }

    #[tokio::test]
    async fn test_explicit_address() {
        let explicit = vec![format!("/ip4/127.0.0.1/tcp/1234/p2p/{TEST_PEER_ID}")];
        let addrs = resolver(BootstrapConfig::default())
            .resolve(Mode::Node, &explicit)
            .await;
        assert_eq!(addrs.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicates_across_fields_collapse() {
        let addr = format!("/ip4/10.0.0.1/tcp/4001/p2p/{TEST_PEER_ID}");
        let config = BootstrapConfig {
            sources: vec![addr.clone()],
            static_addrs: vec![addr.clone()],
            addrs: vec![format!("\"{addr}\"")],
            addr: Some(format!("[\"{addr}\", \"/ip4/10.0.0.2/tcp/4001\"]")),
            ..Default::default()
        };
        let addrs = resolver(config).resolve(Mode::Node, &[addr.clone()]).await;
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs.iter().filter(|a| a.to_string() == addr).count(), 1);
    }

    #[tokio::test]
    async fn test_http_source() {
        let url = serve(
            r#"{"bootstraps":["/ip4/127.0.0.1/tcp/4001/p2p/12D3KooWJ7BrgG4dF1u9wB3XAGKTd7Lw1R6CQqp38zdc6PGBHFcM"]}"#,
        )
        .await;
        let config = BootstrapConfig {
            sources: vec![url],
            ..Default::default()
        };
        let addrs = resolver(config).resolve(Mode::Node, &[]).await;
        assert_eq!(addrs.len(), 1);
        assert_eq!(
            addrs[0].to_string(),
            format!("/ip4/127.0.0.1/tcp/4001/p2p/{TEST_PEER_ID}")
        );
    }

    #[tokio::test]
    async fn test_malformed_http_source_is_skipped() {
        let url = serve(r#"{"bootstraps":"#).await;
        let config = BootstrapConfig {
            sources: vec![url, format!("/ip4/10.0.0.1/tcp/4001/p2p/{TEST_PEER_ID}")],
            ..Default::default()
        };
        let addrs = resolver(config).resolve(Mode::Node, &[]).await;
        assert_eq!(addrs.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_http_source_is_skipped() {
        let config = BootstrapConfig {
            sources: vec![
                "http://127.0.0.1:1/unreachable".to_string(),
                "/ip4/10.0.0.3/tcp/4001".to_string(),
            ],
            ..Default::default()
        };
        let addrs = resolver(config).resolve(Mode::Node, &[]).await;
        assert_eq!(addrs.len(), 1);
    }

    #[tokio::test]
    async fn test_dnsaddr_source() {
        let mut records = HashMap::new();
        records.insert(
            "_dnsaddr.bootstrap.example.com".to_string(),
            vec![
                format!("dnsaddr=/ip4/10.0.0.2/tcp/4001/p2p/{TEST_PEER_ID}"),
                "v=spf1 -all".to_string(),
            ],
        );
        let config = BootstrapConfig {
            sources: vec!["DNSADDR://bootstrap.example.com".to_string()],
            ..Default::default()
        };
        let addrs = BootstrapResolver::new(config)
            .unwrap()
            .with_txt_resolver(Arc::new(StaticTxt(records)))
            .resolve(Mode::Node, &[])
            .await;
        assert_eq!(addrs.len(), 1);
    }

    #[tokio::test]
    async fn test_dnsaddr_without_records_is_skipped() {
        let config = BootstrapConfig {
            sources: vec!["dnsaddr://empty.example.com".to_string()],
            ..Default::default()
        };
        assert!(resolver(config).resolve(Mode::Node, &[]).await.is_empty());
    }

    #[test]
    fn test_expand_value() {
        assert_eq!(expand_value(r#"["/a", "/b"]"#), vec!["/a", "/b"]);
        assert_eq!(expand_value("/a, /b;/c\n/d"), vec!["/a", "/b", "/c", "/d"]);
        assert_eq!(expand_value("/ip4/1.2.3.4/tcp/1"), vec!["/ip4/1.2.3.4/tcp/1"]);
        assert!(expand_value("   ").is_empty());
        // Broken JSON falls back to splitting.
        assert_eq!(expand_value("[/a /b"), vec!["[/a", "/b"]);
    }

    #[test]
    fn test_parse_skips_invalid() {
        let addrs = parse_multiaddrs(&[
            "not-an-address".to_string(),
            "/ip4/10.0.0.1/tcp/4001".to_string(),
            " \"/ip4/10.0.0.1/tcp/4001\" ".to_string(),
        ]);
        assert_eq!(addrs.len(), 1);
    }

    #[test]
    fn test_peer_infos_grouping() {
        let addrs = parse_multiaddrs(&[
            format!("/ip4/10.0.0.1/tcp/4001/p2p/{TEST_PEER_ID}"),
            format!("/ip4/10.0.0.2/tcp/4001/p2p/{TEST_PEER_ID}"),
            "/ip4/10.0.0.3/tcp/4001".to_string(),
        ]);
        let infos = peer_infos(&addrs);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].peer, Some(TEST_PEER_ID.parse().unwrap()));
        assert_eq!(infos[0].addrs.len(), 2);
        assert_eq!(infos[0].addrs[0].to_string(), "/ip4/10.0.0.1/tcp/4001");
        assert_eq!(infos[1].peer, None);
    }
}
