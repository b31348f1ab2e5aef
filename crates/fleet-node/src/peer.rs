//! Replicated peer records.
//!
//! A [`Peer`] is what every node publishes about itself into the replicated
//! registry, overlaid locally with connectivity state that is never taken
//! from a remote replica (`connected`, and the freshness of `last_seen`).
//!
//! Field names on the wire are snake_case JSON, shared by replication values
//! and the HTTP status endpoints.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Status string used for services that are reachable.
pub const SERVICE_CONNECTED: &str = "connected";

/// Current unix time in seconds.
#[must_use]
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Namespaced table / registry key for a node ID (`"/" + id`).
#[must_use]
pub fn peer_key(id: &str) -> String {
    format!("/{}", id.trim_start_matches('/'))
}

/// Node ID encoded in a namespaced key.
#[must_use]
pub fn id_from_key(key: &str) -> &str {
    key.trim_matches('/')
}

/// A single GPU as reported by the hardware inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSpec {
    /// Device name (e.g. "NVIDIA A100-SXM4-80GB").
    pub name: String,
    /// Total memory in MiB.
    pub total_memory: i64,
    /// Used memory in MiB.
    pub used_memory: i64,
}

/// Hardware inventory published with a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareSpec {
    #[serde(default)]
    pub gpus: Vec<GpuSpec>,
    #[serde(default, rename = "host_memory")]
    pub memory: i64,
    #[serde(default, rename = "host_memory_bandwidth")]
    pub memory_bandwidth: i64,
    #[serde(default, rename = "host_memory_used")]
    pub used_memory: i64,
}

/// A service advertised by a peer.
///
/// `identity_group` entries are `key=value` predicates that a request
/// payload must satisfy for this service to be selected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub hardware: HardwareSpec,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub identity_group: Vec<String>,
}

impl Service {
    /// Deduplication key for locally registered services.
    #[must_use]
    pub fn dedup_key(&self) -> (&str, &str, &str) {
        (&self.name, &self.host, &self.port)
    }
}

/// A node in the overlay as seen by this node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(default)]
    pub id: String,
    /// Round-trip latency in ms, if measured.
    #[serde(default)]
    pub latency: i64,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub current_offering: Vec<String>,
    #[serde(default)]
    pub role: Vec<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub available_offering: Vec<String>,
    #[serde(default)]
    pub service: Vec<Service>,
    /// Unix seconds of the last local observation.
    #[serde(default)]
    pub last_seen: i64,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub public_address: String,
    #[serde(default)]
    pub hardware: HardwareSpec,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub load: Vec<i64>,
}

impl Peer {
    /// A bare record for a peer known only by its ID.
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Services with the given name.
    pub fn services_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Service> + 'a {
        self.service.iter().filter(move |s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_key_roundtrip() {
        assert_eq!(peer_key("12D3KooW"), "/12D3KooW");
        assert_eq!(peer_key("/12D3KooW"), "/12D3KooW");
        assert_eq!(id_from_key("/12D3KooW"), "12D3KooW");
    }

    #[test]
    fn test_peer_wire_names() {
        let peer = Peer {
            id: "p1".to_string(),
            public_address: "1.2.3.4".to_string(),
            last_seen: 42,
            service: vec![Service {
                name: "llm".to_string(),
                port: "8080".to_string(),
                identity_group: vec!["model=a".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let json = serde_json::to_value(&peer).unwrap();
        assert_eq!(json["public_address"], "1.2.3.4");
        assert_eq!(json["last_seen"], 42);
        assert_eq!(json["service"][0]["identity_group"][0], "model=a");
        assert!(json["hardware"].get("host_memory").is_some());
    }

    #[test]
    fn test_peer_tolerates_missing_fields() {
        let peer: Peer = serde_json::from_str(r#"{"id":"p2"}"#).unwrap();
        assert_eq!(peer.id, "p2");
        assert_eq!(peer.last_seen, 0);
        assert!(!peer.connected);
        assert!(peer.service.is_empty());
    }
}
