//! Local services and provider selection.
//!
//! Services this node offers are kept in [`LocalServices`] and published as
//! part of the node's own record. Requests for a named service are routed
//! to a connected peer whose advertised service satisfies every
//! `key=value` identity-group predicate against the request payload.

use crate::peer::{Peer, SERVICE_CONNECTED, Service};
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Name of the auto-registered language-model service.
pub const LLM_SERVICE: &str = "llm";

/// Request-path routing failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Service not found: {0}")]
    NotFound(String),
    #[error("No provider found for the requested service.")]
    Unavailable(String),
}

/// Services provided by this node, deduplicated by name, host and port.
#[derive(Debug, Default)]
pub struct LocalServices {
    services: RwLock<Vec<Service>>,
}

impl LocalServices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `service`, or merge its identity groups into an existing entry
    /// with the same name, host and port.
    pub async fn register(&self, service: Service) {
        let mut services = self.services.write().await;
        match services
            .iter_mut()
            .find(|s| s.dedup_key() == service.dedup_key())
        {
            Some(existing) => {
                for group in service.identity_group {
                    if !existing.identity_group.contains(&group) {
                        existing.identity_group.push(group);
                    }
                }
            }
            None => services.push(service),
        }
    }

    pub async fn snapshot(&self) -> Vec<Service> {
        self.services.read().await.clone()
    }
}

/// Whether `payload` satisfies every identity-group predicate of `service`.
///
/// A predicate matches when the payload's top-level string field named by
/// its key equals its value. Predicates without `=` never match.
#[must_use]
pub fn matches(service: &Service, payload: &Value) -> bool {
    service.identity_group.iter().all(|predicate| {
        let Some((key, expected)) = predicate.split_once('=') else {
            return false;
        };
        payload.get(key).and_then(Value::as_str) == Some(expected)
    })
}

/// IDs of connected peers able to serve `name` for `payload`.
#[must_use]
pub fn candidates(peers: &BTreeMap<String, Peer>, name: &str, payload: &[u8]) -> Vec<String> {
    let payload: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
    peers
        .values()
        .filter(|peer| peer.connected)
        .filter(|peer| peer.services_named(name).any(|s| matches(s, &payload)))
        .map(|peer| peer.id.clone())
        .collect()
}

/// Pick one candidate uniformly at random.
pub fn select_provider(
    peers: &BTreeMap<String, Peer>,
    name: &str,
    payload: &[u8],
) -> Result<String, RoutingError> {
    let candidates = candidates(peers, name, payload);
    candidates
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or_else(|| RoutingError::Unavailable(name.to_string()))
}

/// Path the selected provider serves the request on.
#[must_use]
pub fn forward_path(service: &str, path: &str) -> String {
    format!("/v1/_service/{service}/{}", path.trim_start_matches('/'))
}

/// Failures while auto-registering a local LLM service.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("service on port {port} not healthy after {attempts} attempts")]
    Unhealthy { port: String, attempts: usize },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status code: {0}")]
    Status(reqwest::StatusCode),
    #[error("invalid models payload: {0}")]
    Models(#[from] serde_json::Error),
    #[error("registration cancelled")]
    Cancelled,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Probes a local OpenAI-compatible server and describes it as a service.
pub struct LlmProbe {
    client: reqwest::Client,
    host: String,
    port: String,
    retry_delay: Duration,
    max_attempts: usize,
}

impl LlmProbe {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Result<Self, RegistrationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            host: host.into(),
            port: port.into(),
            retry_delay: Duration::from_secs(10),
            max_attempts: 6000,
        })
    }

    #[must_use]
    pub fn with_retry(mut self, delay: Duration, max_attempts: usize) -> Self {
        self.retry_delay = delay;
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}:{}{path}", self.host, self.port)
    }

    /// Wait for `/health`, then describe every model from `/v1/models`.
    pub async fn discover(&self, cancel: &CancellationToken) -> Result<Service, RegistrationError> {
        self.wait_healthy(cancel).await?;
        info!(port = %self.port, "LLM service is healthy");

        let response = self.client.get(self.url("/v1/models")).send().await?;
        if !response.status().is_success() {
            return Err(RegistrationError::Status(response.status()));
        }
        let models: ModelList = serde_json::from_slice(&response.bytes().await?)?;
        debug!(count = models.data.len(), "fetched models from LLM service");

        Ok(Service {
            name: LLM_SERVICE.to_string(),
            status: SERVICE_CONNECTED.to_string(),
            host: self.host.clone(),
            port: self.port.clone(),
            identity_group: models
                .data
                .into_iter()
                .map(|m| format!("model={}", m.id))
                .collect(),
            ..Default::default()
        })
    }

    async fn wait_healthy(&self, cancel: &CancellationToken) -> Result<(), RegistrationError> {
        for attempt in 1..=self.max_attempts {
            match self.client.get(self.url("/health")).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    info!(status = %response.status(), attempt, "LLM health check failed, retrying");
                }
                Err(e) => info!(error = %e, attempt, "LLM health check failed, retrying"),
            }
            if attempt == self.max_attempts {
                break;
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(RegistrationError::Cancelled),
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }
        Err(RegistrationError::Unhealthy {
            port: self.port.clone(),
            attempts: self.max_attempts,
        })
    }
}
