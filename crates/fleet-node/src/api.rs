//! HTTP API.
//!
//! | Endpoint                          | Method | Description                       |
//! |-----------------------------------|--------|-----------------------------------|
//! | `/v1/health`                      | GET    | liveness                          |
//! | `/v1/dnt/table`                   | GET    | full peer table                   |
//! | `/v1/dnt/peers`                   | GET    | connected transport peers         |
//! | `/v1/dnt/bootstraps`              | GET    | addresses others can bootstrap from |
//! | `/v1/dnt/_node`                   | POST   | update this node's record         |
//! | `/v1/dnt/_node`                   | DELETE | deregister this node              |
//! | `/v1/service/{service}/{*path}`   | any    | route to a connected provider     |
//! | `/v1/_service/{service}/{*path}`  | any    | route to a local service          |

use crate::bootstrap::BootstrapList;
use crate::peer::Peer;
use crate::registry::Registry;
use crate::services::{RoutingError, forward_path};
use crate::transport::Connectedness;
use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Where a routed request should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ForwardTarget {
    /// A remote provider, reached over the overlay.
    Peer { peer: String, path: String },
    /// A service on this node.
    Local { url: String },
}

/// Performs the actual proxying of a routed request.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, target: ForwardTarget, method: Method, body: Bytes) -> Response;
}

/// Answers with the resolved target instead of proxying.
#[derive(Debug, Default, Clone, Copy)]
pub struct DescribeForwarder;

#[async_trait]
impl Forwarder for DescribeForwarder {
    async fn forward(&self, target: ForwardTarget, method: Method, _body: Bytes) -> Response {
        Json(json!({ "method": method.as_str(), "target": target })).into_response()
    }
}

impl IntoResponse for RoutingError {
    fn into_response(self) -> Response {
        let status = match self {
            RoutingError::NotFound(_) => StatusCode::NOT_FOUND,
            RoutingError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<Registry>,
    pub forwarder: Arc<dyn Forwarder>,
}

#[derive(Debug, Serialize)]
struct PeerSummary {
    id: String,
    addrs: Vec<String>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/dnt/table", get(table))
        .route("/v1/dnt/peers", get(peers))
        .route("/v1/dnt/bootstraps", get(bootstraps))
        .route("/v1/dnt/_node", post(update_node).delete(delete_node))
        .route("/v1/service/{service}/{*path}", any(global_service))
        .route("/v1/_service/{service}/{*path}", any(local_service))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn table(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!(state.registry.table().snapshot().await))
}

async fn peers(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let peers: Vec<PeerSummary> = state
        .registry
        .transport()
        .known_peers()
        .await
        .into_iter()
        .filter(|p| p.connectedness == Connectedness::Connected)
        .map(|p| PeerSummary {
            id: p.peer.to_string(),
            addrs: p.addrs.iter().map(ToString::to_string).collect(),
        })
        .collect();
    Json(json!({ "peers": peers }))
}

async fn bootstraps(State(state): State<ApiState>) -> Json<BootstrapList> {
    Json(BootstrapList {
        bootstraps: state.registry.connected_bootstraps().await,
    })
}

async fn update_node(State(state): State<ApiState>, Json(update): Json<Peer>) -> Response {
    match state.registry.update_self(update).await {
        Ok(peer) => Json(peer).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to update self record");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn delete_node(State(state): State<ApiState>) -> Response {
    match state.registry.deregister().await {
        Ok(()) => Json(json!({ "status": "deregistered" })).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to deregister");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn global_service(
    State(state): State<ApiState>,
    Path((service, path)): Path<(String, String)>,
    method: Method,
    body: Bytes,
) -> Response {
    let peer = match state.registry.select_provider(&service, &body).await {
        Ok(peer) => peer,
        Err(e) => {
            debug!(service = %service, error = %e, "no provider");
            return e.into_response();
        }
    };
    let target = ForwardTarget::Peer {
        peer,
        path: forward_path(&service, &path),
    };
    state.forwarder.forward(target, method, body).await
}

async fn local_service(
    State(state): State<ApiState>,
    Path((service, path)): Path<(String, String)>,
    method: Method,
    body: Bytes,
) -> Response {
    let local = match state.registry.local_service(&service).await {
        Ok(local) => local,
        Err(e) => return e.into_response(),
    };
    let target = ForwardTarget::Local {
        url: format!(
            "http://{}:{}/{}",
            local.host,
            local.port,
            path.trim_start_matches('/')
        ),
    };
    state.forwarder.forward(target, method, body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Service;
    use crate::registry::tests::{replicate, test_registry};
    use crate::transport::TransportEvent;
    use libp2p::PeerId;
    use serde_json::Value;

    async fn start(registry: Arc<Registry>) -> (String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let cancel = CancellationToken::new();
        let state = ApiState {
            registry,
            forwarder: Arc::new(DescribeForwarder),
        };
        tokio::spawn(serve(listener, state, cancel.clone()));
        (base, cancel)
    }

    fn llm(groups: &[&str]) -> Service {
        Service {
            name: "llm".into(),
            host: "localhost".into(),
            port: "8080".into(),
            identity_group: groups.iter().map(|g| g.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_health_and_table() {
        let (registry, _) = test_registry();
        registry.announce().await.unwrap();
        let (base, cancel) = start(registry.clone()).await;
        let client = reqwest::Client::new();

        let health: Value = client
            .get(format!("{base}/v1/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");

        let table: Value = client
            .get(format!("{base}/v1/dnt/table"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(table[registry.self_key()]["id"], registry.local_id());
        assert_eq!(table[registry.self_key()]["connected"], true);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_global_routing() {
        let (registry, _) = test_registry();
        let (base, cancel) = start(registry.clone()).await;
        let client = reqwest::Client::new();
        let url = format!("{base}/v1/service/llm/v1/chat/completions");

        let response = client.post(&url).body(r#"{"model":"b"}"#).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "No provider found for the requested service.");

        let a = PeerId::random();
        let b = PeerId::random();
        for (peer, group) in [(a, "model=a"), (b, "model=b")] {
            replicate(
                &registry,
                &Peer {
                    service: vec![llm(&[group])],
                    ..Peer::with_id(peer.to_string())
                },
            )
            .await;
            registry.handle_event(&TransportEvent::Connected(peer)).await;
        }

        let response = client.post(&url).body(r#"{"model":"b"}"#).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["method"], "POST");
        assert_eq!(body["target"]["kind"], "peer");
        assert_eq!(body["target"]["peer"], b.to_string());
        assert_eq!(body["target"]["path"], "/v1/_service/llm/v1/chat/completions");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_local_routing() {
        let (registry, _) = test_registry();
        let (base, cancel) = start(registry.clone()).await;
        let client = reqwest::Client::new();
        let url = format!("{base}/v1/_service/llm/v1/models");

        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        registry.provide(llm(&["model=a"])).await.unwrap();
        let body: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(body["target"]["kind"], "local");
        assert_eq!(body["target"]["url"], "http://localhost:8080/v1/models");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_node_update_and_deregister() {
        let (registry, _) = test_registry();
        registry.announce().await.unwrap();
        let (base, cancel) = start(registry.clone()).await;
        let client = reqwest::Client::new();
        let url = format!("{base}/v1/dnt/_node");

        let response = client
            .post(&url)
            .json(&json!({ "owner": "carol", "service": [llm(&[])] }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let me = registry.table().get(registry.self_key()).await.unwrap();
        assert_eq!(me.owner, "carol");
        assert_eq!(me.service.len(), 1);

        let bootstraps: BootstrapList = client
            .get(format!("{base}/v1/dnt/bootstraps"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(
            bootstraps
                .bootstraps
                .iter()
                .any(|a| a.starts_with("/ip4/203.0.113.7/tcp/43905/p2p/"))
        );

        let response = client.delete(&url).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(registry.table().get(registry.self_key()).await.is_none());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_peers_lists_connected() {
        let (registry, transport) = test_registry();
        let connected = PeerId::random();
        transport.set_connected(connected, true);
        transport.add_known(PeerId::random(), vec!["/ip4/10.0.0.1/tcp/1".parse().unwrap()]);
        let (base, cancel) = start(registry).await;

        let body: Value = reqwest::get(format!("{base}/v1/dnt/peers"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let peers = body["peers"].as_array().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0]["id"], connected.to_string());
        cancel.cancel();
    }
}
