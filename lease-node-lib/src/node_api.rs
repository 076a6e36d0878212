//! Axum-based node API.
//!
//! Exposes the allocation registry to validators and renters, and receives
//! the watchtower's rotation messages. Registry endpoints always answer
//! `200` with a boolean `status`; only malformed bodies, authentication and
//! ledger failures produce error responses. Capacity and status checks are
//! open, everything else sits behind [`NodeAuth`].

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use blueprint_sdk::{info, warn};
use lease_runtime::SandboxSpec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::access::AccessLedger;
use crate::auth::{NodeApiAuth, NodeAuth};
use crate::peers::{AccessGrant, AuthorityExchange, EXCHANGE_PATH, GRANT_PATH};
use crate::registry::{AllocationRegistry, ResourceRequest, StatusResponse};

pub const DEFAULT_NODE_API_PORT: u16 = 9090;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeApiConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for NodeApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_NODE_API_PORT,
        }
    }
}

impl NodeApiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_address: std::env::var("NODE_API_BIND")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.bind_address),
            port: std::env::var("NODE_API_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
        }
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[derive(Clone)]
pub struct NodeApiState {
    pub registry: Arc<AllocationRegistry>,
    pub ledger: Arc<AccessLedger>,
    pub auth: Arc<NodeApiAuth>,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ApiError {
    error: String,
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError { error: msg.into() }))
}

// ---------------------------------------------------------------------------
// Allocation endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RegisterRequest {
    lease_days: f64,
    resources: ResourceRequest,
    renter_key: String,
    sandbox: SandboxSpec,
}

#[derive(Deserialize)]
struct CheckRequest {
    lease_days: f64,
    resources: ResourceRequest,
}

#[derive(Deserialize)]
struct RenterRequest {
    renter_key: String,
}

async fn register(
    _auth: NodeAuth,
    State(state): State<NodeApiState>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    let response = state
        .registry
        .register(req.lease_days, &req.resources, &req.renter_key, &req.sandbox)
        .await;
    (StatusCode::OK, Json(response))
}

async fn deregister(
    _auth: NodeAuth,
    State(state): State<NodeApiState>,
    Json(req): Json<RenterRequest>,
) -> Json<StatusResponse> {
    Json(state.registry.deregister(&req.renter_key).await)
}

async fn check_allocation(
    State(state): State<NodeApiState>,
    Json(req): Json<CheckRequest>,
) -> Json<StatusResponse> {
    Json(
        state
            .registry
            .check_allocation(req.lease_days, &req.resources)
            .await,
    )
}

async fn check_if_allocated(
    State(state): State<NodeApiState>,
    Json(req): Json<RenterRequest>,
) -> Json<StatusResponse> {
    Json(state.registry.check_if_allocated(&req.renter_key).await)
}

async fn pause(
    _auth: NodeAuth,
    State(state): State<NodeApiState>,
    Json(req): Json<RenterRequest>,
) -> Json<StatusResponse> {
    Json(state.registry.pause(&req.renter_key).await)
}

async fn resume(
    _auth: NodeAuth,
    State(state): State<NodeApiState>,
    Json(req): Json<RenterRequest>,
) -> Json<StatusResponse> {
    Json(state.registry.resume(&req.renter_key).await)
}

// ---------------------------------------------------------------------------
// Rotation endpoints
// ---------------------------------------------------------------------------

async fn receive_exchange(
    _auth: NodeAuth,
    State(state): State<NodeApiState>,
    Json(message): Json<AuthorityExchange>,
) -> impl IntoResponse {
    if message.auditor.is_empty() || message.token.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "auditor and token are required").into_response();
    }
    if !state.auth.allows_auditor(&message.auditor) {
        warn!("node-api: refused exchange from unlisted auditor {}", message.auditor);
        return api_error(StatusCode::FORBIDDEN, "auditor is not allowed").into_response();
    }
    match state.ledger.record_exchange(&message) {
        Ok(_) => {
            info!("node-api: accepted authorization exchange from {}", message.auditor);
            (StatusCode::OK, Json(StatusResponse::from(true))).into_response()
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn receive_grant(
    _auth: NodeAuth,
    State(state): State<NodeApiState>,
    Json(grant): Json<AccessGrant>,
) -> impl IntoResponse {
    if grant.auditor.is_empty() || grant.token.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "auditor and token are required").into_response();
    }
    if !state.auth.allows_auditor(&grant.auditor) {
        warn!("node-api: refused grant for unlisted auditor {}", grant.auditor);
        return api_error(StatusCode::FORBIDDEN, "auditor is not allowed").into_response();
    }
    match state.ledger.record_grant(&grant) {
        Ok(_) => {
            info!(
                "node-api: access granted to {} peers for {}s",
                grant.peers.len(),
                grant.dwell_secs
            );
            (StatusCode::OK, Json(StatusResponse::from(true))).into_response()
        }
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn list_access(_auth: NodeAuth, State(state): State<NodeApiState>) -> impl IntoResponse {
    match state.ledger.records() {
        Ok(records) => (StatusCode::OK, Json(serde_json::json!({ "records": records }))).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn get_access(
    _auth: NodeAuth,
    State(state): State<NodeApiState>,
    Path(auditor): Path<String>,
) -> impl IntoResponse {
    match state.ledger.get(&auditor) {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("no access record for {auditor}")).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

pub fn node_api_router(state: NodeApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/allocation/register", post(register))
        .route("/api/allocation/deregister", post(deregister))
        .route("/api/allocation/check", post(check_allocation))
        .route("/api/allocation/status", post(check_if_allocated))
        .route("/api/sandbox/pause", post(pause))
        .route("/api/sandbox/resume", post(resume))
        .route(EXCHANGE_PATH, post(receive_exchange))
        .route(GRANT_PATH, post(receive_grant))
        .route("/api/rotation/access", get(list_access))
        .route("/api/rotation/access/{auditor}", get(get_access))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::mock::MockClock;
    use crate::scheduler::LeaseScheduler;
    use crate::scheduler::mock::MockJobQueue;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    use lease_runtime::runtime::mock::MockRuntime;
    use lease_runtime::{AllocationStore, LifecycleConfig, LifecycleController};
    use tower::util::ServiceExt;

    const TOKEN: &str = "node-secret";

    struct Harness {
        _dir: tempfile::TempDir,
        runtime: Arc<MockRuntime>,
        state: NodeApiState,
        renter: String,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let records = AllocationStore::open(dir.path().join("allocation.json")).unwrap();
        let lifecycle = Arc::new(LifecycleController::new(
            LifecycleConfig::default(),
            runtime.clone(),
            records,
        ));
        let scheduler = LeaseScheduler::new(
            Arc::new(MockJobQueue::new()),
            Arc::new(MockClock::default()),
            "lease-node terminate",
        );
        let ledger = AccessLedger::open(dir.path().join("access.json")).unwrap();
        let secret = k256::SecretKey::random(&mut rand::rngs::OsRng);
        Harness {
            _dir: dir,
            runtime,
            state: NodeApiState {
                registry: Arc::new(AllocationRegistry::new(lifecycle, scheduler)),
                ledger: Arc::new(ledger),
                auth: Arc::new(NodeApiAuth::with_token(TOKEN)),
            },
            renter: hex::encode(secret.public_key().to_encoded_point(true).as_bytes()),
        }
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send(
        h: &Harness,
        method: &str,
        uri: &str,
        bearer: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        node_api_router(h.state.clone())
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap()
    }

    async fn post_json(h: &Harness, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = send(h, "POST", uri, Some(TOKEN), Some(body)).await;
        let status = response.status();
        (status, body_json(response.into_body()).await)
    }

    fn resources() -> serde_json::Value {
        serde_json::json!({
            "cpu": { "count": 2 },
            "gpu": { "capacity": "all" },
            "hard_disk": { "capacity": 1_073_741_824u64 },
            "ram": { "capacity": 1_073_741_824u64 },
        })
    }

    fn register_body(renter: &str) -> serde_json::Value {
        serde_json::json!({
            "lease_days": 1.0,
            "resources": resources(),
            "renter_key": renter,
            "sandbox": {
                "base_image": "ubuntu:22.04",
                "ssh_key": "ssh-ed25519 AAAA renter",
                "ssh_port": 2222,
            },
        })
    }

    #[tokio::test]
    async fn test_register_then_check_allocation() {
        let h = harness();

        let (status, json) = post_json(&h, "/api/allocation/check", serde_json::json!({
            "lease_days": 1.0,
            "resources": resources(),
        }))
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], true);

        let (status, json) = post_json(&h, "/api/allocation/register", register_body(&h.renter)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], true);
        assert!(json["info"].as_str().is_some_and(|s| !s.is_empty()));
        assert_eq!(h.runtime.launches.lock().unwrap()[0].cpuset, "0-1");

        let (_, json) = post_json(&h, "/api/allocation/check", serde_json::json!({
            "lease_days": 1.0,
            "resources": resources(),
        }))
        .await;
        assert_eq!(json["status"], false);

        let (_, json) = post_json(
            &h,
            "/api/allocation/status",
            serde_json::json!({ "renter_key": h.renter }),
        )
        .await;
        assert_eq!(json["status"], true);
    }

    #[tokio::test]
    async fn test_register_with_bad_key_reports_false() {
        let h = harness();
        let (status, json) = post_json(&h, "/api/allocation/register", register_body("not-a-key")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], false);
        assert!(json.get("info").is_none());
    }

    #[tokio::test]
    async fn test_pause_resume_and_deregister() {
        let h = harness();
        post_json(&h, "/api/allocation/register", register_body(&h.renter)).await;
        let renter = serde_json::json!({ "renter_key": h.renter });

        let (_, json) = post_json(&h, "/api/sandbox/pause", renter.clone()).await;
        assert_eq!(json["status"], true);
        let (_, json) = post_json(&h, "/api/sandbox/resume", renter.clone()).await;
        assert_eq!(json["status"], true);

        let (_, json) = post_json(
            &h,
            "/api/allocation/deregister",
            serde_json::json!({ "renter_key": "02deadbeef" }),
        )
        .await;
        assert_eq!(json["status"], false);

        let (_, json) = post_json(&h, "/api/allocation/deregister", renter).await;
        assert_eq!(json["status"], true);
        assert!(h.runtime.containers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let h = harness();
        let response = send(
            &h,
            "POST",
            "/api/allocation/deregister",
            Some(TOKEN),
            Some(serde_json::json!({})),
        )
        .await;
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_rotation_messages_are_recorded() {
        let h = harness();

        let (status, _) = post_json(
            &h,
            EXCHANGE_PATH,
            serde_json::json!({ "auditor": "auditor-a", "token": "abc" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = post_json(
            &h,
            GRANT_PATH,
            serde_json::json!({
                "auditor": "auditor-a",
                "token": "abc",
                "peers": ["node-1"],
                "granted_at": 1_000,
                "dwell_secs": 300,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let response = send(&h, "GET", "/api/rotation/access", Some(TOKEN), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        let records = json["records"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["grant"]["peers"][0], "node-1");

        let response = send(&h, "GET", "/api/rotation/access/auditor-a", Some(TOKEN), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["token"], "abc");

        let response = send(&h, "GET", "/api/rotation/access/auditor-z", Some(TOKEN), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_guarded_routes_require_token() {
        let h = harness();
        let renter = serde_json::json!({ "renter_key": h.renter });

        let response = send(&h, "POST", "/api/allocation/register", None, Some(register_body(&h.renter))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = send(
            &h,
            "POST",
            "/api/allocation/register",
            Some("wrong"),
            Some(register_body(&h.renter)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(h.runtime.launches.lock().unwrap().is_empty());

        for uri in ["/api/allocation/deregister", "/api/sandbox/pause", "/api/sandbox/resume"] {
            let response = send(&h, "POST", uri, None, Some(renter.clone())).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }

        let response = send(
            &h,
            "POST",
            EXCHANGE_PATH,
            Some("wrong"),
            Some(serde_json::json!({ "auditor": "anyone", "token": "x" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(h.state.ledger.records().unwrap().is_empty());

        let response = send(&h, "GET", "/api/rotation/access", None, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Capacity and status checks stay open.
        let response = send(
            &h,
            "POST",
            "/api/allocation/status",
            None,
            Some(renter),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unconfigured_token_refuses_everyone() {
        let mut h = harness();
        h.state.auth = Arc::new(NodeApiAuth::default());
        let response = send(
            &h,
            "POST",
            "/api/allocation/register",
            Some(""),
            Some(register_body(&h.renter)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(h.runtime.launches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlisted_auditor_is_forbidden() {
        let mut h = harness();
        h.state.auth = Arc::new(NodeApiAuth {
            token: Some(TOKEN.into()),
            auditors: vec!["auditor-a".into()],
        });

        let (status, _) = post_json(
            &h,
            EXCHANGE_PATH,
            serde_json::json!({ "auditor": "auditor-x", "token": "abc" }),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = post_json(
            &h,
            GRANT_PATH,
            serde_json::json!({
                "auditor": "auditor-x",
                "token": "abc",
                "peers": [],
                "granted_at": 1_000,
                "dwell_secs": 300,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(h.state.ledger.records().unwrap().is_empty());

        let (status, _) = post_json(
            &h,
            EXCHANGE_PATH,
            serde_json::json!({ "auditor": "auditor-a", "token": "abc" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_empty_exchange_is_bad_request() {
        let h = harness();
        let (status, json) = post_json(
            &h,
            EXCHANGE_PATH,
            serde_json::json!({ "auditor": "", "token": "" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().is_some());
    }

    #[test]
    #[serial_test::serial]
    fn config_socket_addr() {
        assert_eq!(NodeApiConfig::default().socket_addr(), "0.0.0.0:9090");

        unsafe {
            std::env::set_var("NODE_API_BIND", "127.0.0.1");
            std::env::set_var("NODE_API_PORT", "not-a-port");
        }
        let config = NodeApiConfig::from_env();
        unsafe {
            std::env::remove_var("NODE_API_BIND");
            std::env::remove_var("NODE_API_PORT");
        }
        assert_eq!(config.socket_addr(), "127.0.0.1:9090");
    }
}
