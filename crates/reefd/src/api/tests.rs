//! Tests for the REST API.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use reef_agent::{AgentDirectory, MemoryAgent};
use reef_cluster::NodeRegistry;
use reef_meta::MetaStore;
use reef_reconcile::VolumeService;
use reef_types::{Node, NodeId, NodeState, ReconcileConfig, VolumeStatus};
use serde_json::{Value, json};
use tower::ServiceExt;

use super::ApiServer;
use super::handlers::{CleanupView, VolumeView};

struct TestApi {
    app: axum::Router,
    service: Arc<VolumeService>,
}

/// A router over `nodes` in-process agents, each with one pool.
async fn test_api(nodes: u8) -> TestApi {
    let registry = NodeRegistry::new();
    let directory = AgentDirectory::new();
    let mut fleet = BTreeMap::new();
    for n in 1..=nodes {
        let id = NodeId::new(format!("node-{n}"));
        let agent = Arc::new(MemoryAgent::new(id.clone()));
        registry.register(id.clone());
        directory.insert(agent.clone());
        fleet.insert(id, agent);
    }
    let meta = Arc::new(MetaStore::open_temporary().unwrap());
    let service = VolumeService::new(meta, registry, directory, ReconcileConfig::test_config());
    let app = ApiServer::new(service.clone(), fleet).into_router();

    for n in 1..=nodes {
        let response = send(
            &app,
            "PUT",
            &format!("/v0/nodes/node-{n}/pools/pool-{n}"),
            Some(json!({ "disks": ["malloc:///disk0?size_mb=64"] })),
        )
        .await;
        assert_eq!(response.0, StatusCode::OK);
    }

    TestApi { app, service }
}

/// Send a request and return the status and the raw body.
async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec();
    (status, bytes)
}

fn parse<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> T {
    serde_json::from_slice(bytes).expect("valid JSON response")
}

fn error_code(bytes: &[u8]) -> String {
    let body: Value = parse(bytes);
    body["code"].as_str().unwrap_or_default().to_string()
}

async fn create_volume(api: &TestApi, id: &str, replicas: u8) -> VolumeView {
    let (status, body) = send(
        &api.app,
        "PUT",
        &format!("/v0/volumes/{id}"),
        Some(json!({ "size": 10_485_760u64, "replicas": replicas })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    parse(&body)
}

#[tokio::test]
async fn test_create_get_and_list_volume() {
    let api = test_api(2).await;
    let created = create_volume(&api, "vol-a", 2).await;
    assert_eq!(created.status, VolumeStatus::Created);
    assert_eq!(created.replicas.len(), 2);
    assert_eq!(created.replicas[0].id.len(), 64);
    assert!(created.target.is_none());

    let (status, body) = send(&api.app, "GET", "/v0/volumes/vol-a", None).await;
    assert_eq!(status, StatusCode::OK);
    let fetched: VolumeView = parse(&body);
    assert_eq!(fetched.id, "vol-a");

    let (status, body) = send(&api.app, "GET", "/v0/volumes", None).await;
    assert_eq!(status, StatusCode::OK);
    let all: Vec<VolumeView> = parse(&body);
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_delete_returns_204_then_404() {
    let api = test_api(2).await;
    create_volume(&api, "vol-a", 2).await;

    let (status, _) = send(&api.app, "DELETE", "/v0/volumes/vol-a", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&api.app, "DELETE", "/v0/volumes/vol-a", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "NotFound");

    let (status, _) = send(&api.app, "GET", "/v0/volumes/vol-a", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_with_node_down_defers_cleanup() {
    let api = test_api(2).await;
    create_volume(&api, "vol-a", 2).await;

    let (status, body) = send(
        &api.app,
        "PUT",
        "/v0/nodes/node-2/liveness",
        Some(json!({ "reachable": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let node: Node = parse(&body);
    assert_eq!(node.state, NodeState::Unreachable);

    let (status, _) = send(&api.app, "DELETE", "/v0/volumes/vol-a", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&api.app, "GET", "/v0/cleanups", None).await;
    assert_eq!(status, StatusCode::OK);
    let cleanups: Vec<CleanupView> = parse(&body);
    assert_eq!(cleanups.len(), 1);
    assert_eq!(cleanups[0].node, "node-2");
    assert_eq!(cleanups[0].volume, "vol-a");
    assert_eq!(cleanups[0].task, "destroy_replica");
}

#[tokio::test]
async fn test_publish_and_unpublish() {
    let api = test_api(2).await;
    create_volume(&api, "vol-a", 2).await;

    let (status, body) = send(
        &api.app,
        "PUT",
        "/v0/volumes/vol-a/target",
        Some(json!({ "node": "node-1", "protocol": "NVMF" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let published: VolumeView = parse(&body);
    let target = published.target.unwrap();
    assert_eq!(target.node, "node-1");
    assert!(target.endpoint.unwrap().starts_with("nvmf://node-1/"));

    // A different target conflicts.
    let (status, body) = send(
        &api.app,
        "PUT",
        "/v0/volumes/vol-a/target",
        Some(json!({ "node": "node-2", "protocol": "nvmf" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "Conflict");

    let (status, body) = send(&api.app, "DELETE", "/v0/volumes/vol-a/target", None).await;
    assert_eq!(status, StatusCode::OK);
    let unpublished: VolumeView = parse(&body);
    assert!(unpublished.target.is_none());
}

#[tokio::test]
async fn test_publish_rejects_unknown_protocol() {
    let api = test_api(1).await;
    create_volume(&api, "vol-a", 1).await;
    let (status, body) = send(
        &api.app,
        "PUT",
        "/v0/volumes/vol-a/target",
        Some(json!({ "node": "node-1", "protocol": "smb" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "InvalidRequest");
}

#[tokio::test]
async fn test_publish_on_unreachable_node_is_503() {
    let api = test_api(2).await;
    create_volume(&api, "vol-a", 1).await;
    api.service
        .registry()
        .mark_unreachable(&NodeId::new("node-2"))
        .unwrap();

    let (status, body) = send(
        &api.app,
        "PUT",
        "/v0/volumes/vol-a/target",
        Some(json!({ "node": "node-2", "protocol": "iscsi" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_code(&body), "NodeUnreachable");
}

#[tokio::test]
async fn test_insufficient_pools_is_507() {
    let api = test_api(2).await;
    let (status, body) = send(
        &api.app,
        "PUT",
        "/v0/volumes/vol-a",
        Some(json!({ "size": 1024, "replicas": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
    assert_eq!(error_code(&body), "InsufficientPools");
}

#[tokio::test]
async fn test_zero_replicas_is_400() {
    let api = test_api(1).await;
    let (status, body) = send(
        &api.app,
        "PUT",
        "/v0/volumes/vol-a",
        Some(json!({ "size": 1024, "replicas": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "InvalidArgument");
}

#[tokio::test]
async fn test_pool_conflict_is_409() {
    let api = test_api(2).await;
    let (status, _) = send(
        &api.app,
        "PUT",
        "/v0/nodes/node-2/pools/pool-1",
        Some(json!({ "disks": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_heartbeat_registers_node() {
    let api = test_api(1).await;
    let (status, _) = send(&api.app, "POST", "/v0/nodes/node-9/heartbeat", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&api.app, "GET", "/v0/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    let nodes: Vec<Node> = parse(&body);
    assert_eq!(nodes.len(), 2);
    assert!(
        nodes
            .iter()
            .any(|n| n.id == NodeId::new("node-9") && n.state == NodeState::Reachable)
    );
}

#[tokio::test]
async fn test_liveness_of_unknown_node_is_404() {
    let api = test_api(1).await;
    let (status, body) = send(
        &api.app,
        "PUT",
        "/v0/nodes/ghost/liveness",
        Some(json!({ "reachable": true })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "NodeNotFound");
}
