//! Daemon assembly tests: the control plane exactly as `hostgridd serve`
//! builds it, with background settlement and spawned convergence.

use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use hostgrid_api::build_router;
use hostgrid_control::{NewRegion, wait_for_status};
use hostgrid_ledger::{ResourceKind, ResourceStatus};
use hostgridd::{DaemonConfig, build_plane};

fn in_memory() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.storage.in_memory = true;
    config
}

async fn post(router: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn served_plane_settles_in_the_background() {
    let plane = build_plane(&in_memory()).unwrap();
    let router = build_router(plane.clone());

    for (uri, body) in [
        ("/api/v1/regions", json!({"id": "eu"})),
        ("/api/v1/clusters", json!({"id": "eu-1", "region_id": "eu"})),
        (
            "/api/v1/shards",
            json!({"id": "web-1", "cluster_id": "eu-1", "role": "web"}),
        ),
        (
            "/api/v1/nodes",
            json!({"id": "n1", "cluster_id": "eu-1", "shard_id": "web-1"}),
        ),
    ] {
        let (status, _) = post(&router, uri, body).await;
        assert_eq!(status, StatusCode::CREATED, "{uri}");
    }

    let (status, body) = post(
        &router,
        "/api/v1/resources/tenant",
        json!({"id": "acme", "shard_id": "web-1"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["status"], "pending");

    let tenant = wait_for_status(
        plane.ledger(),
        ResourceKind::Tenant,
        "acme",
        ResourceStatus::Active,
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await
    .unwrap();
    assert_eq!(tenant.shard_id.as_deref(), Some("web-1"));
}

#[tokio::test]
async fn ledger_persists_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = DaemonConfig::default();
    config.storage.data_dir = dir.path().join("state");

    {
        let plane = build_plane(&config).unwrap();
        plane
            .create_region(NewRegion {
                id: "eu".into(),
                name: "Europe".into(),
            })
            .unwrap();
    }

    let plane = build_plane(&config).unwrap();
    assert_eq!(plane.get_region("eu").unwrap().name, "Europe");
    assert!(dir.path().join("state/hostgrid.redb").exists());
}

#[tokio::test]
async fn reconcile_loop_stops_on_shutdown() {
    let plane = build_plane(&in_memory()).unwrap();
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(hostgridd::run_reconcile_loop(
        plane,
        Duration::from_millis(10),
        rx,
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}
