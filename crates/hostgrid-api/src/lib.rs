//! hostgrid-api: REST API for hostgrid.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET, POST | `/api/v1/resources/{kind}` | List / create resources of a kind |
//! | GET, PATCH, DELETE | `/api/v1/resources/{kind}/{id}` | Read / update / delete one resource |
//! | POST | `/api/v1/resources/{kind}/{id}/{retry,suspend,unsuspend,migrate,enable,disable}` | Lifecycle actions |
//! | POST | `/api/v1/tenants/{id}/retry-failed` | Retry every failed resource of a tenant |
//! | GET | `/api/v1/tenants/{id}/resource-summary` | Per-kind status counts |
//! | GET, POST | `/api/v1/{regions,clusters,shards,nodes}` | Topology listing / creation |
//! | GET, DELETE | `/api/v1/{regions,clusters,shards,nodes}/{id}` | Topology read / delete |
//! | POST | `/api/v1/shards/{id}/converge` | Request convergence |
//! | GET | `/api/v1/shards/{id}/{desired-state,health}` | Shard document / health verdict |
//! | GET | `/api/v1/workflows/{key}` | Workflow execution status |
//! | GET | `/internal/nodes/{id}/desired-state` | Node agent: pull desired state |
//! | GET, POST | `/internal/nodes/{id}/health` | Node agent: health snapshot |
//! | GET, POST | `/internal/nodes/{id}/drift` | Node agent: drift events |

pub mod nodes;
pub mod resources;
mod response;
pub mod topology;

use axum::Router;
use axum::routing::{get, post};

use hostgrid_control::ControlPlane;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub plane: ControlPlane,
}

/// Build the complete router (control API + node agent protocol).
pub fn build_router(plane: ControlPlane) -> Router {
    let state = ApiState { plane };

    let api_routes = Router::new()
        .route(
            "/resources/{kind}",
            get(resources::list_resources).post(resources::create_resource),
        )
        .route(
            "/resources/{kind}/{id}",
            get(resources::get_resource)
                .patch(resources::update_resource)
                .delete(resources::delete_resource),
        )
        .route("/resources/{kind}/{id}/retry", post(resources::retry_resource))
        .route("/resources/{kind}/{id}/suspend", post(resources::suspend_resource))
        .route("/resources/{kind}/{id}/unsuspend", post(resources::unsuspend_resource))
        .route("/resources/{kind}/{id}/migrate", post(resources::migrate_resource))
        .route("/resources/{kind}/{id}/enable", post(resources::enable_resource))
        .route("/resources/{kind}/{id}/disable", post(resources::disable_resource))
        .route("/tenants/{id}/retry-failed", post(resources::retry_failed))
        .route("/tenants/{id}/resource-summary", get(resources::resource_summary))
        .route("/workflows/{key}", get(resources::workflow_status))
        .route("/regions", get(topology::list_regions).post(topology::create_region))
        .route("/regions/{id}", get(topology::get_region).delete(topology::delete_region))
        .route("/clusters", get(topology::list_clusters).post(topology::create_cluster))
        .route("/clusters/{id}", get(topology::get_cluster).delete(topology::delete_cluster))
        .route("/shards", get(topology::list_shards).post(topology::create_shard))
        .route("/shards/{id}", get(topology::get_shard).delete(topology::delete_shard))
        .route("/shards/{id}/converge", post(topology::converge_shard))
        .route("/shards/{id}/desired-state", get(topology::shard_desired_state))
        .route("/shards/{id}/health", get(topology::shard_health))
        .route("/nodes", get(topology::list_nodes).post(topology::create_node))
        .route("/nodes/{id}", get(topology::get_node).delete(topology::delete_node))
        .with_state(state.clone());

    let node_routes = Router::new()
        .route("/{id}/desired-state", get(nodes::desired_state))
        .route("/{id}/health", get(nodes::get_health).post(nodes::report_health))
        .route("/{id}/drift", get(nodes::list_drift).post(nodes::report_drift))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .nest("/internal/nodes", node_routes)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use hostgrid_control::{LifecycleConfig, PlaneConfig, SettleMode};
    use hostgrid_converge::TriggerMode;
    use hostgrid_ledger::Ledger;
    use hostgrid_workflow::MemoryExecutor;

    use super::*;

    fn test_plane() -> ControlPlane {
        let config = PlaneConfig {
            lifecycle: LifecycleConfig::default()
                .with_settle_timeout(Duration::from_secs(2))
                .with_settle_mode(SettleMode::Manual),
            trigger_mode: TriggerMode::Deferred,
            ..Default::default()
        };
        ControlPlane::new(
            Ledger::open_in_memory().unwrap(),
            Arc::new(MemoryExecutor::new()),
            config,
        )
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    /// Region eu, cluster eu-1, shard web-1 with node n1.
    async fn app_with_topology() -> (Router, ControlPlane) {
        let plane = test_plane();
        let app = build_router(plane.clone());
        let (s, _) = call(&app, "POST", "/api/v1/regions", Some(json!({"id": "eu"}))).await;
        assert_eq!(s, StatusCode::CREATED);
        let (s, _) = call(
            &app,
            "POST",
            "/api/v1/clusters",
            Some(json!({"id": "eu-1", "region_id": "eu"})),
        )
        .await;
        assert_eq!(s, StatusCode::CREATED);
        let (s, _) = call(
            &app,
            "POST",
            "/api/v1/shards",
            Some(json!({"id": "web-1", "cluster_id": "eu-1", "role": "web"})),
        )
        .await;
        assert_eq!(s, StatusCode::CREATED);
        let (s, body) = call(
            &app,
            "POST",
            "/api/v1/nodes",
            Some(json!({"id": "n1", "cluster_id": "eu-1", "shard_id": "web-1"})),
        )
        .await;
        assert_eq!(s, StatusCode::CREATED);
        assert_eq!(body["data"]["roles"], json!(["web"]));
        (app, plane)
    }

    #[tokio::test]
    async fn tenant_create_is_accepted_then_active() {
        let (app, plane) = app_with_topology().await;
        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/resources/tenant",
            Some(json!({"id": "acme", "shard_id": "web-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "pending");

        plane.reconcile().await.unwrap();

        let (status, body) = call(&app, "GET", "/api/v1/resources/tenant/acme", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "active");

        let (status, body) = call(&app, "GET", "/api/v1/tenants/acme/resource-summary", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 1);
    }

    #[tokio::test]
    async fn error_categories_map_to_statuses() {
        let (app, _plane) = app_with_topology().await;
        call(
            &app,
            "POST",
            "/api/v1/resources/tenant",
            Some(json!({"id": "acme", "shard_id": "web-1"})),
        )
        .await;

        // Still pending, so an update is refused.
        let (status, body) = call(
            &app,
            "PATCH",
            "/api/v1/resources/tenant/acme",
            Some(json!({"ssh_enabled": true})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("pending"));

        let (status, _) = call(&app, "GET", "/api/v1/resources/spaceship/x", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/resources/tenant",
            Some(json!({"id": "Not Valid", "shard_id": "web-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "GET", "/api/v1/resources/tenant/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn topology_delete_and_converge() {
        let (app, _plane) = app_with_topology().await;

        let (status, _) = call(&app, "POST", "/api/v1/shards/web-1/converge", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, _) = call(&app, "POST", "/api/v1/shards/nope/converge", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "DELETE", "/api/v1/regions/eu", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, body) = call(&app, "DELETE", "/api/v1/nodes/n1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(body, Value::Null);
        let (status, _) = call(&app, "GET", "/api/v1/nodes/n1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn node_health_is_bare_json() {
        let (app, _plane) = app_with_topology().await;

        let (status, _) = call(&app, "GET", "/internal/nodes/n1/health", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            "POST",
            "/internal/nodes/n1/health",
            Some(json!({"node_id": "spoofed", "status": "healthy", "reported_at": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_id"], "n1");

        let (status, body) = call(&app, "GET", "/internal/nodes/n1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert!(body.get("success").is_none());

        let (status, body) = call(&app, "GET", "/internal/nodes/n1/desired-state", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_id"], "n1");
        assert_eq!(body["shard"]["id"], "web-1");
    }

    #[tokio::test]
    async fn drift_listing_is_capped_at_one_hundred() {
        let (app, _plane) = app_with_topology().await;
        let events: Vec<Value> = (0..150)
            .map(|i| json!({"kind": "webroot", "resource": format!("r{i}"), "action": "modified"}))
            .collect();
        let (status, _) = call(
            &app,
            "POST",
            "/internal/nodes/n1/drift",
            Some(json!({ "events": events })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, "GET", "/internal/nodes/n1/drift", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"].as_array().unwrap().len(), 100);
        assert_eq!(body["has_more"], false);
        assert_eq!(body["items"][0]["resource"], "r149");

        let (status, _) = call(&app, "GET", "/internal/nodes/ghost/drift", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn retry_failed_reports_counts() {
        let (app, plane) = app_with_topology().await;
        call(
            &app,
            "POST",
            "/api/v1/resources/tenant",
            Some(json!({"id": "acme", "shard_id": "web-1"})),
        )
        .await;
        plane.reconcile().await.unwrap();

        let (status, body) = call(&app, "POST", "/api/v1/tenants/acme/retry-failed", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["retried"], 0);
        assert_eq!(body["data"]["errors"], json!([]));
    }
}
