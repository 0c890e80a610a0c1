use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::facade::ServiceApi;

/// Read-only operational surface: health, connection status, scan job
/// status. NOT the RPC transport (out of scope, see SPEC_FULL.md §6.1);
/// this is the ambient observability the teacher's own `api/rest.rs`
/// provided, repurposed from OPC UA browse/discover endpoints.
pub fn router(api: Arc<ServiceApi>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/connections", get(list_connections))
        .route("/jobs", get(list_jobs))
        .with_state(api)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn healthz() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn list_connections(State(api): State<Arc<ServiceApi>>) -> Json<serde_json::Value> {
    match api.list_connections().await {
        Ok(conns) => Json(serde_json::json!({ "connections": conns })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

async fn list_jobs(State(api): State<Arc<ServiceApi>>) -> Json<serde_json::Value> {
    match api.list_scan_jobs(None).await {
        Ok(jobs) => Json(serde_json::json!({ "jobs": jobs })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}
