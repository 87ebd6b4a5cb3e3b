//! REST API for lease authorities and operators.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/leases` | Registered instantiators |
//! | POST | `/api/v1/leases` | Lease granted |
//! | PUT | `/api/v1/leases/{id}` | Lease renewed |
//! | DELETE | `/api/v1/leases/{id}` | Lease cancelled |
//! | POST | `/api/v1/leases/{id}/expire` | Lease expired |
//! | GET | `/api/v1/deployments` | All deployment records |
//! | POST | `/api/v1/deployments` | Deploy |
//! | GET | `/api/v1/deployments/{name}` | One record |
//! | PUT | `/api/v1/deployments/{name}` | Replace the desired state |
//! | DELETE | `/api/v1/deployments/{name}` | Undeploy |
//! | POST | `/api/v1/deployments/{name}/elements` | Add an element |
//! | PUT | `/api/v1/deployments/{name}/elements/{element}` | Update an element |
//! | DELETE | `/api/v1/deployments/{name}/elements/{element}` | Remove an element |
//! | POST | `/api/v1/deployments/{name}/instances/{instance}` | Instance status report |
//! | POST | `/api/v1/deployments/{name}/redeploy` | Schedule a redeploy |
//! | GET | `/api/v1/status` | Monitor overview |
//!
//! Peer RPC routes from `provmon_peer::peer_routes` are mounted alongside.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use serde::Deserialize;

use provmon_core::parse_duration;
use provmon_peer::{ApiResponse, PeerCoordinator, error_response, peer_error_response, peer_routes};
use provmon_placement::{LeaseListener, ResourceRegistry};
use provmon_state::{DeploymentRecord, InstanceStatus, InstantiatorResource, ServiceElement};

use crate::provisioner::Provisioner;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<ResourceRegistry>,
    pub peers: Arc<PeerCoordinator>,
    pub provisioner: Arc<Provisioner>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/leases", get(list_leases).post(register_lease))
        .route("/leases/{id}", put(renew_lease).delete(remove_lease))
        .route("/leases/{id}/expire", post(expire_lease))
        .route("/deployments", get(list_deployments).post(deploy))
        .route(
            "/deployments/{name}",
            get(get_deployment).put(update_deployment).delete(undeploy),
        )
        .route("/deployments/{name}/elements", post(add_element))
        .route(
            "/deployments/{name}/elements/{element}",
            put(update_element).delete(remove_element),
        )
        .route("/deployments/{name}/instances/{instance}", post(report_instance))
        .route("/deployments/{name}/redeploy", post(redeploy))
        .route("/status", get(status))
        .with_state(state.clone())
        .merge(peer_routes(state.peers));

    Router::new().nest("/api/v1", api_routes)
}

// ── Leases ─────────────────────────────────────────────────────

/// GET /api/v1/leases
async fn list_leases(State(state): State<ApiState>) -> Response {
    let resources: Vec<InstantiatorResource> =
        state.registry.snapshot().iter().map(|h| h.snapshot()).collect();
    ApiResponse::ok(resources).into_response()
}

/// POST /api/v1/leases
async fn register_lease(
    State(state): State<ApiState>,
    Json(resource): Json<InstantiatorResource>,
) -> Response {
    if resource.id.is_empty() {
        return error_response("resource id must not be empty", StatusCode::BAD_REQUEST);
    }
    let id = resource.id.clone();
    state.registry.register(resource);
    match state.registry.get(&id) {
        Some(handle) => (StatusCode::CREATED, ApiResponse::ok(handle.snapshot())).into_response(),
        None => error_response("lease ended during registration", StatusCode::CONFLICT),
    }
}

/// PUT /api/v1/leases/{id}
async fn renew_lease(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(resource): Json<InstantiatorResource>,
) -> Response {
    if resource.id != id {
        return error_response("resource id does not match path", StatusCode::BAD_REQUEST);
    }
    state.registry.renewed(resource);
    match state.registry.get(&id) {
        Some(handle) => ApiResponse::ok(handle.snapshot()).into_response(),
        None => error_response("lease ended during renewal", StatusCode::CONFLICT),
    }
}

/// DELETE /api/v1/leases/{id}
async fn remove_lease(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    if state.registry.get(&id).is_none() {
        return error_response("resource not found", StatusCode::NOT_FOUND);
    }
    state.registry.removed(&id);
    ApiResponse::ok("removed").into_response()
}

/// POST /api/v1/leases/{id}/expire
async fn expire_lease(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    if state.registry.get(&id).is_none() {
        return error_response("resource not found", StatusCode::NOT_FOUND);
    }
    state.registry.expired(&id);
    ApiResponse::ok("expired").into_response()
}

// ── Deployments ────────────────────────────────────────────────

/// GET /api/v1/deployments
async fn list_deployments(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.peers.deployments()).into_response()
}

/// POST /api/v1/deployments
async fn deploy(State(state): State<ApiState>, Json(record): Json<DeploymentRecord>) -> Response {
    let name = record.name.clone();
    if let Err(e) = state.peers.deploy(record) {
        return peer_error_response(&e);
    }
    let placed = state.provisioner.provision(&name).await;
    match state.peers.deployment(&name) {
        Some(record) => (
            StatusCode::CREATED,
            ApiResponse::ok(serde_json::json!({ "deployment": record, "placed": placed })),
        )
            .into_response(),
        None => error_response("deployment vanished", StatusCode::CONFLICT),
    }
}

/// GET /api/v1/deployments/{name}
async fn get_deployment(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.peers.deployment(&name) {
        Some(record) => ApiResponse::ok(record).into_response(),
        None => error_response("deployment not found", StatusCode::NOT_FOUND),
    }
}

/// PUT /api/v1/deployments/{name}
async fn update_deployment(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(record): Json<DeploymentRecord>,
) -> Response {
    if record.name != name {
        return error_response("deployment name does not match path", StatusCode::BAD_REQUEST);
    }
    if let Err(e) = state.peers.update_deployment(record) {
        return peer_error_response(&e);
    }
    state.provisioner.provision(&name).await;
    ApiResponse::ok(state.peers.deployment(&name)).into_response()
}

/// DELETE /api/v1/deployments/{name}
async fn undeploy(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    state.provisioner.withdraw(&name);
    match state.peers.undeploy(&name) {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => peer_error_response(&e),
    }
}

// ── Elements ───────────────────────────────────────────────────

/// POST /api/v1/deployments/{name}/elements
async fn add_element(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(element): Json<ServiceElement>,
) -> Response {
    if let Err(e) = state.peers.add_element(&name, element) {
        return peer_error_response(&e);
    }
    let placed = state.provisioner.provision(&name).await;
    (StatusCode::CREATED, ApiResponse::ok(serde_json::json!({ "placed": placed }))).into_response()
}

/// PUT /api/v1/deployments/{name}/elements/{element}
async fn update_element(
    State(state): State<ApiState>,
    Path((name, element_name)): Path<(String, String)>,
    Json(element): Json<ServiceElement>,
) -> Response {
    if element.name != element_name {
        return error_response("element name does not match path", StatusCode::BAD_REQUEST);
    }
    match state.peers.update_element(&name, element) {
        Ok(true) => {
            state.provisioner.provision(&name).await;
            ApiResponse::ok("updated").into_response()
        }
        Ok(false) => error_response("element not found", StatusCode::NOT_FOUND),
        Err(e) => peer_error_response(&e),
    }
}

/// DELETE /api/v1/deployments/{name}/elements/{element}
async fn remove_element(
    State(state): State<ApiState>,
    Path((name, element)): Path<(String, String)>,
) -> Response {
    match state.peers.remove_element(&name, &element) {
        Ok(true) => ApiResponse::ok("removed").into_response(),
        Ok(false) => error_response("element not found", StatusCode::NOT_FOUND),
        Err(e) => peer_error_response(&e),
    }
}

// ── Instances ──────────────────────────────────────────────────

/// Instance status report body.
#[derive(Deserialize)]
pub struct InstanceReport {
    pub status: InstanceStatus,
}

/// POST /api/v1/deployments/{name}/instances/{instance}
async fn report_instance(
    State(state): State<ApiState>,
    Path((name, instance)): Path<(String, String)>,
    Json(report): Json<InstanceReport>,
) -> Response {
    match state
        .provisioner
        .instance_status(&name, &instance, report.status)
        .await
    {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => peer_error_response(&e),
    }
}

// ── Redeploy ───────────────────────────────────────────────────

/// Redeploy request body. Without a delay the configured default is used.
#[derive(Deserialize, Default)]
#[serde(default)]
pub struct RedeployRequest {
    pub delay: Option<String>,
}

/// POST /api/v1/deployments/{name}/redeploy
async fn redeploy(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<RedeployRequest>,
) -> Response {
    let delay: Option<Duration> = match req.delay.as_deref().map(parse_duration) {
        None => None,
        Some(Some(delay)) => Some(delay),
        Some(None) => return error_response("invalid delay", StatusCode::BAD_REQUEST),
    };
    match state.peers.request_redeploy(&name, delay) {
        Ok(()) => ApiResponse::ok("scheduled").into_response(),
        Err(e) => peer_error_response(&e),
    }
}

// ── Status ─────────────────────────────────────────────────────

/// GET /api/v1/status
async fn status(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(serde_json::json!({
        "monitor": state.peers.info(),
        "peers": state.peers.peers(),
        "backups": state.peers.backups(),
        "backup_count": state.peers.backup_count(),
        "strategy": state.registry.strategy_name(),
        "resources": state.registry.len(),
        "pending": state.provisioner.placement().pending_len(),
    }))
    .into_response()
}
