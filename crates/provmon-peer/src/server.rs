//! HTTP face of the peer RPC.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/peer/info` | This monitor's `PeerInfo` |
//! | POST | `/peer/info` | A peer announces updated info |
//! | POST | `/peer/backup` | Back up the caller's deployments |
//! | POST | `/peer/backup/remove` | Stop backing up the caller |
//! | GET | `/peer/deployments` | All records held here |
//! | GET | `/peer/deployments/{name}` | One record |
//! | POST | `/peer/deployments/{name}/demote` | Caller won a conflict |
//! | POST | `/peer/events` | Deliver a deployment event |
//! | GET | `/peer/ping` | Liveness |
//!
//! The daemon nests this router under `/api/v1`.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};

use provmon_state::PeerInfo;

use crate::coordinator::PeerCoordinator;
use crate::error::PeerError;
use crate::event::DeploymentEvent;
use crate::rpc::PeerRpc;

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Map a peer error to its HTTP status.
pub fn peer_error_response(err: &PeerError) -> Response {
    let status = match err {
        PeerError::UnknownDeployment(_) | PeerError::UnknownInstance { .. } => StatusCode::NOT_FOUND,
        PeerError::AlreadyDeployed(_) | PeerError::NotActive(_) => StatusCode::CONFLICT,
        PeerError::IncompatibleVersion { .. } | PeerError::State(_) | PeerError::Codec(_) => {
            StatusCode::BAD_REQUEST
        }
        PeerError::Unreachable { .. } | PeerError::Rpc { .. } => StatusCode::BAD_GATEWAY,
    };
    error_response(&err.to_string(), status)
}

type Shared = State<Arc<PeerCoordinator>>;

pub fn peer_routes(coordinator: Arc<PeerCoordinator>) -> Router {
    Router::new()
        .route("/peer/info", get(get_info).post(update_info))
        .route("/peer/backup", post(assign_backup))
        .route("/peer/backup/remove", post(remove_backup))
        .route("/peer/deployments", get(list_deployments))
        .route("/peer/deployments/{name}", get(get_deployment))
        .route("/peer/deployments/{name}/demote", post(demote))
        .route("/peer/events", post(deliver_event))
        .route("/peer/ping", get(ping))
        .with_state(coordinator)
}

/// GET /peer/info
async fn get_info(State(coord): Shared) -> Response {
    ApiResponse::ok(coord.info()).into_response()
}

/// POST /peer/info
async fn update_info(State(coord): Shared, Json(info): Json<PeerInfo>) -> Response {
    match coord.update_peer_info(info).await {
        Ok(()) => ApiResponse::ok("updated").into_response(),
        Err(e) => peer_error_response(&e),
    }
}

/// POST /peer/backup
async fn assign_backup(State(coord): Shared, Json(primary): Json<PeerInfo>) -> Response {
    match coord.assign_backup_for(primary).await {
        Ok(()) => ApiResponse::ok("assigned").into_response(),
        Err(e) => peer_error_response(&e),
    }
}

/// POST /peer/backup/remove
async fn remove_backup(State(coord): Shared, Json(primary): Json<PeerInfo>) -> Response {
    match coord.remove_backup_for(primary).await {
        Ok(()) => ApiResponse::ok("removed").into_response(),
        Err(e) => peer_error_response(&e),
    }
}

/// GET /peer/deployments
async fn list_deployments(State(coord): Shared) -> Response {
    ApiResponse::ok(coord.deployments()).into_response()
}

/// GET /peer/deployments/{name}
///
/// A missing record is `data: null`, not a 404; the caller treats both the
/// same.
async fn get_deployment(State(coord): Shared, Path(name): Path<String>) -> Response {
    ApiResponse::ok(coord.deployment(&name)).into_response()
}

/// POST /peer/deployments/{name}/demote
async fn demote(
    State(coord): Shared,
    Path(name): Path<String>,
    Json(winner): Json<PeerInfo>,
) -> Response {
    match PeerRpc::demote(coord.as_ref(), &name, winner).await {
        Ok(()) => ApiResponse::ok("demoted").into_response(),
        Err(e) => peer_error_response(&e),
    }
}

/// POST /peer/events
async fn deliver_event(State(coord): Shared, Json(event): Json<DeploymentEvent>) -> Response {
    coord.apply_event(event).await;
    ApiResponse::ok("applied").into_response()
}

/// GET /peer/ping
async fn ping() -> Response {
    ApiResponse::ok("pong").into_response()
}
