use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tracing::debug;

use netrunner_network::error::Error as NetworkError;

use crate::service::{ControlError, ControlService};
use crate::stream::status_stream;
use crate::types::*;

type Rejection = (StatusCode, Json<ErrorResponse>);

/// Every RPC is `POST /v1/<service>/<method>` with a JSON body; the same
/// router serves the primary port and the HTTP gateway mirror.
pub fn create_router(service: Arc<ControlService>) -> Router {
    Router::new()
        .route("/v1/ping", post(ping))
        // Cluster lifecycle
        .route("/v1/control/rpcversion", post(rpc_version))
        .route("/v1/control/start", post(start))
        .route("/v1/control/stop", post(stop))
        .route("/v1/control/health", post(health))
        .route("/v1/control/waitforhealthy", post(wait_for_healthy))
        .route("/v1/control/uris", post(uris))
        .route("/v1/control/status", post(status))
        .route("/v1/control/streamstatus", post(stream_status))
        // Node membership
        .route("/v1/control/addnode", post(add_node))
        .route("/v1/control/removenode", post(remove_node))
        .route("/v1/control/restartnode", post(restart_node))
        .route("/v1/control/pausenode", post(pause_node))
        .route("/v1/control/resumenode", post(resume_node))
        // Provisioning
        .route("/v1/control/createsubnets", post(create_subnets))
        .route("/v1/control/createblockchains", post(create_blockchains))
        .route(
            "/v1/control/transformelasticsubnets",
            post(transform_elastic_subnets),
        )
        .route(
            "/v1/control/addpermissionlessvalidator",
            post(add_permissionless_validator),
        )
        .route(
            "/v1/control/removesubnetvalidator",
            post(remove_subnet_validator),
        )
        // Test peers
        .route("/v1/control/attachpeer", post(attach_peer))
        .route("/v1/control/sendoutboundmessage", post(send_outbound_message))
        // Snapshots
        .route("/v1/control/savesnapshot", post(save_snapshot))
        .route("/v1/control/loadsnapshot", post(load_snapshot))
        .route("/v1/control/removesnapshot", post(remove_snapshot))
        .route("/v1/control/getsnapshotnames", post(get_snapshot_names))
        .with_state(service)
}

fn reject(err: ControlError) -> Rejection {
    let (status, code) = match &err {
        ControlError::Precondition(_) => (StatusCode::PRECONDITION_FAILED, "failed-precondition"),
        ControlError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        ControlError::Network(net) => match net {
            NetworkError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid-argument"),
            NetworkError::Resource(_) => (StatusCode::BAD_REQUEST, "resource-exhausted"),
            NetworkError::NodeNotFound(_) | NetworkError::SnapshotNotFound(_) => {
                (StatusCode::NOT_FOUND, "not-found")
            }
            NetworkError::NodeAlreadyExists(_) | NetworkError::SnapshotAlreadyExists(_) => {
                (StatusCode::CONFLICT, "already-exists")
            }
            NetworkError::Aborted => (StatusCode::CONFLICT, "aborted"),
            NetworkError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "deadline-exceeded"),
            NetworkError::Process(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            NetworkError::Upstream(_) | NetworkError::Io { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        },
    };
    debug!("rejecting request: code = {}, error = {}", code, err);
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: code.to_string(),
        }),
    )
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn ping(State(service): State<Arc<ControlService>>) -> Json<PingResponse> {
    Json(service.ping())
}

async fn rpc_version(State(service): State<Arc<ControlService>>) -> Json<RpcVersionResponse> {
    Json(service.rpc_version())
}

async fn start(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<StartRequest>,
) -> Result<Json<ClusterInfoResponse>, Rejection> {
    service.start(req).await.map(Json).map_err(reject)
}

async fn stop(
    State(service): State<Arc<ControlService>>,
) -> Result<Json<ClusterInfoResponse>, Rejection> {
    service.stop().await.map(Json).map_err(reject)
}

async fn health(
    State(service): State<Arc<ControlService>>,
) -> Result<Json<ClusterInfoResponse>, Rejection> {
    service.health().await.map(Json).map_err(reject)
}

async fn wait_for_healthy(
    State(service): State<Arc<ControlService>>,
) -> Result<Json<ClusterInfoResponse>, Rejection> {
    service.wait_for_healthy().await.map(Json).map_err(reject)
}

async fn uris(State(service): State<Arc<ControlService>>) -> Json<UrisResponse> {
    Json(service.uris())
}

async fn status(State(service): State<Arc<ControlService>>) -> Json<ClusterInfoResponse> {
    Json(service.status())
}

async fn stream_status(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<StreamStatusRequest>,
) -> Response {
    let rx = service.subscribe();
    let body = status_stream(rx, Duration::from_nanos(req.push_interval_ns));
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    )
        .into_response()
}

async fn add_node(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<AddNodeRequest>,
) -> Result<Json<ClusterInfoResponse>, Rejection> {
    service.add_node(req).await.map(Json).map_err(reject)
}

async fn remove_node(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<NodeNameRequest>,
) -> Result<Json<ClusterInfoResponse>, Rejection> {
    service.remove_node(req).await.map(Json).map_err(reject)
}

async fn restart_node(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<RestartNodeRequest>,
) -> Result<Json<ClusterInfoResponse>, Rejection> {
    service.restart_node(req).await.map(Json).map_err(reject)
}

async fn pause_node(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<NodeNameRequest>,
) -> Result<Json<ClusterInfoResponse>, Rejection> {
    service.pause_node(req).await.map(Json).map_err(reject)
}

async fn resume_node(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<NodeNameRequest>,
) -> Result<Json<ClusterInfoResponse>, Rejection> {
    service.resume_node(req).await.map(Json).map_err(reject)
}

async fn create_subnets(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<CreateSubnetsRequest>,
) -> Result<Json<CreateSubnetsResponse>, Rejection> {
    service.create_subnets(req).await.map(Json).map_err(reject)
}

async fn create_blockchains(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<CreateBlockchainsRequest>,
) -> Result<Json<CreateBlockchainsResponse>, Rejection> {
    service
        .create_blockchains(req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn transform_elastic_subnets(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<TransformElasticSubnetsRequest>,
) -> Result<Json<TransformElasticSubnetsResponse>, Rejection> {
    service
        .transform_elastic_subnets(req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn add_permissionless_validator(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<AddPermissionlessValidatorRequest>,
) -> Result<Json<ClusterInfoResponse>, Rejection> {
    service
        .add_permissionless_validator(req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn remove_subnet_validator(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<RemoveSubnetValidatorRequest>,
) -> Result<Json<ClusterInfoResponse>, Rejection> {
    service
        .remove_subnet_validator(req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn attach_peer(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<AttachPeerRequest>,
) -> Result<Json<AttachPeerResponse>, Rejection> {
    service.attach_peer(req).await.map(Json).map_err(reject)
}

async fn send_outbound_message(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<SendOutboundMessageRequest>,
) -> Result<Json<SendOutboundMessageResponse>, Rejection> {
    service
        .send_outbound_message(req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn save_snapshot(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<SnapshotNameRequest>,
) -> Result<Json<ClusterInfoResponse>, Rejection> {
    service.save_snapshot(req).await.map(Json).map_err(reject)
}

async fn load_snapshot(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<LoadSnapshotRequest>,
) -> Result<Json<ClusterInfoResponse>, Rejection> {
    service.load_snapshot(req).await.map(Json).map_err(reject)
}

async fn remove_snapshot(
    State(service): State<Arc<ControlService>>,
    Json(req): Json<SnapshotNameRequest>,
) -> Result<Json<serde_json::Value>, Rejection> {
    service
        .remove_snapshot(req)
        .await
        .map(|()| Json(serde_json::json!({ "success": true })))
        .map_err(reject)
}

async fn get_snapshot_names(
    State(service): State<Arc<ControlService>>,
) -> Result<Json<GetSnapshotNamesResponse>, Rejection> {
    service.snapshot_names().map(Json).map_err(reject)
}
