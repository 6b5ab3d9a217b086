//! HTTP surface for gateway changes and deletions.
//!
//! Handlers only mutate registry state and return; every broadcast they
//! cause is detached, so transport failures never reach the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, post};
use axum::{Json, Router};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::deletion::DeletionCoordinator;
use crate::error::{Error, ErrorKind, Result};
use crate::gateway::{GatewayManager, PromoteOutcome};
use crate::types::{ExtClient, InetNodeReq, Node, NodeId};

#[derive(Clone)]
pub struct ApiState {
    pub gateways: Arc<GatewayManager>,
    pub deletion: Arc<DeletionCoordinator>,
}

/// Body of error responses and of requests that succeed without a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub code: u16,
    pub message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Internal | ErrorKind::Transport => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("request failed: {}", self);
        }
        let body = ApiMessage {
            code: status.as_u16(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/api/nodes/{network}/{nodeid}/inet_gw",
            post(create_internet_gw)
                .put(update_internet_gw)
                .delete(delete_internet_gw),
        )
        .route("/api/nodes/{network}/{nodeid}", delete(delete_node))
        .route("/api/extclients/{network}/{clientid}", delete(delete_ext_client))
        .with_state(state)
}

pub async fn serve(bind: SocketAddr, state: ApiState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("API listening on {}", bind);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn user(headers: &HeaderMap) -> &str {
    headers
        .get("user")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
}

fn already_gateway() -> Response {
    Json(ApiMessage {
        code: StatusCode::OK.as_u16(),
        message: "node is already acting as internet gateway".into(),
    })
    .into_response()
}

fn parse_request(body: &Bytes) -> Result<InetNodeReq> {
    serde_json::from_slice(body).map_err(|e| Error::bad_request(e.to_string()))
}

async fn create_internet_gw(
    State(state): State<ApiState>,
    Path((network, node_id)): Path<(String, NodeId)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let node = state.gateways.node(&network, node_id).await?;
    if node.is_internet_gateway {
        return Ok(already_gateway());
    }
    let req = parse_request(&body)?;

    match state.gateways.promote(&network, node_id, req).await? {
        PromoteOutcome::AlreadyGateway(_) => Ok(already_gateway()),
        PromoteOutcome::Promoted(node) => {
            info!(
                "{} created internet gateway on node {} in network {}",
                user(&headers),
                node_id,
                network
            );
            Ok(Json(node).into_response())
        }
    }
}

async fn update_internet_gw(
    State(state): State<ApiState>,
    Path((network, node_id)): Path<(String, NodeId)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Node>> {
    let req = parse_request(&body)?;
    let node = state.gateways.update(&network, node_id, req).await?;
    info!(
        "{} updated internet gateway on node {} in network {}",
        user(&headers),
        node_id,
        network
    );
    Ok(Json(node))
}

async fn delete_internet_gw(
    State(state): State<ApiState>,
    Path((network, node_id)): Path<(String, NodeId)>,
    headers: HeaderMap,
) -> Result<Json<Node>> {
    let node = state.gateways.demote(&network, node_id).await?;
    info!(
        "{} removed internet gateway on node {} in network {}",
        user(&headers),
        node_id,
        network
    );
    Ok(Json(node))
}

async fn delete_node(
    State(state): State<ApiState>,
    Path((network, node_id)): Path<(String, NodeId)>,
    headers: HeaderMap,
) -> Result<Json<Node>> {
    let node = state.deletion.delete_node(&network, node_id).await?;
    info!("{} deleted node {} in network {}", user(&headers), node_id, network);
    Ok(Json(node))
}

async fn delete_ext_client(
    State(state): State<ApiState>,
    Path((network, client_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<ExtClient>> {
    let client = state.deletion.delete_ext_client(&network, &client_id).await?;
    info!(
        "{} deleted ext client {} in network {}",
        user(&headers),
        client_id,
        network
    );
    Ok(Json(client))
}
