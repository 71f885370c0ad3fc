//! The API file servers call. Callers are identified by their client certificate.
use std::sync::Arc;

use apikit::reject::HTTPError;

use axum::extract::Extension;
use axum::response::Response;
use axum::Json;

use mifs_auth::ClientIdentity;

use protocol::fileserver::{RegisterResponse, ServerInfo, StatusRequest, SyncErrorsResponse};

use crate::node::IndexNode;
use crate::server::session::Session;

use super::registrar_error;

#[tracing::instrument(skip(node, info))]
pub async fn register(
    identity: ClientIdentity,
    Extension(node): Extension<Arc<IndexNode>>,
    Json(info): Json<ServerInfo>,
) -> Result<Json<RegisterResponse>, HTTPError> {
    let (result, server) = node
        .registrar()
        .register_server(&identity.common_name, &info)
        .map_err(|e| registrar_error(&e))?;

    Ok(Json(RegisterResponse {
        result,
        server_id: Some(server.id),
    }))
}

/// Records a liveness announce. A server coming back healthy gets its workers kicked.
#[tracing::instrument(skip(node, status), fields(server = %status.server_id, healthy = status.healthy))]
pub async fn status(
    identity: ClientIdentity,
    Extension(node): Extension<Arc<IndexNode>>,
    Json(status): Json<StatusRequest>,
) -> Result<Response, HTTPError> {
    let recovered = node
        .registrar()
        .record_status(&identity.common_name, &status)
        .map_err(|e| registrar_error(&e))?;

    if recovered {
        tracing::info!("file server is healthy, kicking its workers");
        node.sync().kick_server(&status.server_id);
    }

    Ok(apikit::reply::message("status recorded"))
}

pub async fn sync_errors(
    session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
) -> Result<Json<SyncErrorsResponse>, HTTPError> {
    session.require_admin(&node)?;
    Ok(Json(SyncErrorsResponse {
        errors: node.sync().errors().entries(),
    }))
}
