use std::sync::Arc;

use apikit::reject::HTTPError;

use axum::extract::Extension;
use axum::response::Response;
use axum::Json;

use mifs_auth::ClientIdentity;

use protocol::files::{PermissionAction, PermissionRequest};

use crate::node::{FileNode, Operation};

use super::file_error;

/// Grants or revokes one operation. The caller needs `admin` on the object.
#[tracing::instrument(skip(node))]
pub async fn update(
    identity: ClientIdentity,
    Extension(node): Extension<Arc<FileNode>>,
    Json(request): Json<PermissionRequest>,
) -> Result<Response, HTTPError> {
    let op: Operation = request.operation.parse().map_err(HTTPError::bad_request)?;

    let files = node.files();
    let user = &identity.common_name;
    match request.action {
        PermissionAction::Grant => files
            .grant(user, &request.subject, op, &request.object)
            .await
            .map_err(file_error)?,
        PermissionAction::Revoke => files
            .revoke(user, &request.subject, op, &request.object)
            .await
            .map_err(file_error)?,
    }

    Ok(apikit::reply::message(format!(
        "{:?} {} on '{}' for '{}'",
        request.action, op, request.object, request.subject
    )))
}
