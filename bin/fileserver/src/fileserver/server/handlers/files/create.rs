use std::sync::Arc;

use apikit::reject::HTTPError;

use axum::extract::Extension;
use axum::response::Response;
use axum::Json;

use mifs_auth::ClientIdentity;

use protocol::files::FileMetadataRequest;

use crate::node::FileNode;
use crate::server::handlers::file_error;

#[tracing::instrument(skip(node, request))]
pub async fn create(
    identity: ClientIdentity,
    Extension(node): Extension<Arc<FileNode>>,
    Json(request): Json<FileMetadataRequest>,
) -> Result<Response, HTTPError> {
    if request.name.is_empty() {
        return Err(HTTPError::bad_request("missing file name"));
    }

    let meta = node
        .files()
        .create_file_metadata(&identity.common_name, request.into())
        .await
        .map_err(file_error)?;

    Ok(apikit::reply::created(meta))
}
