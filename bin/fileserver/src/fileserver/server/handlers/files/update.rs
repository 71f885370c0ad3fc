use std::sync::Arc;

use apikit::reject::HTTPError;

use axum::extract::{Extension, Path};
use axum::Json;

use mifs_auth::ClientIdentity;

use protocol::files::{FileMetadata, FileMetadataRequest};

use crate::node::FileNode;
use crate::server::handlers::file_error;

#[tracing::instrument(skip(node, request))]
pub async fn update(
    identity: ClientIdentity,
    Extension(node): Extension<Arc<FileNode>>,
    Path(file_id): Path<String>,
    Json(request): Json<FileMetadataRequest>,
) -> Result<Json<FileMetadata>, HTTPError> {
    let meta = node
        .files()
        .update_file_metadata(&identity.common_name, &file_id, request.into())
        .await
        .map_err(file_error)?;
    Ok(Json(meta))
}
