use std::sync::Arc;

use apikit::reject::HTTPError;

use axum::extract::{Extension, Path};
use axum::Json;

use mifs_auth::ClientIdentity;

use protocol::files::FileMetadata;

use crate::node::FileNode;
use crate::server::handlers::file_error;

/// Leaves a tombstone. Fails with 409 while the file still has contents.
#[tracing::instrument(skip(node))]
pub async fn delete(
    identity: ClientIdentity,
    Extension(node): Extension<Arc<FileNode>>,
    Path(file_id): Path<String>,
) -> Result<Json<FileMetadata>, HTTPError> {
    let tombstone = node
        .files()
        .delete_file_metadata(&identity.common_name, &file_id)
        .await
        .map_err(file_error)?;
    Ok(Json(tombstone))
}
