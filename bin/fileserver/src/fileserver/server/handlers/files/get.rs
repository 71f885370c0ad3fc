use std::sync::Arc;

use apikit::reject::HTTPError;

use axum::extract::{Extension, Path};
use axum::Json;

use mifs_auth::ClientIdentity;

use protocol::files::FileMetadata;

use crate::node::FileNode;
use crate::server::handlers::file_error;

#[tracing::instrument(skip(node))]
pub async fn get(
    identity: ClientIdentity,
    Extension(node): Extension<Arc<FileNode>>,
    Path(file_id): Path<String>,
) -> Result<Json<FileMetadata>, HTTPError> {
    let meta = node
        .files()
        .get_file_metadata(&identity.common_name, &file_id)
        .await
        .map_err(file_error)?;
    Ok(Json(meta))
}
