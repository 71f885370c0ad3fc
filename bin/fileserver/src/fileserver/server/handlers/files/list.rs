use std::sync::Arc;

use apikit::reject::HTTPError;

use axum::extract::{Extension, Query};
use axum::Json;

use mifs_auth::ClientIdentity;

use protocol::files::{ListFilesQuery, ListFilesResponse};

use crate::node::FileNode;
use crate::server::handlers::file_error;

#[tracing::instrument(skip(node))]
pub async fn list(
    identity: ClientIdentity,
    Query(query): Query<ListFilesQuery>,
    Extension(node): Extension<Arc<FileNode>>,
) -> Result<Json<ListFilesResponse>, HTTPError> {
    let files = node
        .files()
        .list_file_metadata(&identity.common_name, query.updated_after)
        .await
        .map_err(file_error)?;

    Ok(Json(ListFilesResponse { files }))
}
