use std::sync::Arc;

use apikit::reject::HTTPError;

use axum::body::Bytes;
use axum::extract::{Extension, Path};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::Json;

use mifs_auth::ClientIdentity;

use protocol::files::FileMetadata;

use crate::node::FileNode;

use super::file_error;

const OCTET_STREAM: &str = "application/octet-stream";

#[tracing::instrument(skip(node))]
pub async fn get(
    identity: ClientIdentity,
    Extension(node): Extension<Arc<FileNode>>,
    Path(file_id): Path<String>,
) -> Result<Response, HTTPError> {
    let data = node
        .files()
        .get_file_contents(&identity.common_name, &file_id)
        .await
        .map_err(file_error)?;

    Ok(([(CONTENT_TYPE, OCTET_STREAM)], data).into_response())
}

/// Replaces the whole contents. The metadata size and content id follow.
#[tracing::instrument(skip(node, body), fields(size = body.len()))]
pub async fn put(
    identity: ClientIdentity,
    Extension(node): Extension<Arc<FileNode>>,
    Path(file_id): Path<String>,
    body: Bytes,
) -> Result<Json<FileMetadata>, HTTPError> {
    let meta = node
        .files()
        .update_file_contents(&identity.common_name, &file_id, body)
        .await
        .map_err(file_error)?;
    Ok(Json(meta))
}

#[tracing::instrument(skip(node))]
pub async fn delete(
    identity: ClientIdentity,
    Extension(node): Extension<Arc<FileNode>>,
    Path(file_id): Path<String>,
) -> Result<Json<FileMetadata>, HTTPError> {
    let meta = node
        .files()
        .delete_file_contents(&identity.common_name, &file_id)
        .await
        .map_err(file_error)?;
    Ok(Json(meta))
}
