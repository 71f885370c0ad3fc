use std::sync::Arc;

use apikit::reject::HTTPError;

use axum::extract::{Extension, Path, Query};
use axum::response::Response;
use axum::Json;

use protocol::index::mappings::{
    ListMappingsQuery, ListMappingsResponse, Mapping, NewMappingRequest, UpdateMappingRequest,
};

use crate::node::model::MappingQuery;
use crate::node::IndexNode;
use crate::server::session::Session;

use super::node_error;

/// Lists the caller's mappings. `force_update` catches up with every linked server first.
#[tracing::instrument(skip(session, node), fields(user = %session.user.name))]
pub async fn list(
    session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
    Query(query): Query<ListMappingsQuery>,
) -> Result<Json<ListMappingsResponse>, HTTPError> {
    if query.force_update {
        node.sync()
            .sync_once(&session.user.id)
            .await
            .map_err(node_error)?;
    }

    let mappings = node
        .mappings()
        .list(&session.user.id, &MappingQuery::from(query))
        .map_err(node_error)?;

    Ok(Json(ListMappingsResponse {
        mappings: mappings.into_iter().map(Mapping::from).collect(),
    }))
}

#[tracing::instrument(skip(session, node, request), fields(user = %session.user.name))]
pub async fn create(
    session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
    Json(request): Json<NewMappingRequest>,
) -> Result<Json<Mapping>, HTTPError> {
    let mapping = node
        .mappings()
        .add(&session.user.id, request)
        .map_err(node_error)?;
    Ok(Json(mapping.into()))
}

pub async fn get(
    session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
    Path(id): Path<String>,
) -> Result<Json<Mapping>, HTTPError> {
    let mapping = node
        .mappings()
        .get(&session.user.id, &id)
        .map_err(node_error)?;
    Ok(Json(mapping.into()))
}

#[tracing::instrument(skip(session, node, request), fields(user = %session.user.name))]
pub async fn update(
    session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateMappingRequest>,
) -> Result<Json<Mapping>, HTTPError> {
    let mapping = node
        .mappings()
        .update(&session.user.id, &id, request)
        .map_err(node_error)?;
    Ok(Json(mapping.into()))
}

#[tracing::instrument(skip(session, node), fields(user = %session.user.name))]
pub async fn delete(
    session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
    Path(id): Path<String>,
) -> Result<Response, HTTPError> {
    node.mappings()
        .remove(&session.user.id, &id)
        .map_err(node_error)?;
    Ok(apikit::reply::message("mapping deleted"))
}
