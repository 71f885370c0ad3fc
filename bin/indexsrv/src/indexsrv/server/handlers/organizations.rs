use std::sync::Arc;

use apikit::reject::HTTPError;

use axum::extract::{Extension, Path};
use axum::Json;

use protocol::index::organizations::{FileServer, NewOrganizationRequest, Organization};

use crate::node::IndexNode;
use crate::server::session::Session;

use super::{node_error, registrar_error};

pub async fn list(
    _session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
) -> Result<Json<Vec<Organization>>, HTTPError> {
    let orgs = node
        .registrar()
        .list_organizations()
        .map_err(|e| registrar_error(&e))?;
    Ok(Json(orgs.into_iter().map(Organization::from).collect()))
}

#[tracing::instrument(skip(session, node), fields(user = %session.user.name))]
pub async fn create(
    session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
    Json(request): Json<NewOrganizationRequest>,
) -> Result<Json<Organization>, HTTPError> {
    session.require_admin(&node)?;
    let org = node
        .registrar()
        .add_organization(&request.name)
        .map_err(node_error)?;
    Ok(Json(org.into()))
}

pub async fn get(
    _session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
    Path(id): Path<String>,
) -> Result<Json<Organization>, HTTPError> {
    let org = node
        .registrar()
        .get_organization(&id)
        .map_err(|e| registrar_error(&e))?;
    Ok(Json(org.into()))
}

/// The file servers registered under one organization, with their last announced health.
pub async fn servers(
    _session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<FileServer>>, HTTPError> {
    let registrar = node.registrar();
    registrar
        .get_organization(&id)
        .map_err(|e| registrar_error(&e))?;

    let servers = registrar
        .list_servers(Some(&id))
        .map_err(|e| registrar_error(&e))?;
    Ok(Json(
        servers
            .iter()
            .map(|s| s.to_dto(registrar.is_healthy(&s.id)))
            .collect(),
    ))
}
