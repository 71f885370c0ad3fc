use std::sync::Arc;

use apikit::reject::HTTPError;

use axum::extract::{Extension, Path, Query};
use axum::response::Response;
use axum::Json;

use protocol::index::accounts::{
    AccountInfo, AuthCallbackQuery, LinkAccountRequest, LinkAccountResponse,
};

use crate::node::IndexNode;
use crate::server::session::Session;

use super::{node_error, registrar_error};

/// Starts linking a file server account. The client follows `redirect` to the server.
#[tracing::instrument(skip(session, node), fields(user = %session.user.name))]
pub async fn link(
    session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
    Json(request): Json<LinkAccountRequest>,
) -> Result<Json<LinkAccountResponse>, HTTPError> {
    let registrar = node.registrar();
    let server = registrar
        .find_server(&request.org_name, &request.server_name)
        .map_err(|e| registrar_error(&e))?;

    let redirect = registrar
        .initiate_link(&session.user.id, &server.id, request.force)
        .map_err(node_error)?;
    Ok(Json(LinkAccountResponse { redirect }))
}

pub async fn list(
    session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
) -> Result<Json<Vec<AccountInfo>>, HTTPError> {
    let accounts = node
        .registrar()
        .list_accounts(&session.user.id)
        .map_err(|e| registrar_error(&e))?;

    Ok(Json(
        accounts
            .into_iter()
            .map(|a| AccountInfo {
                server_id: a.server_id,
                checkpoint: a.checkpoint_ns,
                needs_relink: a.needs_relink,
            })
            .collect(),
    ))
}

#[tracing::instrument(skip(session, node), fields(user = %session.user.name))]
pub async fn unlink(
    session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
    Path(server_id): Path<String>,
) -> Result<Response, HTTPError> {
    node.sync().stop(&session.user.id, &server_id).await;
    node.registrar()
        .unlink(&session.user.id, &server_id)
        .map_err(|e| registrar_error(&e))?;
    Ok(apikit::reply::message("account unlinked"))
}

/// Where file servers send the user back. The state alone identifies the link.
#[tracing::instrument(skip(node, query))]
pub async fn auth_callback(
    Extension(node): Extension<Arc<IndexNode>>,
    Query(query): Query<AuthCallbackQuery>,
) -> Result<Response, HTTPError> {
    let account = node
        .registrar()
        .complete_link(&query.state, &query.code)
        .await
        .map_err(|e| registrar_error(&e))?;

    node.sync().start(&account.user_id, &account.server_id);
    Ok(apikit::reply::message("account linked"))
}
