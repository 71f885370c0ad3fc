use std::sync::Arc;

use apikit::reject::HTTPError;

use axum::extract::Extension;
use axum::response::Response;
use axum::Json;

use protocol::index::auth::{
    LoginRequest, LoginResponse, SignupRequest, SignupResponse, TwoFactorResponse,
};

use crate::node::IndexNode;
use crate::server::session::Session;

use super::node_error;

#[tracing::instrument(skip(node, request), fields(name = %request.name))]
pub async fn signup(
    Extension(node): Extension<Arc<IndexNode>>,
    Json(request): Json<SignupRequest>,
) -> Result<Json<SignupResponse>, HTTPError> {
    let id = node
        .users()
        .signup(&request.name, &request.email, &request.password)
        .map_err(node_error)?;
    Ok(Json(SignupResponse { id }))
}

/// Opens a session and resumes syncing every account of the user.
#[tracing::instrument(skip(node, request))]
pub async fn login(
    Extension(node): Extension<Arc<IndexNode>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, HTTPError> {
    let users = node.users();
    let token = users
        .login(&request.email, &request.password, request.otp.as_deref())
        .map_err(node_error)?;

    let user = users.session_user(&token).map_err(node_error)?;
    if let Err(e) = node.sync().start_user(&user.id) {
        tracing::warn!(user = %user.name, "failed to start sync workers: {:#}", e);
    }

    Ok(Json(LoginResponse { token }))
}

#[tracing::instrument(skip(session, node), fields(user = %session.user.name))]
pub async fn logout(
    session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
) -> Result<Response, HTTPError> {
    node.users().logout(&session.token).map_err(node_error)?;
    node.sync().stop_user(&session.user.id).await;
    Ok(apikit::reply::message("logged out"))
}

#[tracing::instrument(skip(session, node), fields(user = %session.user.name))]
pub async fn two_factor(
    session: Session,
    Extension(node): Extension<Arc<IndexNode>>,
) -> Result<Json<TwoFactorResponse>, HTTPError> {
    let uri = node.users().setup_2fa(&session.user).map_err(node_error)?;
    Ok(Json(TwoFactorResponse { uri }))
}
