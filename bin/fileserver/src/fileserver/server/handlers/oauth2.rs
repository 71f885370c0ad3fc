//! OAuth2 endpoints. Errors follow RFC 6749 §5.2 rather than the usual `HTTPError` body.
use std::sync::Arc;

use axum::extract::{Extension, Form, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;

use mifs_auth::ClientIdentity;

use protocol::oauth2::{
    AuthorizeQuery, ErrorResponse, TokenRequest, TokenResponse, ERROR_INVALID_CLIENT,
    ERROR_INVALID_GRANT, ERROR_INVALID_REQUEST, ERROR_UNSUPPORTED_GRANT_TYPE,
};

use crate::node::{FileNode, OAuth2Error};

pub struct OAuth2Rejection(OAuth2Error);

impl From<OAuth2Error> for OAuth2Rejection {
    fn from(e: OAuth2Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for OAuth2Rejection {
    fn into_response(self) -> Response {
        let (status, error) = match &self.0 {
            OAuth2Error::InvalidClient => (StatusCode::UNAUTHORIZED, ERROR_INVALID_CLIENT),
            OAuth2Error::InvalidGrant { .. } => (StatusCode::BAD_REQUEST, ERROR_INVALID_GRANT),
            OAuth2Error::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, ERROR_INVALID_REQUEST),
            OAuth2Error::UnsupportedGrantType { .. } => {
                (StatusCode::BAD_REQUEST, ERROR_UNSUPPORTED_GRANT_TYPE)
            }
            OAuth2Error::Internal { message } => {
                tracing::error!("oauth2 error: {}", message);
                return apikit::reply::error("internal error", StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        tracing::info!(status = ?status, "oauth2 rejection: {}", self.0);
        let body = ErrorResponse {
            error: error.into(),
            error_description: Some(self.0.to_string()),
        };
        apikit::reply::with_status(status, body)
    }
}

#[tracing::instrument(skip(node))]
pub async fn authorize(
    identity: ClientIdentity,
    Extension(node): Extension<Arc<FileNode>>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Redirect, OAuth2Rejection> {
    let target = node.oauth2().authorize(&identity.common_name, &query)?;
    Ok(Redirect::to(&target))
}

fn token(node: &FileNode, request: &TokenRequest) -> Result<Json<TokenResponse>, OAuth2Rejection> {
    Ok(Json(node.oauth2().token(request)?))
}

pub async fn token_query(
    Extension(node): Extension<Arc<FileNode>>,
    Query(request): Query<TokenRequest>,
) -> Result<Json<TokenResponse>, OAuth2Rejection> {
    token(&node, &request)
}

pub async fn token_form(
    Extension(node): Extension<Arc<FileNode>>,
    Form(request): Form<TokenRequest>,
) -> Result<Json<TokenResponse>, OAuth2Rejection> {
    token(&node, &request)
}
