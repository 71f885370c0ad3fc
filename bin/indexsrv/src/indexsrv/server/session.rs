use std::sync::Arc;

use apikit::reject::HTTPError;

use axum::extract::{FromRequest, RequestParts};

use protocol::SESSION_HEADER;

use crate::node::model::User;
use crate::node::{IndexNode, UserError};

/// The signed-in caller, resolved from the session header.
pub struct Session {
    pub token: String,
    pub user: User,
}

impl Session {
    pub fn require_admin(&self, node: &IndexNode) -> Result<(), HTTPError> {
        if node.users().is_admin(&self.user) {
            Ok(())
        } else {
            tracing::debug!(user = %self.user.name, "admin required");
            Err(HTTPError::Forbidden)
        }
    }
}

#[async_trait::async_trait]
impl<B: Send> FromRequest<B> for Session {
    type Rejection = HTTPError;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let token = req
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                tracing::debug!("no session token");
                HTTPError::Unauthorized
            })?
            .to_string();

        let node = req
            .extensions()
            .get::<Arc<IndexNode>>()
            .cloned()
            .ok_or_else(|| HTTPError::internal_server_error("node extension missing"))?;

        let user = node
            .users()
            .session_user(&token)
            .map_err(|e| match e.downcast_ref::<UserError>() {
                Some(_) => HTTPError::Unauthorized,
                None => HTTPError::internal_server_error(e),
            })?;

        Ok(Session { token, user })
    }
}
