//! The error type returned by every HTTP handler.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::reply;

const MESSAGE_UNAUTHORIZED: &str = "unauthorized";
const MESSAGE_FORBIDDEN: &str = "forbidden";
const MESSAGE_NOT_FOUND: &str = "not found";

#[derive(Debug, PartialEq, Eq)]
pub enum HTTPError {
    BadRequest { error: String },
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict { error: String },
    InternalServerError { error: String },
}

impl HTTPError {
    pub fn bad_request<S: ToString>(s: S) -> Self {
        Self::BadRequest {
            error: s.to_string(),
        }
    }

    pub fn conflict<S: ToString>(s: S) -> Self {
        Self::Conflict {
            error: s.to_string(),
        }
    }

    pub fn internal_server_error<S: ToString>(s: S) -> Self {
        Self::InternalServerError {
            error: s.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::InternalServerError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for HTTPError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { error } => write!(f, "bad request: {error}"),
            Self::Unauthorized => write!(f, "{MESSAGE_UNAUTHORIZED}"),
            Self::Forbidden => write!(f, "{MESSAGE_FORBIDDEN}"),
            Self::NotFound => write!(f, "{MESSAGE_NOT_FOUND}"),
            Self::Conflict { error } => write!(f, "conflict: {error}"),
            Self::InternalServerError { error } => write!(f, "{error}"),
        }
    }
}

impl IntoResponse for HTTPError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            Self::InternalServerError { error } => tracing::error!("error: {}", error),
            other => tracing::info!(status = ?status, "rejection: {}", other),
        }
        reply::error(self, status)
    }
}
