//! Response builders for handlers that do not return a typed payload.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::payload::{ErrorResponse, MessageResponse};

/// Serializes `body` as JSON under `status`.
pub fn with_status<T: Serialize>(status: StatusCode, body: T) -> Response {
    (status, Json(body)).into_response()
}

/// `{"error": ...}` under `status`.
pub fn error<E: ToString>(e: E, status: StatusCode) -> Response {
    with_status(
        status,
        ErrorResponse {
            error: e.to_string(),
        },
    )
}

/// `{"message": ...}` with 200 OK.
pub fn message<M: Into<String>>(message: M) -> Response {
    with_status(StatusCode::OK, MessageResponse::new(message))
}

/// A freshly created resource, with 201 Created.
pub fn created<T: Serialize>(body: T) -> Response {
    with_status(StatusCode::CREATED, body)
}
