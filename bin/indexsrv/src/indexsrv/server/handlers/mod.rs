pub mod accounts;
pub mod admin;
pub mod auth;
pub mod fileservers;
pub mod mappings;
pub mod organizations;

use apikit::reject::HTTPError;

use crate::node::{MappingError, RegistrarError, RepositoryError, UserError};

fn repository_error(e: &RepositoryError) -> HTTPError {
    match e {
        RepositoryError::NotFound { .. } => HTTPError::NotFound,
        RepositoryError::AlreadyExists { .. } => HTTPError::conflict(e),
        other => HTTPError::internal_server_error(other),
    }
}

/// Maps a registrar failure onto the status the caller sees.
pub(super) fn registrar_error(e: &RegistrarError) -> HTTPError {
    match e {
        RegistrarError::CNMismatch { .. } => HTTPError::Forbidden,
        RegistrarError::NotFound { .. }
        | RegistrarError::OrganizationNotFound { .. }
        | RegistrarError::ServerNotFound { .. } => HTTPError::NotFound,
        RegistrarError::AccountExists | RegistrarError::NeedsRelink => HTTPError::conflict(e),
        RegistrarError::EmptyOrganizationName => HTTPError::bad_request(e),
        RegistrarError::Repository { source } => repository_error(source),
        RegistrarError::TokenExchange { .. } => HTTPError::internal_server_error(e),
    }
}

fn user_error(e: &UserError) -> HTTPError {
    match e {
        UserError::InvalidCredentials | UserError::InvalidSession => HTTPError::Unauthorized,
        UserError::OtpRequired | UserError::InvalidSignup { .. } => HTTPError::bad_request(e),
    }
}

/// Maps a service failure onto the status the caller sees, by the typed error it wraps.
pub(super) fn node_error(e: anyhow::Error) -> HTTPError {
    if let Some(e) = e.downcast_ref::<UserError>() {
        return user_error(e);
    }
    if let Some(e) = e.downcast_ref::<RegistrarError>() {
        return registrar_error(e);
    }
    if let Some(e) = e.downcast_ref::<RepositoryError>() {
        return repository_error(e);
    }
    if let Some(e) = e.downcast_ref::<MappingError>() {
        return HTTPError::bad_request(e);
    }
    HTTPError::internal_server_error(format!("{:#}", e))
}
