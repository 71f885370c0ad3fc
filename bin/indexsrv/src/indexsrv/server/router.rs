use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, Method};
use axum::routing::*;

use protocol::SESSION_HEADER;

use tower_http::cors::{Any, CorsLayer};

use super::handlers;

fn auth() -> Router {
    Router::new()
        .route("/signup", post(handlers::auth::signup))
        .route("/login", post(handlers::auth::login))
        .route("/logout", post(handlers::auth::logout))
        .route("/2fa", post(handlers::auth::two_factor))
}

fn organizations() -> Router {
    Router::new()
        .route(
            "/organizations",
            get(handlers::organizations::list).post(handlers::organizations::create),
        )
        .route("/organizations/:org_id", get(handlers::organizations::get))
        .route(
            "/organizations/:org_id/servers",
            get(handlers::organizations::servers),
        )
}

fn accounts() -> Router {
    Router::new()
        .route(
            "/accounts",
            get(handlers::accounts::list).post(handlers::accounts::link),
        )
        .route("/accounts/auth_callback", get(handlers::accounts::auth_callback))
        .route("/accounts/:server_id", delete(handlers::accounts::unlink))
}

fn mappings() -> Router {
    Router::new()
        .route(
            "/mappings",
            get(handlers::mappings::list).post(handlers::mappings::create),
        )
        .route(
            "/mappings/:mapping_id",
            get(handlers::mappings::get)
                .put(handlers::mappings::update)
                .delete(handlers::mappings::delete),
        )
}

fn fileservers() -> Router {
    Router::new()
        .route(
            "/api/fileservers/v1/register",
            post(handlers::fileservers::register),
        )
        .route(
            "/api/fileservers/v1/status",
            post(handlers::fileservers::status),
        )
        .route(
            "/api/fileservers/v1/sync_errors",
            get(handlers::fileservers::sync_errors),
        )
}

pub fn new(trusted_cn_header: Option<&str>) -> Router {
    let mut allowed_headers = vec![CONTENT_TYPE, HeaderName::from_static(SESSION_HEADER)];
    if let Some(header) = trusted_cn_header.and_then(|h| HeaderName::try_from(h).ok()) {
        allowed_headers.push(header);
    }

    let cors = CorsLayer::new()
        .allow_methods(vec![
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::PUT,
            Method::OPTIONS,
        ])
        .allow_origin(Any)
        .allow_headers(allowed_headers);

    Router::new()
        .route("/health", get(handlers::admin::health))
        .route("/version", get(handlers::admin::version))
        .merge(auth())
        .merge(organizations())
        .merge(accounts())
        .merge(mappings())
        .merge(fileservers())
        .layer(cors)
}
