use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, Method};
use axum::routing::*;
use tower_http::cors::{Any, CorsLayer};

use super::handlers;

fn files() -> Router {
    Router::new()
        .route(
            "/files",
            get(handlers::files::list).post(handlers::files::create),
        )
        .route(
            "/files/:file_id",
            get(handlers::files::get)
                .put(handlers::files::update)
                .delete(handlers::files::delete),
        )
        .route(
            "/files/:file_id/contents",
            get(handlers::contents::get)
                .put(handlers::contents::put)
                .delete(handlers::contents::delete),
        )
}

pub fn new(trusted_cn_header: Option<&str>) -> Router {
    let mut allowed_headers = vec![CONTENT_TYPE, AUTHORIZATION];
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
        .route("/permissions", post(handlers::permissions::update))
        .route("/authorize", get(handlers::oauth2::authorize))
        .route(
            "/token",
            get(handlers::oauth2::token_query).post(handlers::oauth2::token_form),
        )
        .merge(files())
        .layer(cors)
}
