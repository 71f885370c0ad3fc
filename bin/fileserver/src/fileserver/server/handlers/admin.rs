use apikit::reject::HTTPError;

use axum::response::Response;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn health() -> Result<Response, HTTPError> {
    Ok(apikit::reply::message("healthy"))
}

pub async fn version() -> Result<Response, HTTPError> {
    Ok(apikit::reply::message(VERSION))
}
