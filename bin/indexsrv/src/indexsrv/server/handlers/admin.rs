use std::sync::Arc;

use apikit::reject::HTTPError;

use axum::extract::Extension;
use axum::response::Response;
use axum::Json;

use protocol::index::HealthResponse;

use crate::node::IndexNode;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Always healthy while serving; sync failures show up as a count.
pub async fn health(
    Extension(node): Extension<Arc<IndexNode>>,
) -> Result<Json<HealthResponse>, HTTPError> {
    Ok(Json(HealthResponse {
        message: "healthy".into(),
        failing_servers: node.sync().errors().len(),
    }))
}

pub async fn version() -> Result<Response, HTTPError> {
    Ok(apikit::reply::message(VERSION))
}
