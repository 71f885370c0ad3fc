use std::sync::Arc;
use std::time::Duration;

use apikit::middleware::MakeRequestUuid;

use axum::extract::Extension;
use axum::http::{HeaderName, Request};
use axum::response::Response;
use axum::Router;

use mifs_auth::TrustedCnHeader;

use tower_http::request_id::{PropagateRequestIdLayer, RequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::node::FileNode;

const REQUEST_ID_HEADER: &str = "x-request-id";

fn wrap_trace_layer(router: Router) -> Router {
    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(|r: &Request<_>| {
                let request_id = r
                    .extensions()
                    .get::<RequestId>()
                    .and_then(|id| id.header_value().to_str().ok())
                    .unwrap_or("unknown")
                    .to_string();
                tracing::info_span!(
                    "request",
                    id = %request_id,
                    method = %r.method(),
                    uri = %r.uri(),
                )
            })
            .on_request(|_r: &Request<_>, _s: &tracing::Span| {})
            .on_response(
                |response: &Response, latency: Duration, _span: &tracing::Span| {
                    tracing::info!(status = ?response.status(), elapsed = ?latency, "complete");
                },
            ),
    )
}

fn wrap_extension_layers(
    mut router: Router,
    node: Arc<FileNode>,
    trusted_cn_header: Option<String>,
) -> Router {
    if let Some(header) = trusted_cn_header {
        router = router.layer(Extension(TrustedCnHeader(header)));
    }
    router.layer(Extension(node))
}

/// Wraps the router with tracing, shared state and request ids.
pub fn wrap(router: Router, node: Arc<FileNode>, trusted_cn_header: Option<String>) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    let router = wrap_trace_layer(router);
    wrap_extension_layers(router, node, trusted_cn_header)
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
}
