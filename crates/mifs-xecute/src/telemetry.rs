use opentelemetry::sdk::trace as sdktrace;
use opentelemetry::trace::TraceError;

/// Install a batching jaeger exporter on the tokio runtime.
///
/// The agent endpoint is taken from the `OTEL_EXPORTER_JAEGER_AGENT_HOST` and
/// `OTEL_EXPORTER_JAEGER_AGENT_PORT` environment variables, defaulting to localhost.
pub fn init_tracer(name: &str) -> Result<sdktrace::Tracer, TraceError> {
    opentelemetry_jaeger::new_pipeline()
        .with_service_name(name)
        .install_batch(opentelemetry::runtime::Tokio)
}
