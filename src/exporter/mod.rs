use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    routing::get,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, debug_span, info};
use ulid::Ulid;

use crate::metrics::{MetricRegistry, ProcessMetrics};

mod handlers;
mod shutdown;

pub use shutdown::shutdown_signal;

/// Serve `/metrics` and `/ping` until `token` is cancelled.
///
/// Responses are compressed when the client advertises support; the
/// serializer itself always writes plain UTF-8.
///
/// # Errors
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(
    port: u16,
    registry: Arc<MetricRegistry>,
    token: CancellationToken,
) -> Result<()> {
    let process = Arc::new(ProcessMetrics::new());

    let app = Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/ping", get(handlers::ping))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(CompressionLayer::new())
                .layer(Extension(registry))
                .layer(Extension(process)),
        );

    let listener = TcpListener::bind(format!("[::]:{port}"))
        .await
        .with_context(|| format!("cannot bind port {port}"))?;

    info!(port, "listening for scrapes");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    Ok(())
}

// span
fn make_span(request: &Request<Body>) -> Span {
    let path = request.uri().path();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    debug_span!("http-request", path, request_id)
}
