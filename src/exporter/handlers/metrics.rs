use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use tracing::{debug, instrument};

use crate::metrics::{MetricRegistry, ProcessMetrics};

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Serialise every family plus the process metrics as the Prometheus text
/// format. The pass counts its own sample lines and appends them as
/// `exposed_metrics`, last, so the gauge reflects this response.
#[instrument(skip(registry, process), fields(http.route = "/metrics"))]
pub async fn metrics(
    Extension(registry): Extension<Arc<MetricRegistry>>,
    Extension(process): Extension<Arc<ProcessMetrics>>,
) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static(CONTENT_TYPE));

    let body = render(&registry, &process);
    debug!(bytes = body.len(), "rendered exposition");

    (StatusCode::OK, headers, body)
}

pub(crate) fn render(registry: &MetricRegistry, process: &ProcessMetrics) -> String {
    let mut out = String::with_capacity(4 * 1024);

    let mut exposed = 0;
    for family in registry.families() {
        exposed += family.expose_to(&mut out);
    }

    process.expose_to(&mut out, exposed);
    out
}
