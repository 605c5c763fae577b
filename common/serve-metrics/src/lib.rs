use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Latency buckets for the engine's duration histograms. Handler runs and
/// HTTP requests both land in this range; anything past a minute is a lease
/// problem, not a latency one.
const DURATION_SECONDS_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.02, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0,
];

/// Install the process-wide Prometheus recorder. Call once at startup,
/// before any counter is touched; the returned handle renders the scrape
/// body.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_owned()),
            DURATION_SECONDS_BUCKETS,
        )
        .expect("duration bucket list must not be empty")
        .install_recorder()
        .expect("failed to install the prometheus recorder")
}

/// Mount the scrape endpoint on a router and wrap its routes with request
/// accounting.
pub fn attach(router: Router, handle: PrometheusHandle) -> Router {
    router
        .route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )
        .layer(axum::middleware::from_fn(record_http))
}

/// Bind and serve a router assembled with `attach`.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

/// Per-request accounting: totals and latency by route template and status,
/// plus an in-flight gauge so a scrape can see a wedged handler.
async fn record_http(request: Request<Body>, next: Next) -> impl IntoResponse {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = request.method().as_str().to_owned();

    metrics::gauge!("coremachine_http_in_flight").increment(1.0);
    let started = Instant::now();

    let response = next.run(request).await;

    metrics::gauge!("coremachine_http_in_flight").decrement(1.0);

    let labels = [
        ("method", method),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("coremachine_http_requests_total", &labels).increment(1);
    metrics::histogram!("coremachine_http_request_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());

    response
}
