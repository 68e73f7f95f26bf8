use std::future::ready;
use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const LATENCY_SECONDS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];
// Flushes range from a single post to a whole buffer of them
const BATCH_SIZES: &[f64] = &[1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0];

/// Exposes `/metrics` on the router and records its requests. Installs the global recorder,
/// so it must only be called once per process.
pub fn setup_metrics_routes(router: Router) -> Router {
    let handle = setup_metrics_recorder();

    router
        .route("/metrics", get(move || ready(handle.render())))
        .layer(middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets(LATENCY_SECONDS)
        .and_then(|builder| {
            builder.set_buckets_for_metric(Matcher::Suffix("batch_size".to_string()), BATCH_SIZES)
        })
        .expect("bucket lists are not empty")
        .install_recorder()
        .expect("failed to install the prometheus recorder")
}

/// Counts and times requests per route template, so `/api/create-post-*` calls are not
/// split by raw URI.
pub async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path().to_owned(), |path| path.as_str().to_owned());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    counter!("posts_http_requests_total", &labels).increment(1);
    histogram!("posts_http_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
