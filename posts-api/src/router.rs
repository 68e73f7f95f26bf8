use std::future::ready;
use std::sync::Arc;

use axum::response::IntoResponse;
use axum::{
    routing::{get, post},
    Router,
};
use health::HealthRegistry;
use tower_http::trace::TraceLayer;

use posts_common::envelope::PostStamper;
use posts_common::metrics::{setup_metrics_recorder, track_metrics};
use posts_common::queue::Publisher;
use posts_common::store::DocumentSink;
use posts_common::time::TimeSource;

use crate::handlers;

#[derive(Clone)]
pub struct State {
    pub sink: Arc<dyn DocumentSink + Send + Sync>,
    pub publisher: Arc<dyn Publisher + Send + Sync>,
    pub stamper: Arc<PostStamper>,
}

async fn index() -> &'static str {
    "posts api"
}

pub fn router<TZ: TimeSource + Send + Sync + 'static>(
    timesource: TZ,
    sink: Arc<dyn DocumentSink + Send + Sync>,
    publisher: Arc<dyn Publisher + Send + Sync>,
    liveness: Option<HealthRegistry>,
    metrics: bool,
) -> Router {
    let state = State {
        sink,
        publisher,
        stamper: Arc::new(PostStamper::new(Arc::new(timesource))),
    };

    let liveness_route = match liveness {
        Some(registry) => get(move || ready(registry.get_status().into_response())),
        None => get(|| ready("ok".into_response())),
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", liveness_route)
        .route(
            "/api/create-post-without-kafka",
            post(handlers::create_post_direct),
        )
        .route(
            "/api/create-post-with-kafka",
            post(handlers::create_post_queued),
        )
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Installing a global recorder when used as a library (during tests etc) does not work
    // well, so it has to be asked for.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_json_diff::assert_json_include;
    use axum::body::Body;
    use axum::http::{self, Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt; // for `collect`
    use posts_common::test_utils::{MemoryQueue, MemorySink};
    use posts_common::time::FixedTime;
    use serde_json::{json, Value};
    use tower::ServiceExt; // for `oneshot`

    use crate::api::{AcceptedPostResponse, CreatedPostResponse, ErrorResponse};

    const NOW_MILLIS: i64 = 1_714_557_600_000;

    fn test_router() -> (Router, Arc<MemorySink>, Arc<MemoryQueue>) {
        let sink = Arc::new(MemorySink::new());
        let queue = Arc::new(MemoryQueue::new());
        let time = FixedTime::new(Utc.timestamp_millis_opt(NOW_MILLIS).single().unwrap());
        let app = router(time, sink.clone(), queue.clone(), None, false);
        (app, sink, queue)
    }

    fn create_request(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    fn payload() -> String {
        json!({
            "id": 12,
            "title": "Blog title",
            "subtitle": "Subtitle",
            "content": "My blog content",
            "author": "sounish",
            "createdAt": "2001-01-01T00:00:00Z",
        })
        .to_string()
    }

    #[tokio::test]
    async fn index_responds() {
        let (app, _, _) = test_router();

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"posts api");
    }

    #[tokio::test]
    async fn direct_create_stores_stamped_post() {
        let (app, sink, queue) = test_router();

        let response = app
            .oneshot(create_request("/api/create-post-without-kafka", payload()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let created: CreatedPostResponse = serde_json::from_slice(&body).unwrap();

        assert_eq!(created.message, "post created");
        assert_eq!(created.post.id, NOW_MILLIS);
        assert_eq!(created.post.created_at.timestamp_millis(), NOW_MILLIS);
        assert_eq!(created.post.updated_at, created.post.created_at);
        assert_eq!(created.post.author, "sounish");

        assert_eq!(sink.batches(), vec![vec![created.post]]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn queued_create_publishes_stamped_post() {
        let (app, sink, queue) = test_router();

        let response = app
            .oneshot(create_request("/api/create-post-with-kafka", payload()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let accepted: AcceptedPostResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(accepted.message, "post created");

        assert_eq!(queue.len(), 1);
        assert_eq!(sink.attempts(), 0);

        let message = posts_common::queue::MessageSource::recv(queue.as_ref())
            .await
            .unwrap();
        let published: Value = serde_json::from_slice(&message.payload.unwrap()).unwrap();
        assert_json_include!(
            actual: published,
            expected: json!({
                "id": NOW_MILLIS,
                "title": "Blog title",
                "subtitle": "Subtitle",
                "content": "My blog content",
                "author": "sounish",
            })
        );
        assert_ne!(published["createdAt"], json!("2001-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn malformed_body_has_no_side_effects() {
        for uri in [
            "/api/create-post-without-kafka",
            "/api/create-post-with-kafka",
        ] {
            let (app, sink, queue) = test_router();

            let response = app
                .oneshot(create_request(uri, "{\"title\": "))
                .await
                .unwrap();

            assert!(response.status().is_server_error());
            let body = response.into_body().collect().await.unwrap().to_bytes();
            let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
            assert!(error.error.starts_with("failed to decode request"));

            assert_eq!(sink.attempts(), 0);
            assert!(queue.is_empty());
        }
    }

    #[tokio::test]
    async fn wrongly_typed_field_is_rejected() {
        let (app, sink, _) = test_router();

        let response = app
            .oneshot(create_request(
                "/api/create-post-without-kafka",
                json!({"title": 42}).to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(sink.attempts(), 0);
    }

    #[tokio::test]
    async fn store_failure_is_reported() {
        let (app, sink, _) = test_router();
        sink.fail_next(1);

        let response = app
            .oneshot(create_request("/api/create-post-without-kafka", payload()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(error.error.starts_with("failed to store post"));
        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_is_reported() {
        let (app, _, queue) = test_router();
        queue.reject_publish(true);

        let response = app
            .oneshot(create_request("/api/create-post-with-kafka", payload()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(error.error.starts_with("failed to enqueue post"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn liveness_reflects_registry() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("rdkafka".to_string(), time::Duration::seconds(30));
        let app = router(
            FixedTime::new(Utc::now()),
            Arc::new(MemorySink::new()),
            Arc::new(MemoryQueue::new()),
            Some(registry),
            false,
        );

        let request = || Request::builder().uri("/_liveness").body(Body::empty()).unwrap();

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        handle.report_healthy();
        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
