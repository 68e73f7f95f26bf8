use axum::extract::State;
use axum::Json;
use bytes::Bytes;
use metrics::counter;
use tracing::instrument;

use posts_common::envelope::{NewPost, Post};

use crate::api::{AcceptedPostResponse, ApiError, CreatedPostResponse, POST_CREATED};
use crate::router;

/// Stores the post right away, in the direct table.
#[instrument(skip_all, fields(post_id))]
pub async fn create_post_direct(
    State(state): State<router::State>,
    body: Bytes,
) -> Result<Json<CreatedPostResponse>, ApiError> {
    let post = decode_and_stamp(&state, &body, "direct")?;

    if let Err(err) = state.sink.insert_one(&post).await {
        tracing::error!("failed to store post {}: {}", post.id, err);
        counter!("posts_api_failed_total", "path" => "direct", "cause" => "store").increment(1);
        return Err(err.into());
    }

    counter!("posts_api_created_total", "path" => "direct").increment(1);
    Ok(Json(CreatedPostResponse {
        post,
        message: POST_CREATED.to_owned(),
    }))
}

/// Enqueues the post for the batching consumer, storage happens later.
#[instrument(skip_all, fields(post_id))]
pub async fn create_post_queued(
    State(state): State<router::State>,
    body: Bytes,
) -> Result<Json<AcceptedPostResponse>, ApiError> {
    let post = decode_and_stamp(&state, &body, "queued")?;

    if let Err(err) = state.publisher.publish(&post).await {
        tracing::error!("failed to enqueue post {}: {}", post.id, err);
        counter!("posts_api_failed_total", "path" => "queued", "cause" => "publish").increment(1);
        return Err(err.into());
    }

    counter!("posts_api_created_total", "path" => "queued").increment(1);
    Ok(Json(AcceptedPostResponse {
        message: POST_CREATED.to_owned(),
    }))
}

fn decode_and_stamp(
    state: &router::State,
    body: &Bytes,
    path: &'static str,
) -> Result<Post, ApiError> {
    let new_post: NewPost = serde_json::from_slice(body).map_err(|err| {
        tracing::warn!("rejected invalid payload: {}", err);
        counter!("posts_api_failed_total", "path" => path, "cause" => "validation").increment(1);
        err
    })?;

    let post = state.stamper.stamp(new_post);
    tracing::Span::current().record("post_id", post.id);
    tracing::debug!(post=?post, "decoded request");
    Ok(post)
}
