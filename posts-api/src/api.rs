use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use posts_common::envelope::Post;
use posts_common::queue::PublishError;
use posts_common::store::StoreError;

pub const POST_CREATED: &str = "post created";

/// Returned by the direct path, the post is already stored.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CreatedPostResponse {
    pub post: Post,
    pub message: String,
}

/// Returned by the queued path, the post is only enqueued.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AcceptedPostResponse {
    pub message: String,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("failed to decode request: {0}")]
    ValidationError(#[from] serde_json::Error),
    #[error("failed to enqueue post: {0}")]
    PublishError(#[from] PublishError),
    #[error("failed to store post: {0}")]
    StoreError(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::ValidationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::PublishError(_) | ApiError::StoreError(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
