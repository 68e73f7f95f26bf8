use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time::TimeSource;

/// A post as it travels through the queue and lands in storage.
///
/// `id`, `created_at` and `updated_at` are only ever set by [`PostStamper`], callers cannot
/// provide them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: String,
    pub created_at: DateTime<Utc>,
    // Older producers wrote this field capitalized.
    #[serde(alias = "UpdatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Post {
    pub fn key(&self) -> String {
        self.id.to_string()
    }
}

/// The body of a create request. Unknown fields, including any `id` or timestamps, are
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewPost {
    pub title: String,
    pub subtitle: String,
    pub content: String,
    pub author: String,
}

/// Assigns the server-side fields of new posts.
///
/// Ids are wall-clock milliseconds, bumped past the previous id when needed so that they
/// stay unique and strictly increasing for the lifetime of the stamper.
pub struct PostStamper {
    timesource: Arc<dyn TimeSource + Send + Sync>,
    last_id: AtomicI64,
}

impl PostStamper {
    pub fn new(timesource: Arc<dyn TimeSource + Send + Sync>) -> Self {
        Self {
            timesource,
            last_id: AtomicI64::new(0),
        }
    }

    pub fn stamp(&self, post: NewPost) -> Post {
        let now = self.timesource.current_time();
        let id = self.next_id(now.timestamp_millis());

        Post {
            id,
            title: post.title,
            subtitle: post.subtitle,
            content: post.content,
            author: post.author,
            created_at: now,
            updated_at: now,
        }
    }

    fn next_id(&self, millis: i64) -> i64 {
        let mut last = self.last_id.load(Ordering::Relaxed);
        loop {
            let next = millis.max(last.saturating_add(1));
            match self
                .last_id
                .compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}
