use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{info, instrument};

use crate::envelope::Post;

// Postgres accepts at most 65535 bind parameters per statement, we bind 7 per post.
const MAX_POSTS_PER_STATEMENT: usize = 65535 / 7;

/// Enumeration of errors for storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("write of {count} posts did not complete within {timeout:?}")]
    Timeout { count: usize, timeout: Duration },
}

/// Bulk writes of posts. A call either stores every post it was given or fails as a whole.
#[async_trait]
pub trait DocumentSink {
    async fn insert_many(&self, posts: &[Post]) -> Result<(), StoreError>;

    async fn insert_one(&self, post: &Post) -> Result<(), StoreError> {
        self.insert_many(std::slice::from_ref(post)).await
    }
}

/// Stores posts as rows of a Postgres table.
#[derive(Clone)]
pub struct PostgresSink {
    table: String,
    pool: PgPool,
    write_timeout: Duration,
}

impl PostgresSink {
    /// Connects to Postgres and checks the connection, so that an unreachable database fails
    /// startup.
    pub async fn new(
        table: &str,
        url: &str,
        max_connections: u32,
        write_timeout: Duration,
    ) -> Result<Self, StoreError> {
        info!("connecting to Postgres, writing to {}", table);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(write_timeout)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self::new_from_pool(table, pool, write_timeout))
    }

    pub fn new_from_pool(table: &str, pool: PgPool, write_timeout: Duration) -> Self {
        Self {
            table: table.to_owned(),
            pool,
            write_timeout,
        }
    }

    async fn write(&self, posts: &[Post]) -> Result<(), StoreError> {
        let query_error = |command: &str| {
            let command = command.to_owned();
            move |error| StoreError::QueryError { command, error }
        };

        let mut tx = self.pool.begin().await.map_err(query_error("BEGIN"))?;

        for chunk in posts.chunks(MAX_POSTS_PER_STATEMENT) {
            // Identifiers cannot be bound, the table name only comes from configuration
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                r#"INSERT INTO "{}" (id, title, subtitle, content, author, created_at, updated_at) "#,
                self.table
            ));
            builder.push_values(chunk, |mut row, post| {
                row.push_bind(post.id)
                    .push_bind(&post.title)
                    .push_bind(&post.subtitle)
                    .push_bind(&post.content)
                    .push_bind(&post.author)
                    .push_bind(post.created_at)
                    .push_bind(post.updated_at);
            });

            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(query_error("INSERT"))?;
        }

        tx.commit().await.map_err(query_error("COMMIT"))?;
        Ok(())
    }

    /// Reads back every stored post, oldest id first.
    pub async fn fetch_all(&self) -> Result<Vec<Post>, StoreError> {
        let query = format!(
            r#"SELECT id, title, subtitle, content, author, created_at, updated_at FROM "{}" ORDER BY id, row_id"#,
            self.table
        );
        sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }
}

#[async_trait]
impl DocumentSink for PostgresSink {
    #[instrument(skip_all, fields(table = %self.table, count = posts.len()))]
    async fn insert_many(&self, posts: &[Post]) -> Result<(), StoreError> {
        if posts.is_empty() {
            return Ok(());
        }

        let start = std::time::Instant::now();
        // Dropping the write on timeout rolls back the open transaction.
        let result = match tokio::time::timeout(self.write_timeout, self.write(posts)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                count: posts.len(),
                timeout: self.write_timeout,
            }),
        };

        let outcome = if result.is_ok() { "success" } else { "failure" };
        histogram!("posts_store_write_duration_seconds", "outcome" => outcome)
            .record(start.elapsed().as_secs_f64());
        counter!("posts_store_writes_total", "table" => self.table.clone(), "outcome" => outcome)
            .increment(1);
        if result.is_ok() {
            counter!("posts_stored_total", "table" => self.table.clone())
                .increment(posts.len() as u64);
        }
        result
    }
}

/// Logs posts instead of storing them, for running without a database.
pub struct PrintSink {}

#[async_trait]
impl DocumentSink for PrintSink {
    async fn insert_many(&self, posts: &[Post]) -> Result<(), StoreError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of posts");
        let _enter = span.enter();

        histogram!("posts_print_sink_batch_size").record(posts.len() as f64);
        for post in posts {
            tracing::info!("post: {:?}", post);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn post(id: i64, title: &str) -> Post {
        let at = Utc.timestamp_millis_opt(id).single().unwrap();
        Post {
            id,
            title: title.to_owned(),
            subtitle: format!("{title} subtitle"),
            content: format!("{title} content"),
            author: "author".to_owned(),
            created_at: at,
            updated_at: at,
        }
    }

    fn sink(db: PgPool, table: &str) -> PostgresSink {
        PostgresSink::new_from_pool(table, db, Duration::from_secs(5))
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn insert_many_stores_whole_batch(db: PgPool) {
        let sink = sink(db, "posts_with_kafka");
        let posts = vec![post(1_000, "a"), post(1_001, "b"), post(1_002, "c")];

        sink.insert_many(&posts).await.expect("failed to insert batch");

        assert_eq!(sink.fetch_all().await.unwrap(), posts);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn insert_one_writes_to_its_own_table(db: PgPool) {
        let direct = sink(db.clone(), "posts_without_kafka");
        let queued = sink(db, "posts_with_kafka");

        direct.insert_one(&post(2_000, "direct")).await.unwrap();

        assert_eq!(direct.fetch_all().await.unwrap(), vec![post(2_000, "direct")]);
        assert!(queued.fetch_all().await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn empty_batch_is_a_noop(db: PgPool) {
        let sink = sink(db, "posts_with_kafka");

        sink.insert_many(&[]).await.unwrap();

        assert!(sink.fetch_all().await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn failed_write_stores_nothing(db: PgPool) {
        let sink = sink(db.clone(), "posts_with_kafka");
        let missing = PostgresSink::new_from_pool("no_such_table", db, Duration::from_secs(5));

        match missing.insert_many(&[post(1, "a")]).await {
            Err(StoreError::QueryError { command, .. }) => assert_eq!(command, "INSERT"),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(sink.fetch_all().await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn duplicate_ids_are_kept(db: PgPool) {
        // Redelivered batches may hold posts that were already written.
        let sink = sink(db, "posts_with_kafka");

        sink.insert_many(&[post(5, "a")]).await.unwrap();
        sink.insert_many(&[post(5, "a"), post(6, "b")]).await.unwrap();

        assert_eq!(sink.fetch_all().await.unwrap().len(), 3);
    }
}
