use std::sync::Arc;
use std::time::Duration;

use health::{ComponentStatus, HealthHandle};
use metrics::{counter, gauge, histogram};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use posts_common::envelope::Post;
use posts_common::queue::{MessageSource, PartitionOffsets, QueueMessage, SourceError};
use posts_common::store::{DocumentSink, StoreError};

use crate::error::{ConsumerError, DecodeError};

const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Flush as soon as this many posts are buffered.
    pub max_batch_size: usize,
    /// Flush whatever is buffered this long after the previous flush attempt.
    pub flush_interval: Duration,
    /// Stop dequeuing while this many posts wait for a successful flush.
    pub max_buffered_messages: usize,
}

/// Drains the queue into the sink in bulk writes.
///
/// Posts are buffered until `max_batch_size` of them arrived or `flush_interval` elapsed,
/// then written with a single `insert_many` call. Offsets are committed only once the batch
/// holding their messages was written, so a crash or a failing sink leads to redelivery and
/// never to loss. A failed batch is kept and retried on the next time trigger, with new posts
/// appended to it, until `max_buffered_messages` is reached and dequeuing pauses.
pub struct BatchingConsumer {
    source: Arc<dyn MessageSource + Send + Sync>,
    sink: Arc<dyn DocumentSink + Send + Sync>,
    config: BatchConfig,
    liveness: HealthHandle,
}

/// Loop state, only touched by `run`.
struct Buffer {
    posts: Vec<Post>,
    // Covers every message behind `posts`, malformed ones included
    offsets: PartitionOffsets,
    retrying: bool,
}

impl Buffer {
    fn track(&mut self, message: &QueueMessage) {
        let offset = self.offsets.entry(message.partition).or_insert(message.offset);
        *offset = (*offset).max(message.offset);
    }

    fn has_pending(&self) -> bool {
        !self.posts.is_empty() || !self.offsets.is_empty()
    }
}

impl BatchingConsumer {
    pub fn new(
        source: Arc<dyn MessageSource + Send + Sync>,
        sink: Arc<dyn DocumentSink + Send + Sync>,
        config: BatchConfig,
        liveness: HealthHandle,
    ) -> Result<Self, ConsumerError> {
        if config.max_batch_size == 0 {
            return Err(ConsumerError::InvalidConfig(
                "max_batch_size must be at least 1".to_owned(),
            ));
        }
        if config.flush_interval.is_zero() {
            return Err(ConsumerError::InvalidConfig(
                "flush_interval must not be zero".to_owned(),
            ));
        }
        if config.max_buffered_messages < config.max_batch_size {
            return Err(ConsumerError::InvalidConfig(format!(
                "max_buffered_messages ({}) must not be lower than max_batch_size ({})",
                config.max_buffered_messages, config.max_batch_size
            )));
        }

        Ok(Self {
            source,
            sink,
            config,
            liveness,
        })
    }

    /// Runs until `shutdown` flips to true, its sender is dropped, or the queue closes.
    /// Pending posts get one last flush attempt before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        info!(
            max_batch_size = self.config.max_batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            max_buffered_messages = self.config.max_buffered_messages,
            "Starting batching consumer loop"
        );

        let mut buffer = Buffer {
            posts: Vec::with_capacity(self.config.max_batch_size),
            offsets: PartitionOffsets::new(),
            retrying: false,
        };
        let mut deadline = Instant::now() + self.config.flush_interval;
        let mut stalled = false;
        let mut recv_errors: u32 = 0;
        // Set after a receive error, dequeuing resumes once it passes
        let mut resume_at: Option<Instant> = None;

        loop {
            let full = buffer.posts.len() >= self.config.max_buffered_messages;
            if full {
                if !stalled {
                    error!(
                        buffered = buffer.posts.len(),
                        "buffer is full and the sink keeps failing, pausing consumption"
                    );
                    stalled = true;
                }
                self.liveness.report_status(ComponentStatus::Unhealthy);
            } else {
                if stalled {
                    info!("buffer drained, resuming consumption");
                    stalled = false;
                }
                self.liveness.report_healthy();
            }
            gauge!("posts_consumer_buffered_posts").set(buffer.posts.len() as f64);

            if *shutdown.borrow() {
                info!("Shutdown signal received, stopping consumer loop");
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping consumer loop");
                        break;
                    }
                }

                _ = sleep_until(deadline) => {
                    if buffer.has_pending() {
                        if let Err(err) = self.flush(&mut buffer, "time").await {
                            error!(
                                buffered = buffer.posts.len(),
                                error = %err,
                                "failed to flush batch, keeping it for retry"
                            );
                        }
                    }
                    deadline = Instant::now() + self.config.flush_interval;
                }

                _ = sleep_until(resume_at.unwrap_or(deadline)), if resume_at.is_some() => {
                    resume_at = None;
                }

                received = self.source.recv(), if !full && resume_at.is_none() => {
                    match received {
                        Ok(message) => {
                            recv_errors = 0;
                            self.append(&mut buffer, message);

                            if !buffer.retrying && buffer.posts.len() >= self.config.max_batch_size {
                                if let Err(err) = self.flush(&mut buffer, "size").await {
                                    error!(
                                        buffered = buffer.posts.len(),
                                        error = %err,
                                        "failed to flush batch, keeping it for retry"
                                    );
                                }
                                deadline = Instant::now() + self.config.flush_interval;
                            }
                        }
                        Err(SourceError::Closed) => {
                            info!("queue closed, stopping consumer loop");
                            break;
                        }
                        Err(err) => {
                            recv_errors = recv_errors.saturating_add(1);
                            counter!("posts_consumer_recv_errors_total").increment(1);
                            warn!(error = %err, "failed to receive from the queue");
                            resume_at =
                                Some(Instant::now() + RECV_ERROR_BACKOFF * recv_errors.min(10));
                        }
                    }
                }
            }
        }

        if buffer.has_pending() {
            let count = buffer.posts.len();
            info!(count, "flushing pending posts before shutdown");
            if let Err(error) = self.flush(&mut buffer, "shutdown").await {
                error!(count, error = %error, "final flush failed, posts will be redelivered on restart");
                return Err(ConsumerError::FinalFlush { count, error });
            }
        }

        info!("Batching consumer loop stopped");
        Ok(())
    }

    fn append(&self, buffer: &mut Buffer, message: QueueMessage) {
        buffer.track(&message);

        match decode(&message) {
            Ok(post) => {
                counter!("posts_consumer_messages_total", "status" => "decoded").increment(1);
                buffer.posts.push(post);
            }
            Err(err) => {
                counter!("posts_consumer_messages_total", "status" => "dropped").increment(1);
                warn!(
                    partition = message.partition,
                    offset = message.offset,
                    error = %err,
                    "dropping malformed message"
                );
            }
        }
    }

    /// Writes the whole buffer in one call. On success the buffer is emptied and its offsets
    /// committed, on failure it is left untouched.
    async fn flush(&self, buffer: &mut Buffer, trigger: &'static str) -> Result<(), StoreError> {
        let count = buffer.posts.len();

        if count > 0 {
            let start = Instant::now();
            let result = self.sink.insert_many(&buffer.posts).await;
            histogram!("posts_consumer_flush_duration_seconds")
                .record(start.elapsed().as_secs_f64());

            if let Err(err) = result {
                counter!("posts_consumer_flushes_total", "trigger" => trigger, "result" => "failure")
                    .increment(1);
                buffer.retrying = true;
                return Err(err);
            }

            counter!("posts_consumer_flushes_total", "trigger" => trigger, "result" => "success")
                .increment(1);
            counter!("posts_consumer_flushed_posts_total").increment(count as u64);
            histogram!("posts_consumer_batch_size").record(count as f64);
            info!(count, trigger, "flushed batch");
            buffer.posts.clear();
        }
        buffer.retrying = false;

        if !buffer.offsets.is_empty() {
            match self.source.commit(&buffer.offsets).await {
                Ok(()) => {
                    debug!(offsets = ?buffer.offsets, "committed offsets");
                    buffer.offsets.clear();
                }
                Err(err) => {
                    // Kept for the next commit, a restart before it redelivers the batch
                    counter!("posts_consumer_commit_errors_total").increment(1);
                    warn!(error = %err, "failed to commit offsets");
                }
            }
        }

        Ok(())
    }
}

fn decode(message: &QueueMessage) -> Result<Post, DecodeError> {
    let payload = message.payload.as_deref().ok_or(DecodeError::EmptyPayload)?;
    if payload.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }
    Ok(serde_json::from_slice(payload)?)
}
