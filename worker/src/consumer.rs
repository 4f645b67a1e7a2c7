use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use shared::{dlq_name, JobEnvelope, RETRY_COUNT_HEADER};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::handlers::{Dispatcher, Outcome};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// What to do with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Requeue { retry_count: u32, delay: Duration },
    DeadLetter,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// `retry_count` is the value carried by the failed delivery. The Nth
    /// requeue carries count N and waits `base_delay * 2^N` beforehand;
    /// once the count reaches `max_retries` the message is dead-lettered.
    pub fn on_failure(&self, retry_count: u32) -> Disposition {
        if retry_count < self.max_retries {
            let next = retry_count + 1;
            Disposition::Requeue {
                retry_count: next,
                delay: self.base_delay * 2u32.pow(next),
            }
        } else {
            Disposition::DeadLetter
        }
    }
}

/// Repeats a publish attempt until it reports success, waiting `delay`
/// between tries. Offset commits are cumulative per partition: committing
/// any later message would also commit past a job whose requeue never
/// landed, dropping it. Blocking here keeps the job alive and matches the
/// consumer's backpressure posture.
async fn deliver_with_retries<F, Fut>(mut attempt: F, delay: Duration)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    while !attempt().await {
        sleep(delay).await;
    }
}

/// Consumes one queue, one message at a time, and applies the retry /
/// backoff / dead-letter policy uniformly around the dispatched handler.
pub struct Worker {
    queue: String,
    dispatcher: Dispatcher,
    producer: FutureProducer,
    policy: RetryPolicy,
}

impl Worker {
    pub fn new(queue: &str, dispatcher: Dispatcher, producer: FutureProducer) -> Self {
        Self {
            queue: queue.to_string(),
            dispatcher,
            producer,
            policy: RetryPolicy::default(),
        }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        info!(queue = %self.queue, "worker started");

        let mut stream = consumer.stream();
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(queue = %self.queue, "shutdown requested, stopping after current message");
                    break;
                }
                delivery = stream.next() => match delivery {
                    Some(Ok(message)) => {
                        self.handle_delivery(&message).await;
                        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                            error!(queue = %self.queue, "error committing message: {}", e);
                        }
                    }
                    Some(Err(e)) => {
                        // The broker redelivers anything uncommitted, so
                        // waiting out a connection error loses nothing.
                        error!(queue = %self.queue, "consume error: {}", e);
                        sleep(RECONNECT_DELAY).await;
                    }
                    None => break,
                }
            }
        }
    }

    /// Decides the fate of one delivery. By the time this returns, the
    /// message is safe to commit: handled, requeued, or dead-lettered.
    async fn handle_delivery(&self, message: &BorrowedMessage<'_>) {
        let body = message.payload().unwrap_or_default();

        match serde_json::from_slice::<JobEnvelope>(body) {
            Ok(envelope) => {
                info!(
                    job_id = %envelope.job_id,
                    trace_id = %envelope.trace_id,
                    task_name = %envelope.task_name,
                    "processing job"
                );
                match self.dispatcher.handle(&envelope).await {
                    Ok(Outcome::Completed) => {
                        info!(
                            job_id = %envelope.job_id,
                            trace_id = %envelope.trace_id,
                            "job completed"
                        );
                    }
                    Ok(Outcome::Rejected(reason)) => {
                        // Correctly evaluated, correctly refused. Not retried.
                        warn!(
                            job_id = %envelope.job_id,
                            trace_id = %envelope.trace_id,
                            "job rejected: {}",
                            reason
                        );
                    }
                    Err(e) => {
                        error!(
                            job_id = %envelope.job_id,
                            trace_id = %envelope.trace_id,
                            "job failed: {:#}",
                            e
                        );
                        self.retry_or_dead_letter(message, body).await;
                    }
                }
            }
            Err(e) => {
                error!(queue = %self.queue, "undecodable message: {}", e);
                self.retry_or_dead_letter(message, body).await;
            }
        }
    }

    async fn retry_or_dead_letter(&self, message: &BorrowedMessage<'_>, body: &[u8]) {
        match self.policy.on_failure(retry_count_of(message)) {
            Disposition::Requeue { retry_count, delay } => {
                // Deliberate blocking backoff: the consumer does nothing
                // else while a failing downstream dependency recovers.
                sleep(delay).await;

                let queue = self.queue.as_str();
                let producer = &self.producer;
                let key = message.key().unwrap_or_default();
                let header_value = retry_count.to_string();
                let header_value = &header_value;

                // The requeue must actually land before the original is
                // committed over; keep trying rather than lose the job.
                deliver_with_retries(
                    || async move {
                        let record = FutureRecord::to(queue)
                            .payload(body)
                            .key(key)
                            .headers(OwnedHeaders::new().insert(Header {
                                key: RETRY_COUNT_HEADER,
                                value: Some(header_value),
                            }));
                        match producer.send(record, PUBLISH_TIMEOUT).await {
                            Ok(_) => true,
                            Err((e, _)) => {
                                error!(queue, "failed to requeue message: {}", e);
                                false
                            }
                        }
                    },
                    RECONNECT_DELAY,
                )
                .await;

                info!(
                    queue = %self.queue,
                    "requeued message, retry {}/{}",
                    retry_count,
                    self.policy.max_retries
                );
            }
            Disposition::DeadLetter => {
                let dlq = dlq_name(&self.queue);
                let record = FutureRecord::to(&dlq)
                    .payload(body)
                    .key(message.key().unwrap_or_default());

                // The original is acked either way; dead letters wait in
                // the DLQ for an operator to drain.
                match self.producer.send(record, PUBLISH_TIMEOUT).await {
                    Ok(_) => error!(
                        queue = %self.queue,
                        "message moved to DLQ after {} retries",
                        self.policy.max_retries
                    ),
                    Err((e, _)) => error!(queue = %self.queue, "failed to publish to DLQ: {}", e),
                }
            }
        }
    }
}

fn retry_count_of(message: &BorrowedMessage<'_>) -> u32 {
    message
        .headers()
        .and_then(|headers| {
            headers
                .iter()
                .find(|h| h.key == RETRY_COUNT_HEADER)
                .and_then(|h| h.value)
        })
        .and_then(|value| std::str::from_utf8(value).ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}
