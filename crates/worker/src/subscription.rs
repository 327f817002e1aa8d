//! Subscription loop: the acknowledgment protocol every consuming stage
//! shares.
//!
//! 1. Fetch the next batch after the read cursor
//! 2. Add failed messages whose backoff has elapsed
//! 3. Decode, validate and dispatch everything concurrently
//! 4. Commit up to the lowest offset still unacknowledged
//!
//! A failing message is retried on its own; messages behind it keep flowing
//! and are never run again once acknowledged.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backup_core::{BusMessage, Error, Result};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use redpanda::{Delivery, MessagePublisher, MessageSource, Offset, OutboundMessage};
use telemetry::metrics;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Handles one decoded message. `Ok` acknowledges it; `Err` leaves it for
/// redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Message: BusMessage;

    async fn handle(&self, message: Self::Message) -> Result<()>;
}

/// Subscription settings.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Messages handled concurrently from one batch
    pub concurrency: usize,
    /// Pause before a failed message is delivered again
    pub redelivery_backoff: Duration,
    /// Pause after a fetch error
    pub error_backoff: Duration,
    /// Deliveries before dead-lettering (requires a dead-letter topic)
    pub max_deliveries: Option<u32>,
    /// Failed messages held for retry before fetching pauses
    pub max_pending_retries: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            redelivery_backoff: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            max_deliveries: None,
            max_pending_retries: 1000,
        }
    }
}

/// Per-message result of a dispatch.
#[derive(Debug)]
enum Disposition {
    Ack,
    Retry(Error),
}

/// Tracks delivered offsets of one partition and how far the committed
/// offset may advance.
///
/// Offsets are outstanding from delivery until acknowledged. The commit
/// point is the lowest outstanding offset, or one past the highest delivered
/// offset when nothing is outstanding.
#[derive(Debug, Clone, Default)]
pub struct AckTracker {
    /// First offset ever delivered; nothing before it is ours to commit
    floor: Option<i64>,
    /// One past the highest delivered offset
    high_water: Option<i64>,
    outstanding: BTreeSet<i64>,
    committed: Option<i64>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a first delivery of `offset`.
    pub fn delivered(&mut self, offset: i64) {
        self.floor = Some(self.floor.map_or(offset, |f| f.min(offset)));
        self.high_water = Some(self.high_water.map_or(offset + 1, |h| h.max(offset + 1)));
        self.outstanding.insert(offset);
    }

    pub fn ack(&mut self, offset: i64) {
        self.outstanding.remove(&offset);
    }

    /// Whether `offset` falls inside the delivered range.
    pub fn has_seen(&self, offset: i64) -> bool {
        match (self.floor, self.high_water) {
            (Some(floor), Some(high)) => offset >= floor && offset < high,
            _ => false,
        }
    }

    pub fn is_outstanding(&self, offset: i64) -> bool {
        self.outstanding.contains(&offset)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Next offset to commit: the lowest unacknowledged offset.
    pub fn commit_offset(&self) -> Option<i64> {
        self.outstanding.first().copied().or(self.high_water)
    }

    /// The commit offset, if it moved past the last commit.
    pub fn pending_commit(&self) -> Option<i64> {
        let next = self.commit_offset()?;
        let base = self.committed.or(self.floor)?;
        (next > base).then_some(next)
    }

    pub fn mark_committed(&mut self, offset: i64) {
        self.committed = Some(offset);
    }
}

/// Result of processing one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Messages dispatched, fresh and retried
    pub delivered: usize,
    pub acked: usize,
    /// Messages that failed and will be delivered again
    pub redelivered: usize,
}

/// A failed delivery waiting for its backoff.
#[derive(Debug)]
struct PendingRetry {
    delivery: Delivery,
    due: Instant,
}

#[derive(Debug, Default)]
struct PartitionState {
    tracker: AckTracker,
    retries: BTreeMap<i64, PendingRetry>,
    /// Failed deliveries per offset, for the dead-letter budget
    attempts: HashMap<i64, u32>,
}

/// Consumes one partition and feeds a handler.
pub struct Subscription<H: MessageHandler> {
    source: Arc<dyn MessageSource>,
    handler: Arc<H>,
    config: SubscriptionConfig,
    dead_letter: Option<(Arc<dyn MessagePublisher>, String)>,
    state: Mutex<PartitionState>,
}

impl<H: MessageHandler> Subscription<H> {
    pub fn new(source: Arc<dyn MessageSource>, handler: Arc<H>, config: SubscriptionConfig) -> Self {
        Self {
            source,
            handler,
            config,
            dead_letter: None,
            state: Mutex::new(PartitionState::default()),
        }
    }

    /// Routes messages that exhaust `max_deliveries` to `topic`.
    pub fn with_dead_letter(mut self, publisher: Arc<dyn MessagePublisher>, topic: impl Into<String>) -> Self {
        self.dead_letter = Some((publisher, topic.into()));
        self
    }

    /// Failed messages currently waiting for another delivery.
    pub fn pending_retries(&self) -> usize {
        self.state.lock().retries.len()
    }

    /// Main run loop. Returns once `shutdown` flips to true; a batch in
    /// progress is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            topic = %self.source.topic(),
            partition = self.source.partition(),
            message_type = H::Message::MESSAGE_TYPE,
            concurrency = self.config.concurrency,
            "Subscription starting"
        );

        while !*shutdown.borrow() {
            let pause = match self.process_batch().await {
                Ok(outcome) if outcome.delivered == 0 => self.until_next_retry(),
                Ok(_) => None,
                Err(e) => {
                    error!(
                        topic = %self.source.topic(),
                        partition = self.source.partition(),
                        "Batch processing error: {}", e
                    );
                    self.source.reset_connection().await;
                    Some(self.config.error_backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!(
            topic = %self.source.topic(),
            partition = self.source.partition(),
            pending_retries = self.pending_retries(),
            "Subscription stopped"
        );
    }

    /// Time until the earliest retry is due, capped at the redelivery
    /// backoff. `None` when nothing is waiting.
    fn until_next_retry(&self) -> Option<Duration> {
        let state = self.state.lock();
        let due = state.retries.values().map(|r| r.due).min()?;
        Some(
            due.saturating_duration_since(Instant::now())
                .min(self.config.redelivery_backoff),
        )
    }

    /// Processes a single batch: fetch → dispatch → commit.
    pub async fn process_batch(&self) -> Result<BatchOutcome> {
        let backlog_full = self.pending_retries() >= self.config.max_pending_retries.max(1);
        let fresh = if backlog_full {
            debug!(
                topic = %self.source.topic(),
                partition = self.source.partition(),
                "Retry backlog full, not fetching"
            );
            Vec::new()
        } else {
            self.source.fetch().await?
        };

        let batch: Vec<Delivery> = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let due: Vec<i64> = state
                .retries
                .iter()
                .filter(|(_, retry)| retry.due <= now)
                .map(|(&offset, _)| offset)
                .collect();
            let mut batch: Vec<Delivery> = due
                .into_iter()
                .filter_map(|offset| state.retries.remove(&offset))
                .map(|retry| retry.delivery)
                .collect();

            for delivery in fresh {
                // A rewound source may hand out offsets already acked or
                // already waiting for retry
                if state.tracker.has_seen(delivery.offset) {
                    continue;
                }
                state.tracker.delivered(delivery.offset);
                batch.push(delivery);
            }
            batch
        };

        let mut outcome = BatchOutcome {
            delivered: batch.len(),
            ..Default::default()
        };

        if !batch.is_empty() {
            let dispatches: Vec<_> = batch.into_iter().map(|d| self.dispatch(d)).collect();
            let results: Vec<(Delivery, Disposition)> = stream::iter(dispatches)
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

            let mut state = self.state.lock();
            let due = Instant::now() + self.config.redelivery_backoff;
            for (delivery, disposition) in results {
                match disposition {
                    Disposition::Ack => {
                        state.tracker.ack(delivery.offset);
                        state.attempts.remove(&delivery.offset);
                        outcome.acked += 1;
                    }
                    Disposition::Retry(e) => {
                        debug!(offset = delivery.offset, error = %e, "Message left for redelivery");
                        state
                            .retries
                            .insert(delivery.offset, PendingRetry { delivery, due });
                        outcome.redelivered += 1;
                    }
                }
            }
        }

        self.commit_progress().await?;

        metrics().messages_acked.inc_by(outcome.acked as u64);
        metrics().messages_redelivered.inc_by(outcome.redelivered as u64);

        if outcome.redelivered > 0 {
            warn!(
                topic = %self.source.topic(),
                partition = self.source.partition(),
                acked = outcome.acked,
                redelivered = outcome.redelivered,
                pending_retries = self.pending_retries(),
                "Batch partially acknowledged"
            );
        }

        Ok(outcome)
    }

    /// Commits the acknowledged prefix if it grew. A failed commit is
    /// retried after the next batch.
    async fn commit_progress(&self) -> Result<()> {
        let Some(next) = self.state.lock().tracker.pending_commit() else {
            return Ok(());
        };
        self.source
            .commit(Offset {
                partition: self.source.partition(),
                offset: next,
            })
            .await?;
        self.state.lock().tracker.mark_committed(next);
        Ok(())
    }

    async fn dispatch(&self, delivery: Delivery) -> (Delivery, Disposition) {
        let message = match H::Message::decode(delivery.payload()) {
            Ok(message) => message,
            Err(e) => {
                // Poison: redelivery cannot fix a payload
                metrics().messages_poisoned.inc();
                warn!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %e,
                    "Dropping undecodable message"
                );
                let disposition = match self.dead_letter {
                    Some(_) => self.send_to_dead_letter(&delivery, &e).await,
                    None => Disposition::Ack,
                };
                return (delivery, disposition);
            }
        };

        let span = tracing::info_span!(
            "message",
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            key = %message.key(),
        );

        metrics().handlers_in_flight.inc();
        let result = self.handler.handle(message).instrument(span).await;
        metrics().handlers_in_flight.dec();

        let disposition = match result {
            Ok(()) => Disposition::Ack,
            Err(e) => self.on_failure(&delivery, e).await,
        };
        (delivery, disposition)
    }

    async fn on_failure(&self, delivery: &Delivery, error: Error) -> Disposition {
        let attempts = {
            let mut state = self.state.lock();
            let count = state.attempts.entry(delivery.offset).or_insert(0);
            *count += 1;
            *count
        };

        warn!(
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            attempt = attempts,
            error = %error,
            "Handler failed"
        );

        match self.config.max_deliveries {
            Some(max) if attempts >= max && self.dead_letter.is_some() => {
                self.send_to_dead_letter(delivery, &error).await
            }
            _ => Disposition::Retry(error),
        }
    }

    async fn send_to_dead_letter(&self, delivery: &Delivery, error: &Error) -> Disposition {
        let Some((ref publisher, ref topic)) = self.dead_letter else {
            return Disposition::Retry(Error::internal("no dead-letter topic configured"));
        };

        let key = delivery
            .key
            .as_deref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default();
        let mut message = OutboundMessage {
            key,
            payload: delivery.payload().to_vec(),
            headers: delivery.headers.clone(),
        }
        .with_header("dlq-source-topic", delivery.topic.as_bytes())
        .with_header("dlq-source-partition", delivery.partition.to_string())
        .with_header("dlq-source-offset", delivery.offset.to_string())
        .with_header("dlq-error", error.to_string());
        let attempts = self.state.lock().attempts.get(&delivery.offset).copied();
        if let Some(count) = attempts {
            message = message.with_header("dlq-attempts", count.to_string());
        }

        match publisher.publish(topic, message).await {
            Ok(()) => {
                metrics().messages_dead_lettered.inc();
                warn!(
                    source_topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    dead_letter_topic = %topic,
                    "Message dead-lettered"
                );
                Disposition::Ack
            }
            Err(e) => {
                error!(dead_letter_topic = %topic, "Failed to dead-letter message: {}", e);
                Disposition::Retry(e)
            }
        }
    }
}
