//! Stage scheduler: one subscription task per partition plus a periodic
//! metrics log.

use std::sync::Arc;
use std::time::Duration;

use backup_core::Result;
use redpanda::{
    topic_partitions, Consumer, MessagePublisher, MessageSource, OffsetStore, RedpandaConfig,
    TopicOffsetStore,
};
use telemetry::metrics;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::info;

use crate::config::PipelineConfig;
use crate::subscription::{MessageHandler, Subscription};

/// Starts consuming stages against Redpanda.
pub struct StageScheduler {
    redpanda: RedpandaConfig,
    pipeline: PipelineConfig,
    publisher: Arc<dyn MessagePublisher>,
}

impl StageScheduler {
    pub fn new(
        redpanda: RedpandaConfig,
        pipeline: PipelineConfig,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Self {
            redpanda,
            pipeline,
            publisher,
        }
    }

    /// Subscribes `handler` to every partition of `topic`. Tasks stop when
    /// `shutdown` flips to true.
    pub async fn start<H>(
        &self,
        topic: &str,
        handler: Arc<H>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>>
    where
        H: MessageHandler + 'static,
    {
        let partitions = topic_partitions(&self.redpanda, topic).await?;
        let dead_letter = match (self.pipeline.max_deliveries, &self.redpanda.topics.dead_letter) {
            (Some(_), Some(topic)) => Some(topic.clone()),
            _ => None,
        };

        let offsets: Arc<dyn OffsetStore> = Arc::new(TopicOffsetStore::new(
            self.redpanda.clone(),
            self.publisher.clone(),
        ));

        let mut handles = Vec::with_capacity(partitions.len() + 1);
        for partition in &partitions {
            let source: Arc<dyn MessageSource> = Arc::new(
                Consumer::new(self.redpanda.clone(), topic, *partition)
                    .with_offset_store(offsets.clone()),
            );
            let mut subscription =
                Subscription::new(source, handler.clone(), self.pipeline.subscription());
            if let Some(ref dead_letter) = dead_letter {
                subscription = subscription.with_dead_letter(self.publisher.clone(), dead_letter);
            }

            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                subscription.run(shutdown).await;
            }));
        }

        handles.push(spawn_metrics_logger(
            self.pipeline.metrics_log_interval(),
            shutdown,
        ));

        info!(
            topic = %topic,
            partitions = partitions.len(),
            dead_letter = dead_letter.as_deref().unwrap_or("none"),
            offsets_topic = %self.redpanda.topics.offsets,
            "Stage started"
        );
        Ok(handles)
    }
}

/// Logs a metrics snapshot every `every` until shutdown.
pub fn spawn_metrics_logger(every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => log_metrics(),
                _ = shutdown.changed() => {
                    log_metrics();
                    return;
                }
            }
        }
    })
}

pub fn log_metrics() {
    let m = metrics().snapshot();
    info!(
        projects_published = m.projects_published,
        tables_checked = m.tables_checked,
        tables_due = m.tables_due,
        metadata_errors = m.metadata_errors,
        exports_succeeded = m.exports_succeeded,
        exports_failed = m.exports_failed,
        exports_timed_out = m.exports_timed_out,
        messages_acked = m.messages_acked,
        messages_redelivered = m.messages_redelivered,
        messages_poisoned = m.messages_poisoned,
        messages_dead_lettered = m.messages_dead_lettered,
        publish_errors = m.publish_errors,
        consumer_lag = m.consumer_lag,
        export_latency_mean_ms = m.export_latency_mean_ms,
        "Pipeline metrics"
    );
}
