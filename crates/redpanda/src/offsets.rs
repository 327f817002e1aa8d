//! Durable consumer positions.
//!
//! rskafka has no consumer-group commit, so each commit is written as a keyed
//! record (`group:topic:partition`) to an offsets topic. On startup a consumer
//! scans that topic for the newest record with its key and resumes there.
//! The topic is meant to be compacted so only the latest commit per key is
//! retained.

use std::sync::Arc;

use async_trait::async_trait;
use backup_core::{Error, Result, MESSAGE_TYPE_HEADER};
use chrono::{DateTime, Utc};
use rskafka::client::partition::{OffsetAt, UnknownTopicHandling};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::connect;
use crate::config::{RedpandaConfig, StartOffset};
use crate::partitioner::partition_hash;
use crate::producer::{MessagePublisher, OutboundMessage};
use crate::topics::topic_partitions;

/// Value of the message-type header on commit records.
pub const COMMIT_MESSAGE_TYPE: &str = "consumer_offset";

/// One commit as stored on the offsets topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub group: String,
    pub topic: String,
    pub partition: i32,
    /// Next offset to read
    pub offset: i64,
    pub committed_at: DateTime<Utc>,
}

impl CommitRecord {
    pub fn new(group: &str, topic: &str, partition: i32, offset: i64) -> Self {
        Self {
            group: group.to_string(),
            topic: topic.to_string(),
            partition,
            offset,
            committed_at: Utc::now(),
        }
    }

    pub fn key(&self) -> String {
        commit_key(&self.group, &self.topic, self.partition)
    }

    pub fn to_outbound(&self) -> Result<OutboundMessage> {
        Ok(OutboundMessage {
            key: self.key(),
            payload: serde_json::to_vec(self)?,
            headers: Default::default(),
        }
        .with_header(MESSAGE_TYPE_HEADER, COMMIT_MESSAGE_TYPE))
    }
}

pub fn commit_key(group: &str, topic: &str, partition: i32) -> String {
    format!("{}:{}:{}", group, topic, partition)
}

/// Newest offset recorded under `key`, reading records in log order.
///
/// Records with other keys or unreadable payloads are ignored.
pub fn latest_commit<'a, I>(key: &str, records: I) -> Option<i64>
where
    I: IntoIterator<Item = (Option<&'a [u8]>, Option<&'a [u8]>)>,
{
    records
        .into_iter()
        .filter(|(k, _)| *k == Some(key.as_bytes()))
        .filter_map(|(_, value)| serde_json::from_slice::<CommitRecord>(value?).ok())
        .map(|record| record.offset)
        .last()
}

/// Where a consumer starts reading a partition.
///
/// A stored commit wins, clamped into the retained range; otherwise the
/// configured start applies.
pub fn resolve_start(
    committed: Option<i64>,
    earliest: i64,
    latest: i64,
    start_from: StartOffset,
) -> i64 {
    match committed {
        Some(offset) => offset.clamp(earliest, latest.max(earliest)),
        None => match start_from {
            StartOffset::Earliest => earliest,
            StartOffset::Latest => latest,
        },
    }
}

/// Persistence for committed consumer positions.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Last committed offset for a partition, if any was stored.
    async fn load(&self, topic: &str, partition: i32) -> Result<Option<i64>>;

    /// Records that everything before `offset` is acknowledged.
    async fn store(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;
}

/// Offset store on a Redpanda topic, written through the shared producer.
pub struct TopicOffsetStore {
    config: RedpandaConfig,
    publisher: Arc<dyn MessagePublisher>,
}

impl TopicOffsetStore {
    pub fn new(config: RedpandaConfig, publisher: Arc<dyn MessagePublisher>) -> Self {
        Self { config, publisher }
    }

    fn group(&self) -> &str {
        &self.config.consumer.group
    }
}

#[async_trait]
impl OffsetStore for TopicOffsetStore {
    async fn load(&self, topic: &str, partition: i32) -> Result<Option<i64>> {
        let offsets_topic = &self.config.topics.offsets;
        let key = commit_key(self.group(), topic, partition);

        let partitions = topic_partitions(&self.config, offsets_topic).await?;
        let log_partition = partition_hash(&key, partitions.len() as i32);

        let client = connect(&self.config).await?;
        let log = client
            .partition_client(offsets_topic.clone(), log_partition, UnknownTopicHandling::Error)
            .await
            .map_err(|e| Error::bus(format!("Failed to open offsets topic: {}", e)))?;

        let mut next = log
            .get_offset(OffsetAt::Earliest)
            .await
            .map_err(|e| Error::bus(format!("Failed to get offset: {}", e)))?;
        let end = log
            .get_offset(OffsetAt::Latest)
            .await
            .map_err(|e| Error::bus(format!("Failed to get offset: {}", e)))?;

        let wait_ms = i32::try_from(self.config.consumer.batch_timeout_ms).unwrap_or(i32::MAX);
        let max_bytes = self.config.consumer.max_fetch_bytes.max(1024);
        let mut found = None;

        while next < end {
            let (records, _) = log
                .fetch_records(next, 1..max_bytes, wait_ms)
                .await
                .map_err(|e| Error::bus(format!("Failed to read offsets topic: {}", e)))?;
            let Some(last) = records.iter().map(|r| r.offset).max().filter(|&o| o >= next) else {
                break;
            };

            let pairs = records
                .iter()
                .filter(|r| r.offset >= next)
                .map(|r| (r.record.key.as_deref(), r.record.value.as_deref()));
            if let Some(offset) = latest_commit(&key, pairs) {
                found = Some(offset);
            }
            next = last + 1;
        }

        info!(
            topic = %topic,
            partition = partition,
            committed = ?found,
            "Loaded committed offset"
        );
        Ok(found)
    }

    async fn store(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let record = CommitRecord::new(self.group(), topic, partition, offset);
        self.publisher
            .publish(&self.config.topics.offsets, record.to_outbound()?)
            .await?;
        debug!(topic = %topic, partition = partition, offset = offset, "Stored commit");
        Ok(())
    }
}
