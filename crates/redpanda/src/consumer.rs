//! Redpanda partition consumer.
//!
//! Uses rskafka for Kafka-compatible message consumption with:
//! - A read cursor that moves forward on every fetch
//! - A committed offset, persisted through an [`OffsetStore`], that only
//!   moves when the subscriber acknowledges a contiguous prefix
//! - Resumption at the committed offset after a restart

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backup_core::{Error, Result};
use rskafka::client::error::{Error as ClientError, ProtocolError};
use rskafka::client::partition::{OffsetAt, PartitionClient, UnknownTopicHandling};
use telemetry::metrics;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::client::connect;
use crate::config::RedpandaConfig;
use crate::offsets::{resolve_start, OffsetStore};

/// Offset tracking for manual commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset {
    pub partition: i32,
    /// Next offset to read
    pub offset: i64,
}

/// One message handed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: BTreeMap<String, Vec<u8>>,
}

impl Delivery {
    /// Payload bytes; tombstones read as empty.
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }
}

/// Consuming side of the bus, one partition at a time.
///
/// `fetch` reads forward from a cursor that starts at the last committed
/// offset. Holding back failed messages is the subscriber's job; after a
/// restart everything past the last commit is delivered again.
#[async_trait]
pub trait MessageSource: Send + Sync {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// Fetches the next batch after the read cursor and advances it.
    async fn fetch(&self) -> Result<Vec<Delivery>>;

    /// Acknowledges everything before `offset.offset`.
    async fn commit(&self, offset: Offset) -> Result<()>;

    /// Drops any cached connection (for error recovery).
    async fn reset_connection(&self) {}
}

/// Consumer for one partition of one topic.
pub struct Consumer {
    config: RedpandaConfig,
    topic: String,
    partition: i32,
    partition_client: RwLock<Option<Arc<PartitionClient>>>,
    offsets: Option<Arc<dyn OffsetStore>>,
    /// Next offset to fetch
    read_offset: AtomicI64,
    /// Everything before this offset is acknowledged
    committed_offset: AtomicI64,
    /// Whether the start offset has been resolved
    initialized: AtomicBool,
}

impl Consumer {
    /// Creates a new consumer. The connection is opened on first fetch.
    pub fn new(config: RedpandaConfig, topic: impl Into<String>, partition: i32) -> Self {
        let topic = topic.into();
        info!(
            topic = %topic,
            partition = partition,
            batch_size = config.consumer.batch_size,
            start_from = ?config.consumer.start_from,
            "Creating Redpanda consumer"
        );

        Self {
            config,
            topic,
            partition,
            partition_client: RwLock::new(None),
            offsets: None,
            read_offset: AtomicI64::new(-1),
            committed_offset: AtomicI64::new(-1),
            initialized: AtomicBool::new(false),
        }
    }

    /// Persists commits to `store` and resumes from it on first connect.
    pub fn with_offset_store(mut self, store: Arc<dyn OffsetStore>) -> Self {
        self.offsets = Some(store);
        self
    }

    /// Initializes the consumer connection.
    async fn ensure_connected(&self) -> Result<Arc<PartitionClient>> {
        // Check if already connected
        {
            let client = self.partition_client.read().await;
            if let Some(ref c) = *client {
                return Ok(c.clone());
            }
        }

        let client = connect(&self.config).await?;
        let partition_client = client
            .partition_client(
                self.topic.clone(),
                self.partition,
                UnknownTopicHandling::Error,
            )
            .await
            .map_err(|e| Error::bus(format!("Failed to get partition client: {}", e)))?;

        let partition_client = Arc::new(partition_client);

        if !self.initialized.load(Ordering::SeqCst) {
            let committed = match self.offsets {
                Some(ref store) => store.load(&self.topic, self.partition).await?,
                None => None,
            };
            let earliest = partition_client
                .get_offset(OffsetAt::Earliest)
                .await
                .map_err(|e| Error::bus(format!("Failed to get offset: {}", e)))?;
            let latest = partition_client
                .get_offset(OffsetAt::Latest)
                .await
                .map_err(|e| Error::bus(format!("Failed to get offset: {}", e)))?;
            let offset = resolve_start(
                committed,
                earliest,
                latest,
                self.config.consumer.start_from,
            );

            self.read_offset.store(offset, Ordering::SeqCst);
            self.committed_offset.store(offset, Ordering::SeqCst);
            self.initialized.store(true, Ordering::SeqCst);

            info!(
                topic = %self.topic,
                partition = self.partition,
                offset = offset,
                resumed = committed.is_some(),
                "Consumer initialized at offset"
            );
        }

        // Cache client
        {
            let mut client_guard = self.partition_client.write().await;
            *client_guard = Some(partition_client.clone());
        }

        Ok(partition_client)
    }

    /// Moves the read cursor to the earliest retained record after it fell
    /// out of retention.
    async fn rewind_to_earliest(&self, client: &PartitionClient) -> Result<()> {
        let earliest = client
            .get_offset(OffsetAt::Earliest)
            .await
            .map_err(|e| Error::bus(format!("Failed to get offset: {}", e)))?;
        let prev = self.read_offset.swap(earliest, Ordering::SeqCst);
        warn!(
            topic = %self.topic,
            partition = self.partition,
            prev_offset = prev,
            new_offset = earliest,
            "Read offset out of range, rewinding to earliest"
        );
        Ok(())
    }

    /// Next offset to fetch.
    pub fn read_offset(&self) -> i64 {
        self.read_offset.load(Ordering::SeqCst)
    }

    /// Last acknowledged position.
    pub fn committed_offset(&self) -> i64 {
        self.committed_offset.load(Ordering::SeqCst)
    }

    /// Checks if the consumer is healthy.
    pub async fn health_check(&self) -> bool {
        match self.ensure_connected().await {
            Ok(_) => true,
            Err(e) => {
                error!("Consumer health check failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl MessageSource for Consumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    /// Blocks until records are available or the batch timeout expires.
    async fn fetch(&self) -> Result<Vec<Delivery>> {
        let client = self.ensure_connected().await?;

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(self.config.consumer.batch_timeout_ms);
        let max_bytes = self.config.consumer.max_fetch_bytes.max(1024);
        let current = self.read_offset.load(Ordering::SeqCst);

        let (records, high_watermark) = match client
            .fetch_records(current, 1..max_bytes, timeout.as_millis() as i32)
            .await
        {
            Ok(result) => result,
            Err(ClientError::ServerError {
                protocol_error: ProtocolError::OffsetOutOfRange,
                ..
            }) => {
                self.rewind_to_earliest(&client).await?;
                return Ok(Vec::new());
            }
            Err(e) => {
                error!(topic = %self.topic, partition = self.partition, "Fetch error: {}", e);
                return Err(Error::bus(format!("Failed to fetch records: {}", e)));
            }
        };

        let mut deliveries: Vec<Delivery> = records
            .into_iter()
            .filter(|r| r.offset >= current)
            .map(|r| Delivery {
                topic: self.topic.clone(),
                partition: self.partition,
                offset: r.offset,
                key: r.record.key,
                payload: r.record.value,
                headers: r.record.headers,
            })
            .collect();
        deliveries.sort_by_key(|d| d.offset);
        deliveries.truncate(self.config.consumer.batch_size.max(1));

        if let Some(last) = deliveries.last() {
            self.read_offset.store(last.offset + 1, Ordering::SeqCst);
            metrics().messages_consumed.inc_by(deliveries.len() as u64);
            metrics()
                .consumer_lag
                .set((high_watermark - last.offset - 1).max(0) as u64);

            debug!(
                topic = %self.topic,
                partition = self.partition,
                count = deliveries.len(),
                offset_start = current,
                offset_end = last.offset,
                latency_ms = %start.elapsed().as_millis(),
                "Fetched batch from Redpanda"
            );
        }

        Ok(deliveries)
    }

    /// Commits an offset after successful processing.
    ///
    /// The commit is written to the offset store before it takes effect
    /// locally; a failed write leaves the previous commit in place.
    async fn commit(&self, offset: Offset) -> Result<()> {
        if let Some(ref store) = self.offsets {
            store.store(&self.topic, self.partition, offset.offset).await?;
        }
        let prev = self.committed_offset.swap(offset.offset, Ordering::SeqCst);

        debug!(
            topic = %self.topic,
            partition = offset.partition,
            prev_offset = prev,
            new_offset = offset.offset,
            "Committed offset"
        );

        Ok(())
    }

    async fn reset_connection(&self) {
        let mut client = self.partition_client.write().await;
        *client = None;
        info!(topic = %self.topic, partition = self.partition, "Consumer connection reset");
    }
}
