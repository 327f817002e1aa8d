//! Keyed Redpanda producer using rskafka.
//!
//! Every publish is awaited until the broker acknowledges it: a stage only
//! acknowledges its own input after all of its outputs are durable.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use backup_core::{BusMessage, Error, Result, MESSAGE_TYPE_HEADER};
use chrono::Utc;
use rskafka::client::partition::{PartitionClient, UnknownTopicHandling};
use rskafka::client::Client;
use rskafka::record::Record;
use telemetry::metrics;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::client::connect;
use crate::config::RedpandaConfig;
use crate::partitioner::partition_hash;

/// A message ready to be written to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, Vec<u8>>,
}

impl OutboundMessage {
    /// Encodes a bus message with its key and type header.
    pub fn encode<M: BusMessage>(message: &M) -> Result<Self> {
        let mut headers = BTreeMap::new();
        headers.insert(
            MESSAGE_TYPE_HEADER.to_string(),
            M::MESSAGE_TYPE.as_bytes().to_vec(),
        );
        Ok(Self {
            key: message.key(),
            payload: message.encode()?,
            headers,
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Publishing side of the bus.
///
/// Stages hold a long-lived `Arc<dyn MessagePublisher>`; tests substitute an
/// in-memory bus.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Writes one message and waits for the broker to accept it.
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<()>;

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Encodes and publishes a typed message.
pub async fn publish_message<M: BusMessage>(
    publisher: &dyn MessagePublisher,
    topic: &str,
    message: &M,
) -> Result<()> {
    let outbound = OutboundMessage::encode(message)?;
    publisher.publish(topic, outbound).await
}

/// Producer writing keyed records to Redpanda.
pub struct Producer {
    config: RedpandaConfig,
    client: RwLock<Option<Arc<Client>>>,
    /// Partition count per topic
    partition_counts: RwLock<BTreeMap<String, i32>>,
    /// Cached partition clients per `topic:partition`
    clients: RwLock<BTreeMap<String, Arc<PartitionClient>>>,
}

impl Producer {
    /// Creates a new producer. Connections are opened lazily.
    pub fn new(config: RedpandaConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            partition_counts: RwLock::new(BTreeMap::new()),
            clients: RwLock::new(BTreeMap::new()),
        }
    }

    async fn cluster_client(&self) -> Result<Arc<Client>> {
        {
            let client = self.client.read().await;
            if let Some(ref c) = *client {
                return Ok(c.clone());
            }
        }

        let client = Arc::new(connect(&self.config).await?);
        *self.client.write().await = Some(client.clone());
        Ok(client)
    }

    async fn partition_count(&self, topic: &str) -> Result<i32> {
        if let Some(count) = self.partition_counts.read().await.get(topic) {
            return Ok(*count);
        }

        let client = self.cluster_client().await?;
        let topics = client
            .list_topics()
            .await
            .map_err(|e| Error::bus(format!("Failed to list topics: {}", e)))?;

        let count = topics
            .iter()
            .find(|t| t.name == topic)
            .map(|t| t.partitions.len() as i32)
            .ok_or_else(|| Error::bus(format!("Unknown topic: {}", topic)))?;

        self.partition_counts
            .write()
            .await
            .insert(topic.to_string(), count);
        Ok(count)
    }

    /// Gets or creates a partition client for a topic.
    async fn get_client(&self, topic: &str, partition: i32) -> Result<Arc<PartitionClient>> {
        let key = format!("{}:{}", topic, partition);

        // Check cache first
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(&key) {
                return Ok(client.clone());
            }
        }

        let client = self.cluster_client().await?;
        let partition_client = client
            .partition_client(topic.to_string(), partition, UnknownTopicHandling::Error)
            .await
            .map_err(|e| Error::bus(format!("Failed to get partition client: {}", e)))?;

        let partition_client = Arc::new(partition_client);
        self.clients
            .write()
            .await
            .insert(key, partition_client.clone());

        Ok(partition_client)
    }

    /// Drops cached connections so the next publish reconnects.
    pub async fn reset_connection(&self) {
        *self.client.write().await = None;
        self.clients.write().await.clear();
        self.partition_counts.write().await.clear();
    }
}

#[async_trait]
impl MessagePublisher for Producer {
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<()> {
        let start = std::time::Instant::now();

        let partitions = self.partition_count(topic).await?;
        let partition = partition_hash(&message.key, partitions);
        let client = self.get_client(topic, partition).await?;

        let record = Record {
            key: Some(message.key.into_bytes()),
            value: Some(message.payload),
            headers: message.headers,
            timestamp: Utc::now(),
        };

        match client.produce(vec![record], self.config.compression()).await {
            Ok(offsets) => {
                metrics().messages_published.inc();
                metrics()
                    .publish_latency_ms
                    .observe(start.elapsed().as_millis() as u64);

                debug!(
                    topic = %topic,
                    partition = partition,
                    offset = ?offsets.first(),
                    latency_ms = %start.elapsed().as_millis(),
                    "Published message"
                );
                Ok(())
            }
            Err(e) => {
                error!(topic = %topic, partition = partition, "Failed to publish: {}", e);
                metrics().publish_errors.inc();
                self.reset_connection().await;
                Err(Error::publish(format!("Failed to produce to {}: {}", topic, e)))
            }
        }
    }

    fn is_healthy(&self) -> bool {
        telemetry::health().bus.is_healthy()
    }
}
