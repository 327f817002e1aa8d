//! Redpanda configuration.

use rskafka::client::partition::Compression;
use serde::{Deserialize, Serialize};

use crate::topics::TopicNames;

/// Redpanda connection, topic and consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedpandaConfig {
    /// Broker addresses
    pub brokers: Vec<String>,
    /// SASL username (Redpanda Cloud)
    #[serde(default)]
    pub sasl_username: Option<String>,
    /// SASL password (Redpanda Cloud)
    #[serde(default)]
    pub sasl_password: Option<String>,
    /// Compression type (none, gzip, snappy, lz4, zstd)
    #[serde(default = "default_compression")]
    pub compression: String,
    /// Topic names for each pipeline hop
    #[serde(default)]
    pub topics: TopicNames,
    /// Partitions for provisioned topics
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    /// Replication factor for provisioned topics
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i16,
    /// Admin request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

fn default_compression() -> String {
    "lz4".to_string()
}

fn default_partitions() -> i32 {
    6
}

fn default_replication_factor() -> i16 {
    3
}

fn default_request_timeout_ms() -> u64 {
    30000
}

impl Default for RedpandaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            sasl_username: None,
            sasl_password: None,
            compression: default_compression(),
            topics: TopicNames::default(),
            partitions: default_partitions(),
            replication_factor: default_replication_factor(),
            request_timeout_ms: default_request_timeout_ms(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl RedpandaConfig {
    /// Returns the broker list as a comma-separated string.
    pub fn broker_string(&self) -> String {
        self.brokers.join(",")
    }

    /// Returns SASL credentials when both halves are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.sasl_username, &self.sasl_password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    pub fn compression(&self) -> Compression {
        match self.compression.as_str() {
            "gzip" => Compression::Gzip,
            "snappy" => Compression::Snappy,
            "lz4" => Compression::Lz4,
            "zstd" => Compression::Zstd,
            _ => Compression::NoCompression,
        }
    }
}

/// Where a consumer starts when it first attaches to a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    /// Oldest retained record
    #[default]
    Earliest,
    /// Only records produced after the consumer attaches
    Latest,
}

/// Consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Name under which committed offsets are stored
    #[serde(default = "default_group")]
    pub group: String,
    /// Maximum messages handed to the handler per fetch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum time a fetch waits for new records, in milliseconds
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    /// Upper bound on bytes per fetch
    #[serde(default = "default_max_fetch_bytes")]
    pub max_fetch_bytes: i32,
    /// Start position for partitions with no stored commit
    #[serde(default)]
    pub start_from: StartOffset,
}

fn default_group() -> String {
    "table-backup".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    1000
}

fn default_max_fetch_bytes() -> i32 {
    1024 * 1024
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            max_fetch_bytes: default_max_fetch_bytes(),
            start_from: StartOffset::default(),
        }
    }
}
