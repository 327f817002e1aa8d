//! Topic names and idempotent provisioning.

use backup_core::{Error, Result};
use rskafka::client::error::{Error as ClientError, ProtocolError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::connect;
use crate::config::RedpandaConfig;

/// Topic names for each hop of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicNames {
    /// Scanner → staleness checker (`ProjectDiscovered`)
    #[serde(default = "default_projects_topic")]
    pub projects: String,
    /// Staleness checker → backup executor (`TableDueForBackup`)
    #[serde(default = "default_backups_topic")]
    pub backups: String,
    /// Messages that exhausted their delivery budget
    #[serde(default)]
    pub dead_letter: Option<String>,
    /// Committed consumer positions; should be compacted
    #[serde(default = "default_offsets_topic")]
    pub offsets: String,
}

fn default_projects_topic() -> String {
    "check-project-tables".to_string()
}

fn default_backups_topic() -> String {
    "run-bq-backup-to-cs".to_string()
}

fn default_offsets_topic() -> String {
    "table-backup-offsets".to_string()
}

impl Default for TopicNames {
    fn default() -> Self {
        Self {
            projects: default_projects_topic(),
            backups: default_backups_topic(),
            dead_letter: None,
            offsets: default_offsets_topic(),
        }
    }
}

impl TopicNames {
    /// All configured topics, for provisioning and health checks.
    pub fn all(&self) -> Vec<&str> {
        let mut topics = vec![
            self.projects.as_str(),
            self.backups.as_str(),
            self.offsets.as_str(),
        ];
        if let Some(ref dlq) = self.dead_letter {
            topics.push(dlq.as_str());
        }
        topics
    }
}

/// Creates every configured topic that does not exist yet.
///
/// Run once at process start; an existing topic counts as success.
pub async fn ensure_topics(config: &RedpandaConfig) -> Result<()> {
    let client = connect(config).await?;
    let controller = client
        .controller_client()
        .map_err(|e| Error::bus(format!("Failed to get controller client: {}", e)))?;

    let timeout_ms = i32::try_from(config.request_timeout_ms).unwrap_or(i32::MAX);

    for topic in config.topics.all() {
        // One partition keeps the startup scan of commits to a single log
        let partitions = if topic == config.topics.offsets {
            1
        } else {
            config.partitions
        };
        match controller
            .create_topic(
                topic,
                partitions,
                config.replication_factor,
                timeout_ms,
            )
            .await
        {
            Ok(()) => {
                info!(
                    topic = topic,
                    partitions = partitions,
                    replication_factor = config.replication_factor,
                    "Created topic"
                );
            }
            Err(ClientError::ServerError {
                protocol_error: ProtocolError::TopicAlreadyExists,
                ..
            }) => {
                debug!(topic = topic, "Topic already exists");
            }
            Err(e) => {
                return Err(Error::bus(format!(
                    "Failed to create topic {}: {}",
                    topic, e
                )));
            }
        }
    }

    Ok(())
}

/// Lists the partitions of a topic.
pub async fn topic_partitions(config: &RedpandaConfig, topic: &str) -> Result<Vec<i32>> {
    let client = connect(config).await?;
    let topics = client
        .list_topics()
        .await
        .map_err(|e| Error::bus(format!("Failed to list topics: {}", e)))?;

    topics
        .into_iter()
        .find(|t| t.name == topic)
        .map(|t| t.partitions.into_iter().collect())
        .ok_or_else(|| Error::bus(format!("Unknown topic: {}", topic)))
}
