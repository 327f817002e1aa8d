//! Wire messages exchanged between pipeline stages.
//!
//! | Topic   | Message             | Producer          | Consumer          |
//! |---------|---------------------|-------------------|-------------------|
//! | project | `ProjectDiscovered` | scanner           | staleness checker |
//! | backup  | `TableDueForBackup` | staleness checker | backup executor   |
//!
//! Payloads are JSON. Every message carries a partition key so duplicates
//! of the same unit of work land on the same partition.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{Error, Result};
use crate::model::{validate_project_id, TableMetadata, TableRef};

/// Record header carrying the message type.
pub const MESSAGE_TYPE_HEADER: &str = "message-type";

/// A message that can travel on the bus.
pub trait BusMessage: Serialize + DeserializeOwned + Validate + Send + Sync + 'static {
    /// Value of the `message-type` header.
    const MESSAGE_TYPE: &'static str;

    /// Partition key.
    fn key(&self) -> String;

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes and validates a payload.
    fn decode(payload: &[u8]) -> Result<Self> {
        let message: Self = serde_json::from_slice(payload)?;
        message
            .validate()
            .map_err(|e| Error::validation(format!("{}: {}", Self::MESSAGE_TYPE, e)))?;
        Ok(message)
    }
}

/// Emitted once per project per scan run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ProjectDiscovered {
    #[validate(length(min = 1, max = 128), custom(function = "validate_project_id"))]
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
}

impl ProjectDiscovered {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            organization_id: None,
        }
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }
}

impl BusMessage for ProjectDiscovered {
    const MESSAGE_TYPE: &'static str = "project_discovered";

    fn key(&self) -> String {
        self.project_id.clone()
    }
}

/// Emitted once per table modified inside the lookback window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct TableDueForBackup {
    #[serde(flatten)]
    #[validate(nested)]
    pub table_ref: TableRef,
    /// Modification time observed by the checker (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl TableDueForBackup {
    pub fn new(table_ref: TableRef) -> Self {
        Self {
            table_ref,
            last_modified_at: None,
        }
    }
}

impl From<TableMetadata> for TableDueForBackup {
    fn from(metadata: TableMetadata) -> Self {
        Self {
            table_ref: metadata.table_ref,
            last_modified_at: Some(metadata.last_modified_at),
        }
    }
}

impl BusMessage for TableDueForBackup {
    const MESSAGE_TYPE: &'static str = "table_due_for_backup";

    fn key(&self) -> String {
        self.table_ref.to_string()
    }
}
