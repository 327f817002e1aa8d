//! Domain model for the backup pipeline.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::destination::DestinationConfig;
use crate::limits::{DATASET_ID_PATTERN, PROJECT_ID_PATTERN, TABLE_ID_PATTERN};

static PROJECT_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PROJECT_ID_PATTERN).expect("invalid project id pattern"));
static DATASET_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DATASET_ID_PATTERN).expect("invalid dataset id pattern"));
static TABLE_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(TABLE_ID_PATTERN).expect("invalid table id pattern"));

fn pattern_error(code: &'static str, value: &str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(format!("invalid identifier: {:?}", value).into());
    err
}

pub(crate) fn validate_project_id(value: &str) -> Result<(), ValidationError> {
    if PROJECT_ID_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(pattern_error("project_id", value))
    }
}

pub(crate) fn validate_dataset_id(value: &str) -> Result<(), ValidationError> {
    if DATASET_ID_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(pattern_error("dataset_id", value))
    }
}

pub(crate) fn validate_table_id(value: &str) -> Result<(), ValidationError> {
    if TABLE_ID_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(pattern_error("table_id", value))
    }
}

/// Root scope of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
}

impl Organization {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Resource name used by the organization-listing API.
    pub fn resource_name(&self) -> String {
        if self.id.starts_with("organizations/") {
            self.id.clone()
        } else {
            format!("organizations/{}", self.id)
        }
    }
}

/// A project discovered under an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub organization_id: String,
}

impl Project {
    pub fn new(id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
        }
    }
}

/// Composite identity of a warehouse table.
///
/// This is the natural idempotency key of the pipeline: the backup
/// destination is a pure function of it.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Validate,
)]
pub struct TableRef {
    #[validate(length(min = 1, max = 128), custom(function = "validate_project_id"))]
    pub project_id: String,
    #[validate(length(min = 1, max = 1024), custom(function = "validate_dataset_id"))]
    pub dataset_id: String,
    #[validate(length(min = 1, max = 1024), custom(function = "validate_table_id"))]
    pub table_id: String,
}

impl TableRef {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        }
    }
}

impl fmt::Display for TableRef {
    /// Canonical `project:dataset.table` form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// Point-in-time metadata snapshot for one table. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub table_ref: TableRef,
    pub last_modified_at: DateTime<Utc>,
}

/// A request to export one table to its archival destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub table_ref: TableRef,
    pub destination_uri: String,
}

impl BackupRequest {
    /// Builds the request, deriving the destination from the table reference.
    pub fn new(table_ref: TableRef, destination: &DestinationConfig) -> Self {
        let destination_uri = destination.uri_for(&table_ref);
        Self {
            table_ref,
            destination_uri,
        }
    }
}

/// Handle to an export job started by the export collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    /// Project the job runs in
    pub project_id: String,
    /// Processing location, when the service reports one
    pub location: Option<String>,
}

/// Terminal result of an export job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed { reason: String },
}

/// Lifecycle state of a backup job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// An export in flight. Owned by the executor for one export and dropped
/// once a terminal status is observed.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub table_ref: TableRef,
    pub handle: JobHandle,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub failure: Option<String>,
}

impl BackupJob {
    /// Creates a running job.
    pub fn start(table_ref: TableRef, handle: JobHandle) -> Self {
        Self {
            table_ref,
            handle,
            status: JobStatus::Running,
            started_at: Utc::now(),
            failure: None,
        }
    }

    /// Moves a running job to its terminal state. Terminal jobs are left
    /// untouched.
    pub fn finish(&mut self, outcome: JobOutcome) {
        if self.status.is_terminal() {
            return;
        }
        match outcome {
            JobOutcome::Succeeded => self.status = JobStatus::Succeeded,
            JobOutcome::Failed { reason } => {
                self.status = JobStatus::Failed;
                self.failure = Some(reason);
            }
        }
    }

    /// Marks the job failed because the caller gave up waiting.
    pub fn time_out(&mut self) {
        self.finish(JobOutcome::Failed {
            reason: "timed out waiting for completion".to_string(),
        });
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}
