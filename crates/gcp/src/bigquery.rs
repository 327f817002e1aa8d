//! BigQuery v2 metadata and extract jobs.

use std::time::Duration;

use async_trait::async_trait;
use backup_core::{
    BackupRequest, Error, JobHandle, JobOutcome, Result, ServiceErrorCode, TableMetadata,
    TableRef,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::GcpConfig;
use crate::http::{endpoint, ApiClient};
use crate::traits::{TableExporter, WarehouseCatalog};

/// Only native tables can be extracted; views and external tables cannot.
const EXPORTABLE_TABLE_TYPE: &str = "TABLE";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetList {
    #[serde(default)]
    datasets: Vec<DatasetEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetEntry {
    dataset_reference: DatasetReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference {
    dataset_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableList {
    #[serde(default)]
    tables: Vec<TableEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableEntry {
    table_reference: TableReference,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    project_id: String,
    dataset_id: String,
    table_id: String,
}

impl From<&TableRef> for TableReference {
    fn from(table: &TableRef) -> Self {
        Self {
            project_id: table.project_id.clone(),
            dataset_id: table.dataset_id.clone(),
            table_id: table.table_id.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    /// Milliseconds since the epoch, encoded as a string
    last_modified_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertJob {
    job_reference: JobReference,
    configuration: JobConfiguration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobConfiguration {
    extract: ExtractConfiguration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractConfiguration {
    source_table: TableReference,
    destination_uris: Vec<String>,
    destination_format: &'static str,
    field_delimiter: &'static str,
    print_header: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: JobReference,
    #[serde(default)]
    status: Option<JobState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobState {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl JobState {
    /// Terminal outcome once the job is `DONE`.
    fn outcome(&self) -> Option<JobOutcome> {
        if self.state != "DONE" {
            return None;
        }
        Some(match self.error_result {
            None => JobOutcome::Succeeded,
            Some(ref err) => JobOutcome::Failed {
                reason: format!(
                    "{}: {}",
                    err.reason.as_deref().unwrap_or("unknown"),
                    err.message.as_deref().unwrap_or("no message")
                ),
            },
        })
    }
}

/// Unique per attempt; BigQuery rejects reused job IDs. Only letters,
/// digits, `_` and `-` are allowed.
fn export_job_id(table: &TableRef) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .take(200)
            .collect()
    };
    format!(
        "backup_{}_{}_{}",
        sanitize(&table.dataset_id),
        sanitize(&table.table_id),
        Uuid::new_v4().simple()
    )
}

/// BigQuery client implementing both the metadata and the export contract.
#[derive(Clone)]
pub struct BigQueryClient {
    api: ApiClient,
    base: Url,
    page_size: u32,
    poll_interval: Duration,
    job_location: Option<String>,
    job_project: Option<String>,
}

impl BigQueryClient {
    pub fn new(config: &GcpConfig) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(config)?,
            base: config.bigquery_base()?,
            page_size: config.page_size,
            poll_interval: Duration::from_millis(config.job_poll_interval_ms.max(100)),
            job_location: config.job_location.clone(),
            job_project: config.job_project.clone(),
        })
    }

    fn paged(&self, segments: &[&str], page_token: Option<&str>) -> Url {
        let mut url = endpoint(&self.base, segments);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("maxResults", &self.page_size.to_string());
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        url
    }

    fn job_url(&self, job: &JobHandle, action: Option<&str>) -> Url {
        let mut segments = vec!["projects", job.project_id.as_str(), "jobs", job.job_id.as_str()];
        if let Some(action) = action {
            segments.push(action);
        }
        let mut url = endpoint(&self.base, &segments);
        if let Some(ref location) = job.location {
            url.query_pairs_mut().append_pair("location", location);
        }
        url
    }

    async fn get_job(&self, job: &JobHandle) -> Result<JobResource> {
        self.api.get_json(self.job_url(job, None)).await
    }
}

#[async_trait]
impl WarehouseCatalog for BigQueryClient {
    async fn list_datasets(&self, project_id: &str) -> Result<Vec<String>> {
        let mut datasets = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let url = self.paged(&["projects", project_id, "datasets"], token.as_deref());
            let page: DatasetList = self.api.get_json(url).await?;
            datasets.extend(page.datasets.into_iter().map(|d| d.dataset_reference.dataset_id));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        debug!(project_id = project_id, datasets = datasets.len(), "Listed datasets");
        Ok(datasets)
    }

    async fn list_tables(&self, project_id: &str, dataset_id: &str) -> Result<Vec<String>> {
        let mut tables = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let url = self.paged(
                &["projects", project_id, "datasets", dataset_id, "tables"],
                token.as_deref(),
            );
            let page: TableList = self.api.get_json(url).await?;

            for entry in page.tables {
                match entry.kind.as_deref() {
                    Some(EXPORTABLE_TABLE_TYPE) | None => {
                        tables.push(entry.table_reference.table_id)
                    }
                    Some(other) => debug!(
                        project_id = project_id,
                        dataset_id = dataset_id,
                        table_id = %entry.table_reference.table_id,
                        kind = other,
                        "Skipping non-exportable table"
                    ),
                }
            }

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        Ok(tables)
    }

    async fn get_table_metadata(&self, table: &TableRef) -> Result<TableMetadata> {
        let url = endpoint(
            &self.base,
            &[
                "projects",
                table.project_id.as_str(),
                "datasets",
                table.dataset_id.as_str(),
                "tables",
                table.table_id.as_str(),
            ],
        );
        let resource: TableResource = self.api.get_json(url).await?;

        let millis: i64 = resource.last_modified_time.parse().map_err(|_| {
            Error::invalid_response(format!(
                "lastModifiedTime {:?} for {} is not a number",
                resource.last_modified_time, table
            ))
        })?;
        let last_modified_at = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
            Error::invalid_response(format!("lastModifiedTime out of range for {}", table))
        })?;

        Ok(TableMetadata {
            table_ref: table.clone(),
            last_modified_at,
        })
    }
}

#[async_trait]
impl TableExporter for BigQueryClient {
    async fn start_export(&self, request: &BackupRequest) -> Result<JobHandle> {
        let table = &request.table_ref;
        let job_project = self
            .job_project
            .clone()
            .unwrap_or_else(|| table.project_id.clone());

        let body = InsertJob {
            job_reference: JobReference {
                project_id: job_project.clone(),
                job_id: export_job_id(table),
                location: self.job_location.clone(),
            },
            configuration: JobConfiguration {
                extract: ExtractConfiguration {
                    source_table: table.into(),
                    destination_uris: vec![request.destination_uri.clone()],
                    destination_format: "CSV",
                    field_delimiter: ",",
                    print_header: true,
                },
            },
        };

        let url = endpoint(&self.base, &["projects", job_project.as_str(), "jobs"]);
        let job: JobResource = self.api.post_json(url, &body).await?;

        info!(
            table = %table,
            job_id = %job.job_reference.job_id,
            destination = %request.destination_uri,
            "Started export job"
        );

        Ok(JobHandle {
            job_id: job.job_reference.job_id,
            project_id: job.job_reference.project_id,
            location: job.job_reference.location,
        })
    }

    async fn await_completion(&self, job: &JobHandle) -> Result<JobOutcome> {
        loop {
            match self.get_job(job).await {
                Ok(resource) => {
                    if let Some(outcome) = resource.status.as_ref().and_then(JobState::outcome) {
                        return Ok(outcome);
                    }
                }
                // Polling is read-only; a blip should not fail the export
                Err(e) if e.service_kind() == Some(ServiceErrorCode::Unavailable) => {
                    warn!(job_id = %job.job_id, error = %e, "Job status poll failed");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn cancel(&self, job: &JobHandle) -> Result<()> {
        self.api.post_empty(self.job_url(job, Some("cancel"))).await?;
        info!(job_id = %job.job_id, "Cancelled export job");
        Ok(())
    }
}
