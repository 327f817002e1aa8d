//! GCP API configuration.

use backup_core::{Error, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Endpoints and call settings for the organization and warehouse APIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcpConfig {
    /// Cloud Resource Manager base URL
    #[serde(default = "default_resource_manager_url")]
    pub resource_manager_url: String,
    /// BigQuery v2 base URL
    #[serde(default = "default_bigquery_url")]
    pub bigquery_url: String,
    /// Bearer token obtained outside this process (optional)
    #[serde(default)]
    pub access_token: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Also list projects inside the organization's folders
    #[serde(default = "default_include_folders")]
    pub include_folders: bool,
    /// Page size for list calls
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Interval between export job status polls, in milliseconds
    #[serde(default = "default_job_poll_interval_ms")]
    pub job_poll_interval_ms: u64,
    /// Location to run export jobs in (defaults to the dataset's)
    #[serde(default)]
    pub job_location: Option<String>,
    /// Project billed for export jobs (defaults to the table's project)
    #[serde(default)]
    pub job_project: Option<String>,
    /// Project whose datasets the startup health probe lists (defaults to
    /// `job_project`)
    #[serde(default)]
    pub health_project: Option<String>,
}

fn default_resource_manager_url() -> String {
    "https://cloudresourcemanager.googleapis.com/v3".to_string()
}

fn default_bigquery_url() -> String {
    "https://bigquery.googleapis.com/bigquery/v2".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_include_folders() -> bool {
    true
}

fn default_page_size() -> u32 {
    500
}

fn default_job_poll_interval_ms() -> u64 {
    2000
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            resource_manager_url: default_resource_manager_url(),
            bigquery_url: default_bigquery_url(),
            access_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            include_folders: default_include_folders(),
            page_size: default_page_size(),
            job_poll_interval_ms: default_job_poll_interval_ms(),
            job_location: None,
            job_project: None,
            health_project: None,
        }
    }
}

impl GcpConfig {
    pub fn resource_manager_base(&self) -> Result<Url> {
        parse_base(&self.resource_manager_url)
    }

    pub fn bigquery_base(&self) -> Result<Url> {
        parse_base(&self.bigquery_url)
    }

    /// Project used to probe BigQuery access, if one is configured.
    pub fn probe_project(&self) -> Option<&str> {
        self.health_project
            .as_deref()
            .or(self.job_project.as_deref())
    }
}

fn parse_base(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::config(format!("invalid URL {:?}: {}", raw, e)))?;
    if url.cannot_be_a_base() {
        return Err(Error::config(format!("URL cannot be a base: {:?}", raw)));
    }
    Ok(url)
}
