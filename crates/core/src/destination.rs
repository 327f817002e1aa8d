//! Archival destination derivation.
//!
//! The destination URI is a pure function of the table reference, so
//! re-exporting a table overwrites the same objects instead of
//! accumulating copies.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::TableRef;

/// Where and how table exports are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Archive bucket name (without scheme)
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Path segment inserted between the project and dataset
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    /// Sharded object pattern; must contain a single `*`
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,
}

fn default_bucket() -> String {
    "table-backups".to_string()
}

fn default_path_prefix() -> String {
    "backup".to_string()
}

fn default_file_pattern() -> String {
    "*.csv".to_string()
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            path_prefix: default_path_prefix(),
            file_pattern: default_file_pattern(),
        }
    }
}

impl DestinationConfig {
    /// Checks the settings before any export is attempted.
    pub fn validate(&self) -> Result<()> {
        let bucket = self.bucket.trim();
        if bucket.is_empty() || bucket.contains('/') {
            return Err(Error::config(format!(
                "invalid destination bucket: {:?}",
                self.bucket
            )));
        }
        if self.file_pattern.matches('*').count() != 1 || self.file_pattern.contains('/') {
            return Err(Error::config(format!(
                "destination file pattern must be a single object name with one '*': {:?}",
                self.file_pattern
            )));
        }
        Ok(())
    }

    /// `gs://{bucket}/{project}/{prefix}/{dataset}/{table}/{pattern}`
    pub fn uri_for(&self, table: &TableRef) -> String {
        let prefix = self.path_prefix.trim_matches('/');
        let mut uri = format!("gs://{}/{}/", self.bucket.trim(), table.project_id);
        if !prefix.is_empty() {
            uri.push_str(prefix);
            uri.push('/');
        }
        uri.push_str(&format!(
            "{}/{}/{}",
            table.dataset_id, table.table_id, self.file_pattern
        ));
        uri
    }
}
