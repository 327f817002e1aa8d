//! Collaborator contracts.

use async_trait::async_trait;
use backup_core::{
    BackupRequest, JobHandle, JobOutcome, Organization, Project, Result, TableMetadata, TableRef,
};
use futures::stream::BoxStream;

/// Lazy, finite, single-pass sequence of projects.
pub type ProjectStream<'a> = BoxStream<'a, Result<Project>>;

/// Organization-listing API.
pub trait ProjectDirectory: Send + Sync {
    /// Lists every project under the organization. Pages are fetched as the
    /// stream is polled; an error item ends the listing.
    fn list_projects<'a>(&'a self, organization: &'a Organization) -> ProjectStream<'a>;
}

/// Warehouse metadata API.
#[async_trait]
pub trait WarehouseCatalog: Send + Sync {
    async fn list_datasets(&self, project_id: &str) -> Result<Vec<String>>;

    async fn list_tables(&self, project_id: &str, dataset_id: &str) -> Result<Vec<String>>;

    async fn get_table_metadata(&self, table: &TableRef) -> Result<TableMetadata>;
}

/// Archival export API.
#[async_trait]
pub trait TableExporter: Send + Sync {
    /// Starts exporting the whole table to `request.destination_uri`.
    async fn start_export(&self, request: &BackupRequest) -> Result<JobHandle>;

    /// Waits until the job reaches a terminal state.
    async fn await_completion(&self, job: &JobHandle) -> Result<JobOutcome>;

    /// Best-effort cancellation after the caller stopped waiting.
    async fn cancel(&self, _job: &JobHandle) -> Result<()> {
        Ok(())
    }
}
