//! Staleness checker: project → datasets → tables → metadata, publishing
//! every table modified inside the lookback window.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use backup_core::{
    LookbackWindow, ProjectDiscovered, Result, TableDueForBackup, TableMetadata, TableRef,
};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use gcp::WarehouseCatalog;
use redpanda::{publish_message, MessagePublisher};
use telemetry::metrics;
use tracing::{debug, info, instrument, warn};

use crate::subscription::MessageHandler;

/// Summary of one project check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectCheck {
    pub project_id: String,
    pub datasets: usize,
    pub tables_checked: usize,
    /// Tables published to the backup topic
    pub tables_due: Vec<TableRef>,
    /// Tables skipped because their metadata could not be read
    pub metadata_errors: usize,
}

pub struct StalenessChecker {
    catalog: Arc<dyn WarehouseCatalog>,
    publisher: Arc<dyn MessagePublisher>,
    topic: String,
    window: LookbackWindow,
    metadata_concurrency: usize,
}

impl StalenessChecker {
    pub fn new(
        catalog: Arc<dyn WarehouseCatalog>,
        publisher: Arc<dyn MessagePublisher>,
        topic: impl Into<String>,
        window: LookbackWindow,
    ) -> Self {
        Self {
            catalog,
            publisher,
            topic: topic.into(),
            window,
            metadata_concurrency: 8,
        }
    }

    pub fn with_metadata_concurrency(mut self, concurrency: usize) -> Self {
        self.metadata_concurrency = concurrency.max(1);
        self
    }

    /// Checks every table of a project against `now - window`.
    ///
    /// A dataset listing failure fails the check outright. A table listing
    /// failure still lets sibling datasets publish, then fails the check so
    /// the project is redelivered. Unreadable metadata only skips the table.
    #[instrument(skip_all, fields(project_id = %project_id))]
    pub async fn check_project(&self, project_id: &str, now: DateTime<Utc>) -> Result<ProjectCheck> {
        let datasets = self.catalog.list_datasets(project_id).await.inspect_err(|e| {
            metrics().enumeration_errors.inc();
            warn!("Failed to list datasets: {}", e);
        })?;
        metrics().datasets_listed.inc_by(datasets.len() as u64);

        let cutoff = self.window.cutoff(now);
        let mut check = ProjectCheck {
            project_id: project_id.to_string(),
            datasets: datasets.len(),
            ..Default::default()
        };
        let mut listing_error = None;

        for dataset_id in &datasets {
            let tables = match self.catalog.list_tables(project_id, dataset_id).await {
                Ok(tables) => tables,
                Err(e) => {
                    metrics().enumeration_errors.inc();
                    warn!(dataset_id = %dataset_id, "Failed to list tables: {}", e);
                    listing_error.get_or_insert(e);
                    continue;
                }
            };

            let due = self.due_tables(project_id, dataset_id, tables, now, &mut check).await;
            debug!(
                dataset_id = %dataset_id,
                due = due.len(),
                cutoff = %cutoff,
                "Dataset checked"
            );

            for metadata in due {
                let table_ref = metadata.table_ref.clone();
                publish_message(
                    self.publisher.as_ref(),
                    &self.topic,
                    &TableDueForBackup::from(metadata),
                )
                .await?;
                metrics().tables_due.inc();
                check.tables_due.push(table_ref);
            }
        }

        info!(
            datasets = check.datasets,
            tables_checked = check.tables_checked,
            tables_due = check.tables_due.len(),
            metadata_errors = check.metadata_errors,
            complete = listing_error.is_none(),
            "Project checked"
        );

        match listing_error {
            Some(e) => Err(e),
            None => Ok(check),
        }
    }

    /// Fetches metadata for one dataset's tables and keeps those inside the
    /// window, ordered by table id.
    async fn due_tables(
        &self,
        project_id: &str,
        dataset_id: &str,
        tables: Vec<String>,
        now: DateTime<Utc>,
        check: &mut ProjectCheck,
    ) -> Vec<TableMetadata> {
        let results: Vec<(TableRef, Result<TableMetadata>)> = stream::iter(tables)
            .map(|table_id| async move {
                let table_ref = TableRef::new(project_id, dataset_id, table_id);
                let metadata = self.catalog.get_table_metadata(&table_ref).await;
                (table_ref, metadata)
            })
            .buffer_unordered(self.metadata_concurrency)
            .collect()
            .await;

        let mut due = Vec::new();
        for (table_ref, metadata) in results {
            match metadata {
                Ok(metadata) => {
                    check.tables_checked += 1;
                    metrics().tables_checked.inc();
                    if self.window.contains(metadata.last_modified_at, now) {
                        due.push(metadata);
                    }
                }
                Err(e) => {
                    check.metadata_errors += 1;
                    metrics().metadata_errors.inc();
                    warn!(table = %table_ref, "Skipping table, metadata unavailable: {}", e);
                }
            }
        }
        due.sort_by(|a, b| a.table_ref.cmp(&b.table_ref));
        due
    }
}

#[async_trait]
impl MessageHandler for StalenessChecker {
    type Message = ProjectDiscovered;

    async fn handle(&self, message: ProjectDiscovered) -> Result<()> {
        let started = Instant::now();
        let result = self.check_project(&message.project_id, Utc::now()).await;
        metrics()
            .project_check_latency_ms
            .observe(started.elapsed().as_millis() as u64);

        result.map(|_| ())
    }
}
