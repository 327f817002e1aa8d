//! Organization scanner: one `ProjectDiscovered` per project per run.

use std::collections::HashSet;
use std::sync::Arc;

use backup_core::{Organization, ProjectDiscovered, Result};
use futures::TryStreamExt;
use gcp::ProjectDirectory;
use redpanda::{publish_message, MessagePublisher};
use serde::Serialize;
use telemetry::metrics;
use tracing::{info, instrument, warn};

/// Outcome of one scan run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Distinct projects returned by the listing
    pub projects_found: usize,
    pub published: usize,
    /// Projects whose publish failed; re-running the scan covers them
    pub failed: Vec<String>,
}

impl ScanReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Enumerates an organization and feeds the project topic.
pub struct OrganizationScanner {
    directory: Arc<dyn ProjectDirectory>,
    publisher: Arc<dyn MessagePublisher>,
    topic: String,
}

impl OrganizationScanner {
    pub fn new(
        directory: Arc<dyn ProjectDirectory>,
        publisher: Arc<dyn MessagePublisher>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            publisher,
            topic: topic.into(),
        }
    }

    /// Walks the listing once. A listing error aborts the run; publish
    /// failures are recorded and the walk continues.
    #[instrument(skip(self, organization), fields(organization_id = %organization.id))]
    pub async fn scan(&self, organization: &Organization) -> Result<ScanReport> {
        let mut projects = self.directory.list_projects(organization);
        let mut seen = HashSet::new();
        let mut report = ScanReport::default();

        while let Some(project) = projects.try_next().await? {
            if !seen.insert(project.id.clone()) {
                continue;
            }
            report.projects_found += 1;
            metrics().projects_listed.inc();

            let message =
                ProjectDiscovered::new(&project.id).with_organization(&project.organization_id);
            match publish_message(self.publisher.as_ref(), &self.topic, &message).await {
                Ok(()) => {
                    report.published += 1;
                    metrics().projects_published.inc();
                }
                Err(e) => {
                    warn!(project_id = %project.id, "Failed to publish project: {}", e);
                    report.failed.push(project.id);
                }
            }
        }

        info!(
            projects_found = report.projects_found,
            published = report.published,
            failed = report.failed.len(),
            "Organization scan complete"
        );
        Ok(report)
    }
}
