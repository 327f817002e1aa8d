//! Collaborator health checks.

use backup_core::Organization;
use futures::StreamExt;
use tracing::{debug, error};

use crate::traits::{ProjectDirectory, WarehouseCatalog};

/// Checks that the organization can be listed with the configured
/// credentials. Only the first page is fetched. Used by `scan`, the only
/// stage that needs Resource Manager access.
pub async fn check_connection(directory: &dyn ProjectDirectory, organization: &Organization) -> bool {
    let mut projects = directory.list_projects(organization);
    match projects.next().await {
        Some(Ok(project)) => {
            debug!(first_project = %project.id, "Organization listing healthy");
            true
        }
        None => {
            debug!(organization = %organization.id, "Organization listing healthy (no projects)");
            true
        }
        Some(Err(e)) => {
            error!("Failed to list organization projects: {}", e);
            false
        }
    }
}

/// Checks that datasets of `project_id` can be listed. Used by the
/// consuming stages, which only need BigQuery access.
pub async fn check_warehouse(catalog: &dyn WarehouseCatalog, project_id: &str) -> bool {
    match catalog.list_datasets(project_id).await {
        Ok(datasets) => {
            debug!(project_id = %project_id, datasets = datasets.len(), "Warehouse listing healthy");
            true
        }
        Err(e) => {
            error!(project_id = %project_id, "Failed to list datasets: {}", e);
            false
        }
    }
}
