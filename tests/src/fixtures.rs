//! Test fixtures.

use backup_core::{DestinationConfig, Organization, TableRef};
use chrono::{DateTime, Duration, Utc};

pub const ORG_ID: &str = "org-1";
pub const PROJECTS_TOPIC: &str = "check-project-tables";
pub const BACKUPS_TOPIC: &str = "run-bq-backup-to-cs";
pub const DEAD_LETTER_TOPIC: &str = "backup-dead-letter";

pub fn organization() -> Organization {
    Organization::new(ORG_ID)
}

pub fn table(project: &str, dataset: &str, table: &str) -> TableRef {
    TableRef::new(project, dataset, table)
}

/// A timestamp `hours` before `now`.
pub fn hours_ago(now: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    now - Duration::hours(hours)
}

pub fn destination() -> DestinationConfig {
    DestinationConfig {
        bucket: "test-backups".to_string(),
        ..Default::default()
    }
}

/// Where `destination()` puts an export of `table`.
pub fn expected_uri(table: &TableRef) -> String {
    format!(
        "gs://test-backups/{}/backup/{}/{}/*.csv",
        table.project_id, table.dataset_id, table.table_id
    )
}
