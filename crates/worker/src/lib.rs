//! Pipeline stages for table backups.
//!
//! - Scanner (organization → project topic)
//! - Staleness checker (project topic → backup topic)
//! - Backup executor (backup topic → archival export)
//! - Subscription loop shared by the consuming stages

pub mod config;
pub mod executor;
pub mod scanner;
pub mod scheduler;
pub mod staleness;
pub mod subscription;

pub use config::PipelineConfig;
pub use executor::BackupExecutor;
pub use scanner::{OrganizationScanner, ScanReport};
pub use scheduler::*;
pub use staleness::{ProjectCheck, StalenessChecker};
pub use subscription::*;
