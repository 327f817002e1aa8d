//! External collaborators of the backup pipeline.
//!
//! The traits in [`traits`] are the contracts the stages call; the REST
//! clients implement them against Cloud Resource Manager v3 and BigQuery v2.

pub mod bigquery;
pub mod config;
pub mod health;
pub mod http;
pub mod resource_manager;
pub mod traits;

pub use bigquery::BigQueryClient;
pub use config::GcpConfig;
pub use resource_manager::ResourceManagerClient;
pub use traits::*;
