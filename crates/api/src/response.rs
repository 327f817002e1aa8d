//! Response bodies.

use serde::{Deserialize, Serialize};
use telemetry::{ComponentHealthReport, HealthStatus, MetricsSnapshot};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub bus_connected: bool,
    pub warehouse_connected: bool,
    pub components: Vec<ComponentHealthReport>,
    pub counters: PipelineCounters,
}

/// Headline pipeline counters.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCounters {
    pub projects_published: u64,
    pub tables_due: u64,
    pub exports_succeeded: u64,
    pub exports_failed: u64,
    pub messages_redelivered: u64,
    pub messages_dead_lettered: u64,
    pub consumer_lag: u64,
}

impl From<&MetricsSnapshot> for PipelineCounters {
    fn from(snapshot: &MetricsSnapshot) -> Self {
        Self {
            projects_published: snapshot.projects_published,
            tables_due: snapshot.tables_due,
            exports_succeeded: snapshot.exports_succeeded,
            exports_failed: snapshot.exports_failed + snapshot.exports_timed_out,
            messages_redelivered: snapshot.messages_redelivered,
            messages_dead_lettered: snapshot.messages_dead_lettered,
            consumer_lag: snapshot.consumer_lag,
        }
    }
}
