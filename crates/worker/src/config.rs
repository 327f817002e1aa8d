//! Pipeline stage configuration.

use std::time::Duration;

use backup_core::{DestinationConfig, LookbackWindow, Result, DEFAULT_LOOKBACK_SECS};
use serde::{Deserialize, Serialize};

use crate::subscription::SubscriptionConfig;

/// Settings shared by the scanner, checker and executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How far back a modification still counts as recent
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,
    /// Caller-side bound on one export job
    #[serde(default = "default_export_timeout_secs")]
    pub export_timeout_secs: u64,
    /// Messages handled concurrently per partition
    #[serde(default = "default_handler_concurrency")]
    pub handler_concurrency: usize,
    /// Metadata lookups in flight per dataset
    #[serde(default = "default_metadata_concurrency")]
    pub metadata_concurrency: usize,
    /// Pause before a failed message is delivered again
    #[serde(default = "default_redelivery_backoff_ms")]
    pub redelivery_backoff_ms: u64,
    /// Deliveries before a message goes to the dead-letter topic
    #[serde(default)]
    pub max_deliveries: Option<u32>,
    /// Failed messages per partition held for retry before fetching pauses
    #[serde(default = "default_max_pending_retries")]
    pub max_pending_retries: usize,
    /// Metrics snapshot log interval
    #[serde(default = "default_metrics_log_interval_secs")]
    pub metrics_log_interval_secs: u64,
    #[serde(default)]
    pub destination: DestinationConfig,
}

fn default_lookback_secs() -> u64 {
    DEFAULT_LOOKBACK_SECS
}

fn default_export_timeout_secs() -> u64 {
    3600
}

fn default_handler_concurrency() -> usize {
    8
}

fn default_metadata_concurrency() -> usize {
    8
}

fn default_redelivery_backoff_ms() -> u64 {
    1000
}

fn default_max_pending_retries() -> usize {
    1000
}

fn default_metrics_log_interval_secs() -> u64 {
    60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lookback_secs: default_lookback_secs(),
            export_timeout_secs: default_export_timeout_secs(),
            handler_concurrency: default_handler_concurrency(),
            metadata_concurrency: default_metadata_concurrency(),
            redelivery_backoff_ms: default_redelivery_backoff_ms(),
            max_deliveries: None,
            max_pending_retries: default_max_pending_retries(),
            metrics_log_interval_secs: default_metrics_log_interval_secs(),
            destination: DestinationConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn lookback_window(&self) -> LookbackWindow {
        LookbackWindow::from_secs(self.lookback_secs)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }

    pub fn redelivery_backoff(&self) -> Duration {
        Duration::from_millis(self.redelivery_backoff_ms)
    }

    pub fn metrics_log_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_log_interval_secs.max(1))
    }

    /// Subscription settings for a consuming stage.
    pub fn subscription(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            concurrency: self.handler_concurrency,
            redelivery_backoff: self.redelivery_backoff(),
            max_deliveries: self.max_deliveries,
            max_pending_retries: self.max_pending_retries,
            ..Default::default()
        }
    }

    /// Rejects settings that would stall or misroute the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.handler_concurrency == 0
            || self.metadata_concurrency == 0
            || self.max_pending_retries == 0
        {
            return Err(backup_core::Error::config("concurrency must be at least 1"));
        }
        if self.export_timeout_secs == 0 {
            return Err(backup_core::Error::config("export timeout must be positive"));
        }
        if self.max_deliveries == Some(0) {
            return Err(backup_core::Error::config("max_deliveries must be at least 1"));
        }
        self.destination.validate()
    }
}
