//! Backup executor: exports one table per message and acknowledges only
//! after the export job succeeds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backup_core::{
    BackupJob, BackupRequest, DestinationConfig, Error, JobStatus, Result, TableDueForBackup,
    TableRef,
};
use gcp::TableExporter;
use telemetry::metrics;
use tracing::{error, info, instrument, warn};

use crate::subscription::MessageHandler;

pub struct BackupExecutor {
    exporter: Arc<dyn TableExporter>,
    destination: DestinationConfig,
    export_timeout: Duration,
}

impl BackupExecutor {
    pub fn new(
        exporter: Arc<dyn TableExporter>,
        destination: DestinationConfig,
        export_timeout: Duration,
    ) -> Self {
        Self {
            exporter,
            destination,
            export_timeout,
        }
    }

    /// Destination for a table. Re-exports overwrite the same location.
    pub fn request_for(&self, table_ref: TableRef) -> BackupRequest {
        BackupRequest::new(table_ref, &self.destination)
    }

    /// Runs one export to a terminal state.
    ///
    /// Returns the finished job on success. A failed job, a job still
    /// running after the export timeout, or a collaborator error is
    /// returned as an error so the message is redelivered.
    #[instrument(skip_all, fields(table = %table_ref))]
    pub async fn execute(&self, table_ref: TableRef) -> Result<BackupJob> {
        let request = self.request_for(table_ref);
        let handle = self.exporter.start_export(&request).await?;
        metrics().exports_started.inc();

        let mut job = BackupJob::start(request.table_ref.clone(), handle);
        info!(
            job_id = %job.handle.job_id,
            destination = %request.destination_uri,
            "Export started"
        );

        let waited = tokio::time::timeout(
            self.export_timeout,
            self.exporter.await_completion(&job.handle),
        )
        .await;

        match waited {
            Ok(Ok(outcome)) => job.finish(outcome),
            Ok(Err(e)) => {
                metrics().exports_failed.inc();
                error!(job_id = %job.handle.job_id, "Export status unavailable: {}", e);
                return Err(e);
            }
            Err(_) => {
                job.time_out();
                metrics().exports_timed_out.inc();
                warn!(
                    job_id = %job.handle.job_id,
                    timeout_secs = self.export_timeout.as_secs(),
                    "Export timed out, cancelling"
                );
                if let Err(e) = self.exporter.cancel(&job.handle).await {
                    warn!(job_id = %job.handle.job_id, "Cancel failed: {}", e);
                }
                return Err(Error::ExportTimeout(self.export_timeout));
            }
        }

        let elapsed_ms = job.elapsed().num_milliseconds().max(0) as u64;
        metrics().export_latency_ms.observe(elapsed_ms);

        match job.status {
            JobStatus::Succeeded => {
                metrics().exports_succeeded.inc();
                info!(job_id = %job.handle.job_id, elapsed_ms = elapsed_ms, "Export succeeded");
                Ok(job)
            }
            _ => {
                metrics().exports_failed.inc();
                let reason = job.failure.clone().unwrap_or_default();
                warn!(job_id = %job.handle.job_id, reason = %reason, "Export failed");
                Err(Error::export_failed(format!("{}: {}", job.table_ref, reason)))
            }
        }
    }
}

#[async_trait]
impl MessageHandler for BackupExecutor {
    type Message = TableDueForBackup;

    async fn handle(&self, message: TableDueForBackup) -> Result<()> {
        self.execute(message.table_ref).await.map(|_| ())
    }
}
