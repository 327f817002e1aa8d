//! A fully wired pipeline over the in-memory bus.

use std::sync::Arc;
use std::time::Duration;

use backup_core::{LookbackWindow, Result};
use worker::{
    BackupExecutor, BatchOutcome, OrganizationScanner, ScanReport, StalenessChecker,
    Subscription, SubscriptionConfig,
};

use crate::fixtures::{self, BACKUPS_TOPIC, DEAD_LETTER_TOPIC, PROJECTS_TOPIC};
use crate::mocks::{FakeDirectory, FakeExporter, FakeWarehouse, InMemoryBus};

/// Knobs for a test pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub lookback: LookbackWindow,
    pub export_timeout: Duration,
    /// Dead-letter after this many failed deliveries
    pub max_deliveries: Option<u32>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            lookback: LookbackWindow::from_secs(24 * 3600),
            export_timeout: Duration::from_secs(5),
            max_deliveries: None,
        }
    }
}

/// Scanner plus both consuming stages, sharing one in-memory bus.
///
/// Stages are stepped by hand with `step_*` instead of running their loops,
/// so each test controls exactly how many deliveries happen.
pub struct TestPipeline {
    pub bus: Arc<InMemoryBus>,
    pub directory: Arc<FakeDirectory>,
    pub warehouse: Arc<FakeWarehouse>,
    pub exporter: Arc<FakeExporter>,
    pub scanner: OrganizationScanner,
    pub checker: Arc<StalenessChecker>,
    pub executor: Arc<BackupExecutor>,
    subscription_config: SubscriptionConfig,
    check_subscription: Subscription<StalenessChecker>,
    backup_subscription: Subscription<BackupExecutor>,
}

impl TestPipeline {
    pub fn new() -> Self {
        Self::with_options(PipelineOptions::default())
    }

    pub fn with_options(options: PipelineOptions) -> Self {
        let bus = InMemoryBus::new();
        let directory = FakeDirectory::new();
        let warehouse = FakeWarehouse::new();
        let exporter = FakeExporter::new();

        let scanner = OrganizationScanner::new(directory.clone(), bus.clone(), PROJECTS_TOPIC);
        let checker = Arc::new(StalenessChecker::new(
            warehouse.clone(),
            bus.clone(),
            BACKUPS_TOPIC,
            options.lookback,
        ));
        let executor = Arc::new(BackupExecutor::new(
            exporter.clone(),
            fixtures::destination(),
            options.export_timeout,
        ));

        let subscription_config = SubscriptionConfig {
            concurrency: 4,
            redelivery_backoff: Duration::ZERO,
            error_backoff: Duration::ZERO,
            max_deliveries: options.max_deliveries,
            ..Default::default()
        };
        let mut check_subscription = Subscription::new(
            bus.source(PROJECTS_TOPIC),
            checker.clone(),
            subscription_config.clone(),
        );
        let mut backup_subscription = Subscription::new(
            bus.source(BACKUPS_TOPIC),
            executor.clone(),
            subscription_config.clone(),
        );
        if options.max_deliveries.is_some() {
            check_subscription = check_subscription.with_dead_letter(bus.clone(), DEAD_LETTER_TOPIC);
            backup_subscription =
                backup_subscription.with_dead_letter(bus.clone(), DEAD_LETTER_TOPIC);
        }

        Self {
            bus,
            directory,
            warehouse,
            exporter,
            scanner,
            checker,
            executor,
            check_subscription,
            subscription_config,
            backup_subscription,
        }
    }

    pub async fn scan(&self) -> Result<ScanReport> {
        self.scanner.scan(&fixtures::organization()).await
    }

    /// One fetch/dispatch/commit round of the staleness checker.
    pub async fn step_check(&self) -> BatchOutcome {
        self.check_subscription
            .process_batch()
            .await
            .expect("check batch should not hit a bus error")
    }

    /// One fetch/dispatch/commit round of the backup executor.
    pub async fn step_backup(&self) -> BatchOutcome {
        self.backup_subscription
            .process_batch()
            .await
            .expect("backup batch should not hit a bus error")
    }

    /// Failed backups waiting for another delivery.
    pub fn backup_retries(&self) -> usize {
        self.backup_subscription.pending_retries()
    }

    /// Replaces the backup stage with a fresh one, as after a process
    /// restart: in-memory retry state is lost, the stored commit survives.
    pub fn restart_backup(&mut self) {
        self.backup_subscription = Subscription::new(
            self.bus.source(BACKUPS_TOPIC),
            self.executor.clone(),
            self.subscription_config.clone(),
        );
    }

    /// Scan, then drain both stages once.
    pub async fn run_once(&self) -> Result<ScanReport> {
        let report = self.scan().await?;
        self.step_check().await;
        self.step_backup().await;
        Ok(report)
    }
}

impl Default for TestPipeline {
    fn default() -> Self {
        Self::new()
    }
}
