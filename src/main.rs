//! Table Backup Pipeline
//!
//! Event-driven backup of warehouse tables:
//! - `scan`: enumerate an organization and publish one message per project
//! - `check`: find tables modified inside the lookback window
//! - `backup`: export due tables to archival storage

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use backup_core::Organization;
use gcp::{BigQueryClient, GcpConfig, ProjectDirectory, ResourceManagerClient, WarehouseCatalog};
use redpanda::{MessagePublisher, Producer, RedpandaConfig};
use telemetry::{health, init_tracing_from_env};
use worker::{
    log_metrics, BackupExecutor, OrganizationScanner, PipelineConfig, StageScheduler,
    StalenessChecker,
};

#[derive(Debug, Parser)]
#[command(name = "table-backup", version, about = "Event-driven warehouse table backups")]
struct Cli {
    /// Configuration file, without extension
    #[arg(long, env = "BACKUP_CONFIG", default_value = "config/default")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the organization's projects and publish them (one run)
    Scan {
        /// Organization to scan; overrides the configured one
        #[arg(long)]
        organization: Option<String>,
    },
    /// Consume projects and publish tables due for backup
    Check,
    /// Consume due tables and export them
    Backup,
    /// Create the pipeline topics and exit
    Provision,
}

/// Health server settings for long-running stages.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct HealthServerConfig {
    #[serde(default = "default_health_enabled")]
    enabled: bool,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

fn default_health_enabled() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct Config {
    /// Organization scanned by `scan`
    #[serde(default)]
    organization_id: Option<String>,

    #[serde(default)]
    health: HealthServerConfig,

    #[serde(default)]
    redpanda: RedpandaConfig,

    #[serde(default)]
    gcp: GcpConfig,

    #[serde(default)]
    pipeline: PipelineConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // rustls 0.23+ requires explicit crypto provider selection before any TLS
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenvy::dotenv().ok();
    init_tracing_from_env();

    let cli = Cli::parse();
    info!("Starting table-backup v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli.config)?;
    config
        .pipeline
        .validate()
        .context("Invalid pipeline configuration")?;

    info!(
        brokers = ?config.redpanda.brokers,
        sasl_username = config.redpanda.sasl_username.as_deref().unwrap_or("none"),
        projects_topic = %config.redpanda.topics.projects,
        backups_topic = %config.redpanda.topics.backups,
        "Loaded Redpanda config"
    );

    // Provisioning runs once per process, never per message
    redpanda::ensure_topics(&config.redpanda)
        .await
        .context("Failed to provision topics")?;

    match cli.command {
        Command::Provision => {
            info!("Topics provisioned");
            Ok(())
        }
        Command::Scan { organization } => {
            let organization_id = organization
                .or_else(|| config.organization_id.clone())
                .context("No organization configured (BACKUP_ORGANIZATION_ID or --organization)")?;
            run_scan(&config, Organization::new(organization_id)).await
        }
        Command::Check => run_check(&config).await,
        Command::Backup => run_backup(&config).await,
    }
}

async fn run_scan(config: &Config, organization: Organization) -> Result<()> {
    check_health(config, Probe::Organization(&organization)).await;

    let directory = Arc::new(
        ResourceManagerClient::new(&config.gcp).context("Failed to create Resource Manager client")?,
    );
    let publisher: Arc<dyn MessagePublisher> = Arc::new(Producer::new(config.redpanda.clone()));

    let scanner = OrganizationScanner::new(
        directory,
        publisher,
        config.redpanda.topics.projects.clone(),
    );
    let report = scanner
        .scan(&organization)
        .await
        .with_context(|| format!("Scan of organization {} failed", organization.id))?;
    log_metrics();

    if !report.is_complete() {
        // Non-zero exit so the external trigger re-runs the scan
        bail!(
            "{} of {} projects were not published: {}",
            report.failed.len(),
            report.projects_found,
            report.failed.join(", ")
        );
    }
    Ok(())
}

async fn run_check(config: &Config) -> Result<()> {
    let catalog = Arc::new(BigQueryClient::new(&config.gcp).context("Failed to create BigQuery client")?);
    let publisher: Arc<dyn MessagePublisher> = Arc::new(Producer::new(config.redpanda.clone()));

    let checker = StalenessChecker::new(
        catalog,
        publisher.clone(),
        config.redpanda.topics.backups.clone(),
        config.pipeline.lookback_window(),
    )
    .with_metadata_concurrency(config.pipeline.metadata_concurrency);

    info!(
        lookback_secs = config.pipeline.lookback_secs,
        "Staleness checker configured"
    );
    let topic = config.redpanda.topics.projects.clone();
    run_stage(config, publisher, &topic, Arc::new(checker)).await
}

async fn run_backup(config: &Config) -> Result<()> {
    let exporter = Arc::new(BigQueryClient::new(&config.gcp).context("Failed to create BigQuery client")?);
    let publisher: Arc<dyn MessagePublisher> = Arc::new(Producer::new(config.redpanda.clone()));

    config
        .pipeline
        .destination
        .validate()
        .context("Invalid backup destination")?;
    let executor = BackupExecutor::new(
        exporter,
        config.pipeline.destination.clone(),
        config.pipeline.export_timeout(),
    );

    let topic = config.redpanda.topics.backups.clone();
    run_stage(config, publisher, &topic, Arc::new(executor)).await
}

/// Runs a consuming stage until a shutdown signal arrives.
async fn run_stage<H>(
    config: &Config,
    publisher: Arc<dyn MessagePublisher>,
    topic: &str,
    handler: Arc<H>,
) -> Result<()>
where
    H: worker::MessageHandler + 'static,
{
    check_health(config, Probe::Warehouse).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = if config.health.enabled {
        Some(spawn_health_server(&config.health, shutdown_rx.clone()).await?)
    } else {
        None
    };

    let scheduler = StageScheduler::new(
        config.redpanda.clone(),
        config.pipeline.clone(),
        publisher,
    );
    let handles = scheduler
        .start(topic, handler, shutdown_rx)
        .await
        .with_context(|| format!("Failed to subscribe to {}", topic))?;

    shutdown_signal().await;
    info!("Shutting down...");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Stage task ended abnormally: {}", e);
        }
    }
    if let Some(server) = server {
        if let Err(e) = server.await {
            error!("Health server ended abnormally: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn spawn_health_server(
    settings: &HealthServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<tokio::task::JoinHandle<()>> {
    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .context("Invalid health server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;
    info!("Health endpoints on http://{}", addr);

    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, api::router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            error!("Health server error: {}", e);
        }
    }))
}

/// Load configuration from files and environment.
fn load_config(path: &str) -> Result<Config> {
    let config = config::Config::builder()
        .add_source(config::Config::try_from(&Config::default())?)
        .add_source(
            config::File::with_name(path)
                .required(false)
                .format(config::FileFormat::Toml),
        )
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix("BACKUP")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut config: Config = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    // Nested fields with underscores do not map reliably through the
    // environment source, so the common ones are read directly
    if let Ok(organization_id) = std::env::var("BACKUP_ORGANIZATION_ID") {
        config.organization_id = Some(organization_id);
    }
    if let Ok(brokers) = std::env::var("BACKUP_REDPANDA_BROKERS") {
        config.redpanda.brokers = brokers.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Ok(username) = std::env::var("BACKUP_REDPANDA_SASL_USERNAME") {
        config.redpanda.sasl_username = Some(username);
    }
    if let Ok(password) = std::env::var("BACKUP_REDPANDA_SASL_PASSWORD") {
        config.redpanda.sasl_password = Some(password);
    }
    if let Ok(project) = std::env::var("BACKUP_GCP_HEALTH_PROJECT") {
        config.gcp.health_project = Some(project);
    }
    if let Ok(token) = std::env::var("BACKUP_GCP_ACCESS_TOKEN") {
        config.gcp.access_token = Some(token);
    }
    if let Ok(bucket) = std::env::var("BACKUP_DESTINATION_BUCKET") {
        config.pipeline.destination.bucket = bucket;
    }
    if let Ok(lookback) = std::env::var("BACKUP_LOOKBACK_SECS") {
        config.pipeline.lookback_secs = lookback
            .parse()
            .context("BACKUP_LOOKBACK_SECS must be a number of seconds")?;
    }

    Ok(config)
}

/// Collaborator a stage depends on, probed at startup.
enum Probe<'a> {
    /// `scan` lists the organization through Resource Manager
    Organization(&'a Organization),
    /// `check` and `backup` only talk to BigQuery
    Warehouse,
}

/// Check component health on startup.
async fn check_health(config: &Config, probe: Probe<'_>) {
    if redpanda::health::check_connection(&config.redpanda).await {
        health().bus.set_healthy();
        info!("Redpanda connection: healthy");
    } else {
        health().bus.set_unhealthy("Connection failed");
        error!("Redpanda connection: unhealthy");
    }

    let healthy = match probe {
        Probe::Organization(organization) => match ResourceManagerClient::new(&config.gcp) {
            Ok(directory) => {
                gcp::health::check_connection(&directory as &dyn ProjectDirectory, organization)
                    .await
            }
            Err(e) => {
                warn!("Resource Manager client unavailable: {}", e);
                false
            }
        },
        Probe::Warehouse => {
            let Some(project_id) = config.gcp.probe_project() else {
                health().warehouse.set_healthy();
                info!("Warehouse probe skipped: no health or job project configured");
                return;
            };
            match BigQueryClient::new(&config.gcp) {
                Ok(catalog) => {
                    gcp::health::check_warehouse(&catalog as &dyn WarehouseCatalog, project_id)
                        .await
                }
                Err(e) => {
                    warn!("BigQuery client unavailable: {}", e);
                    false
                }
            }
        }
    };

    if healthy {
        health().warehouse.set_healthy();
        info!("Warehouse APIs: healthy");
    } else {
        health().warehouse.set_unhealthy("Startup probe failed");
        error!("Warehouse APIs: unhealthy");
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
