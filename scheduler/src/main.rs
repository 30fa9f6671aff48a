// Backup orchestrator daemon entry point

use anyhow::Context;
use common::config::Settings;
use common::db::DbPool;
use common::drivers::{BorgSyncDriver, SqlcmdDriver};
use common::notify;
use common::scheduler::{EngineConfig, EngineDrivers, Scheduler, SchedulerEngine};
use common::store::PgJobStore;
use common::telemetry;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!(
        timezone = %settings.scheduler.timezone,
        backup_root = %settings.backup.root_dir,
        "Starting backup orchestrator"
    );

    let db_pool = DbPool::connect(&settings.database).await.map_err(|e| {
        error!(error = %e, "History database unavailable at startup");
        e
    })?;
    db_pool.migrate().await.map_err(|e| {
        error!(error = %e, "Failed to run database migrations");
        e
    })?;
    info!("Database ready");

    let engine_config = EngineConfig::from_settings(&settings)?;
    let store = Arc::new(PgJobStore::new(
        db_pool.clone(),
        engine_config.backups.clone(),
    ));
    let drivers = EngineDrivers {
        database: Arc::new(SqlcmdDriver::new(&settings.backup)),
        sync: Arc::new(BorgSyncDriver::new(&settings.sync, &settings.backup.root_dir)),
    };
    let notifier = notify::from_config(&settings.notification)?;

    let engine = Arc::new(SchedulerEngine::new(
        engine_config,
        store,
        drivers,
        notifier,
    ));

    let engine_for_shutdown = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot install Ctrl+C handler");
            return;
        }
        info!("Ctrl+C received, draining runs");
        if let Err(e) = engine_for_shutdown.stop().await {
            error!(error = %e, "Engine refused to stop");
        }
    });

    let result = engine.start().await;

    db_pool.close().await;
    telemetry::shutdown_tracer();

    if let Err(e) = result {
        error!(error = %e, "Engine exited with an error");
        return Err(e.into());
    }
    info!("Backup orchestrator stopped");
    Ok(())
}
