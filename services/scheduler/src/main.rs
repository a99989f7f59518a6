//! esfm scheduler
//!
//! Registers with the orchestrator and keeps an Elasticsearch fleet at the
//! configured size.
//!
//! ## Architecture
//!
//! - **Event loop**: the scheduler consumes orchestrator callbacks from a
//!   bounded mailbox
//! - **Monitor**: per-task health jobs feed executor-lost events back into
//!   the same mailbox
//! - **Reaper**: periodically kills tasks above the desired count
//!
//! Only the recording driver ships today, so the binary is useful in dev mode.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use esfm_id::{InstanceId, Ulid};
use esfm_scheduler::{
    mailbox, scheduler::DEFAULT_MAILBOX_CAPACITY, Configuration, FrameworkInfo, FrameworkState,
    RecordingDriver, Scheduler, SchedulerEvent,
};
use esfm_store::{PersistentStore, SqliteStore};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Configuration::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting esfm scheduler");
    config.validate()?;
    info!(
        nodes = config.elasticsearch_nodes,
        cluster_name = %config.cluster_name,
        framework_name = %config.framework_name,
        store_path = %config.store_path,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );
    let config = Arc::new(config);

    let store: Arc<dyn PersistentStore> =
        Arc::new(SqliteStore::open(&config.store_path, config.store_timeout)?);

    // A stored instance id means we are failing over from a previous run
    let previous = FrameworkState::new(Arc::clone(&store), &config.state_namespace())
        .instance_id()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Could not read stored instance id, registering fresh");
            None
        });
    let framework = FrameworkInfo::from_config(&config, previous.clone());
    info!(
        name = %framework.name,
        role = %framework.role,
        failover_timeout_secs = framework.failover_timeout_secs,
        previous_instance_id = ?framework.previous_instance_id,
        "Framework identity"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, events) = mailbox(DEFAULT_MAILBOX_CAPACITY);

    let driver = Arc::new(RecordingDriver::new());
    let scheduler = Scheduler::new(Arc::clone(&config), store, driver, handle.clone());
    let mut scheduler_handle = tokio::spawn(scheduler.run(events, shutdown_rx));

    if config.dev_mode {
        let instance_id = match previous {
            Some(id) => id,
            None => InstanceId::parse(&format!("dev-{}", Ulid::new()))?,
        };
        info!(instance_id = %instance_id, "Dev mode, registering against recording driver");
        handle.send(SchedulerEvent::Registered { instance_id }).await?;
    } else {
        warn!("No orchestrator driver configured; waiting for shutdown");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut scheduler_handle => {
            if let Err(e) = result {
                error!(error = %e, "Scheduler task panicked");
            }
            info!("Scheduler exited");
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for scheduler to shut down...");
    if tokio::time::timeout(Duration::from_secs(5), scheduler_handle)
        .await
        .is_err()
    {
        warn!("Scheduler did not stop in time");
    }

    info!("Scheduler shutdown complete");
    Ok(())
}
