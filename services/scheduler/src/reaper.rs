//! Capacity convergence.
//!
//! The reaper runs on its own clock. Each pass compares the number of tasks
//! in cluster state with the desired node count and kills the excess,
//! picking victims from the tail of the cluster state listing.
//! A failed pass is logged; the schedule keeps running.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::config::Configuration;
use crate::driver::{DriverError, OrchestratorDriver};
use crate::state::{ClusterState, ClusterStateError};

/// Errors from a single reaper pass.
#[derive(Debug, Error)]
pub enum ReaperError {
    #[error("cluster state error: {0}")]
    State(#[from] ClusterStateError),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Kills tasks above the desired node count.
pub struct TaskReaper {
    config: Arc<Configuration>,
    driver: Arc<dyn OrchestratorDriver>,
    cluster_state: Arc<ClusterState>,
}

impl TaskReaper {
    pub fn new(
        config: Arc<Configuration>,
        driver: Arc<dyn OrchestratorDriver>,
        cluster_state: Arc<ClusterState>,
    ) -> Self {
        Self {
            config,
            driver,
            cluster_state,
        }
    }

    /// Run until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.reaper_interval.as_secs(),
            desired = self.config.elasticsearch_nodes,
            "Starting task reaper"
        );

        let mut interval = tokio::time::interval(self.config.reaper_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Reaper pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Task reaper shutting down");
                    break;
                }
            }
        }
    }

    /// One convergence pass. Returns the number of kill requests issued.
    pub async fn run_once(&self) -> Result<usize, ReaperError> {
        let tasks = self.cluster_state.get_all()?;
        let excess = esfm_reconcile::excess_count(tasks.len(), self.config.elasticsearch_nodes);

        if excess == 0 {
            debug!(current = tasks.len(), "Cluster at or below desired size");
            return Ok(0);
        }

        info!(
            current = tasks.len(),
            desired = self.config.elasticsearch_nodes,
            excess,
            "Cluster above desired size, killing excess tasks"
        );

        let mut killed = 0;
        for task in esfm_reconcile::select_from_tail(&tasks, excess) {
            info!(task_id = %task.task_id(), hostname = %task.descriptor.hostname, "Reaping task");
            self.driver.kill_task(task.task_id()).await?;
            killed += 1;
        }
        Ok(killed)
    }
}
