//! Per-task health monitoring.
//!
//! The orchestrator does not reliably report executor death, so every
//! tracked task gets a [`HealthMonitorEntry`] running two periodic jobs:
//!
//! - **Liveness check** (every half health period): compares the task's
//!   latest status timestamp with the last one it accepted. A gap above the
//!   executor timeout sends a synthetic `ExecutorLost` into the scheduler's
//!   mailbox, the same entry point real loss events use.
//! - **Reconciliation ping** (every health period): asks the orchestrator
//!   to re-send the task's true status.
//!
//! An overdue liveness check does not advance its marker, so it keeps
//! reporting the loss on every poll until the task stops being tracked.
//! The scheduler's reaction (LOST status, terminal, untrack) ends it.
//!
//! Tracking always starts from a zero timestamp, including for tasks
//! reloaded after a restart, so no stored timestamp is ever a baseline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use esfm_id::TaskId;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::Configuration;
use crate::driver::OrchestratorDriver;
use crate::model::{ClusterTask, TaskDescriptor, TaskStatus};
use crate::scheduler::{SchedulerEvent, SchedulerHandle};

/// Timestamps closer to zero than this are "never reported".
const TIMESTAMP_EPSILON: f64 = 1e-12;

/// Errors from constructing a monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("executor timeout must be greater than zero")]
    NonPositiveTimeout,

    #[error("health check period must be greater than zero")]
    NonPositivePeriod,
}

// =============================================================================
// Liveness
// =============================================================================

/// Result of one liveness observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The status carries no timestamp yet.
    Ignored,
    /// Within the timeout; the marker advanced.
    Alive { since_last_ms: i64 },
    /// Past the timeout; the marker did not move.
    Overdue { since_last_ms: i64 },
}

/// Timestamp-gap liveness tracker for one task.
#[derive(Debug, Clone)]
pub struct LivenessCheck {
    last_update_ms: i64,
    max_timeout_ms: i64,
}

impl LivenessCheck {
    pub fn new(max_timeout: Duration) -> Result<Self, MonitorError> {
        let max_timeout_ms = i64::try_from(max_timeout.as_millis()).unwrap_or(i64::MAX);
        if max_timeout_ms <= 0 {
            return Err(MonitorError::NonPositiveTimeout);
        }
        Ok(Self {
            last_update_ms: i64::MAX,
            max_timeout_ms,
        })
    }

    pub fn last_update_ms(&self) -> i64 {
        self.last_update_ms
    }

    /// Observe the latest status timestamp (seconds).
    pub fn observe(&mut self, timestamp_secs: f64) -> Liveness {
        if timestamp_secs.abs() < TIMESTAMP_EPSILON {
            return Liveness::Ignored;
        }

        let this_update_ms = (timestamp_secs * 1000.0) as i64;
        let since_last_ms = this_update_ms.saturating_sub(self.last_update_ms);

        if since_last_ms > self.max_timeout_ms {
            Liveness::Overdue { since_last_ms }
        } else {
            self.last_update_ms = this_update_ms;
            Liveness::Alive { since_last_ms }
        }
    }
}

// =============================================================================
// Entries
// =============================================================================

/// Health jobs and latest status for one tracked task.
///
/// Dropping the entry cancels its jobs.
pub struct HealthMonitorEntry {
    status: watch::Sender<TaskStatus>,
    shutdown: watch::Sender<bool>,
    jobs: Vec<JoinHandle<()>>,
}

impl HealthMonitorEntry {
    pub fn latest(&self) -> TaskStatus {
        self.status.borrow().clone()
    }

    fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Returns true once both jobs have exited.
    pub fn is_finished(&self) -> bool {
        self.jobs.iter().all(JoinHandle::is_finished)
    }
}

impl Drop for HealthMonitorEntry {
    fn drop(&mut self) {
        self.cancel();
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Tracks the health of every live cluster task.
pub struct ClusterMonitor {
    config: Arc<Configuration>,
    driver: Arc<dyn OrchestratorDriver>,
    events: SchedulerHandle,
    entries: Mutex<HashMap<TaskId, HealthMonitorEntry>>,
}

impl ClusterMonitor {
    /// Create a monitor and start tracking `initial` tasks.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: Arc<Configuration>,
        driver: Arc<dyn OrchestratorDriver>,
        events: SchedulerHandle,
        initial: &[ClusterTask],
    ) -> Result<Self, MonitorError> {
        if config.executor_timeout.is_zero() {
            return Err(MonitorError::NonPositiveTimeout);
        }
        if config.liveness_interval().is_zero() {
            return Err(MonitorError::NonPositivePeriod);
        }

        let monitor = Self {
            config,
            driver,
            events,
            entries: Mutex::new(HashMap::new()),
        };
        for task in initial {
            monitor.track(task);
        }
        info!(tracked = monitor.len(), "Cluster monitor started");
        Ok(monitor)
    }

    /// Start monitoring a task. Returns false if it was already tracked or
    /// its status is terminal.
    pub fn track(&self, task: &ClusterTask) -> bool {
        if task.status.state.is_terminal() {
            debug!(task_id = %task.task_id(), "Not tracking terminal task");
            return false;
        }

        let mut entries = self.entries();
        if entries.contains_key(task.task_id()) {
            debug!(task_id = %task.task_id(), "Task already tracked");
            return false;
        }

        let entry = self.spawn_entry(task);
        entries.insert(task.task_id().clone(), entry);
        info!(task_id = %task.task_id(), "Monitoring task");
        true
    }

    /// Record a status for a tracked task.
    ///
    /// A terminal status removes the entry. Updates for untracked tasks are
    /// no-ops. Returns true if a tracked entry was touched.
    pub fn update(&self, status: &TaskStatus) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get(&status.task_id) else {
            debug!(task_id = %status.task_id, "Status for untracked task ignored");
            return false;
        };

        entry.status.send_replace(status.clone());

        if status.state.is_terminal() {
            entries.remove(&status.task_id);
            info!(
                task_id = %status.task_id,
                state = %status.state,
                "Task reached terminal state, stopped monitoring"
            );
        }
        true
    }

    /// Stop monitoring a task.
    pub fn untrack(&self, task_id: &TaskId) -> bool {
        let removed = self.entries().remove(task_id).is_some();
        if removed {
            info!(task_id = %task_id, "Stopped monitoring task");
        }
        removed
    }

    pub fn is_tracking(&self, task_id: &TaskId) -> bool {
        self.entries().contains_key(task_id)
    }

    /// Latest status since tracking began. Its timestamp stays zero until
    /// the first report arrives.
    pub fn latest_status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.entries().get(task_id).map(HealthMonitorEntry::latest)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every health job. Safe to call more than once.
    pub fn stop(&self) {
        let drained: Vec<_> = self.entries().drain().collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "Cluster monitor stopped");
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TaskId, HealthMonitorEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_entry(&self, task: &ClusterTask) -> HealthMonitorEntry {
        // A stored timestamp may predate a restart; the first report after
        // tracking starts becomes the liveness baseline.
        let seed = TaskStatus {
            timestamp: 0.0,
            ..task.status.clone()
        };
        let (status_tx, status_rx) = watch::channel(seed);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let liveness = LivenessJob {
            descriptor: task.descriptor.clone(),
            check: LivenessCheck {
                last_update_ms: i64::MAX,
                max_timeout_ms: i64::try_from(self.config.executor_timeout.as_millis())
                    .unwrap_or(i64::MAX),
            },
            interval: self.config.liveness_interval(),
            events: self.events.clone(),
        };
        let ping = ReconcilePing {
            task_id: task.task_id().clone(),
            interval: self.config.health_check_period(),
            driver: Arc::clone(&self.driver),
        };

        let jobs = vec![
            tokio::spawn(liveness.run(status_rx.clone(), shutdown_rx.clone())),
            tokio::spawn(ping.run(status_rx, shutdown_rx)),
        ];

        HealthMonitorEntry {
            status: status_tx,
            shutdown: shutdown_tx,
            jobs,
        }
    }
}

impl Drop for ClusterMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

struct LivenessJob {
    descriptor: TaskDescriptor,
    check: LivenessCheck,
    interval: Duration,
    events: SchedulerHandle,
}

impl LivenessJob {
    #[instrument(skip_all, fields(task_id = %self.descriptor.task_id))]
    async fn run(
        mut self,
        status: watch::Receiver<TaskStatus>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = ticker(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let latest = status.borrow().clone();
                    self.poll(&latest);
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Liveness check stopped");
    }

    fn poll(&mut self, latest: &TaskStatus) {
        match self.check.observe(latest.timestamp) {
            Liveness::Ignored => {
                debug!("Status has no timestamp yet, skipping liveness check");
            }
            Liveness::Alive { since_last_ms } => {
                debug!(since_last_ms, "Task is alive");
            }
            Liveness::Overdue { since_last_ms } => {
                let executor_id = self.descriptor.executor.executor_id;
                let agent_id = latest
                    .agent_id
                    .clone()
                    .unwrap_or_else(|| self.descriptor.agent_id.clone());

                warn!(
                    executor_id = %executor_id,
                    since_last_ms,
                    timeout_ms = self.check.max_timeout_ms,
                    "Executor not responding within timeout, reporting it lost"
                );

                let event = SchedulerEvent::ExecutorLost {
                    executor_id,
                    agent_id,
                };
                if let Err(e) = self.events.try_send(event) {
                    warn!(error = %e, "Could not deliver executor lost event, will retry next poll");
                }
            }
        }
    }
}

struct ReconcilePing {
    task_id: TaskId,
    interval: Duration,
    driver: Arc<dyn OrchestratorDriver>,
}

impl ReconcilePing {
    #[instrument(skip_all, fields(task_id = %self.task_id))]
    async fn run(self, status: watch::Receiver<TaskStatus>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = ticker(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let latest = status.borrow().clone();
                    if let Err(e) = self.driver.reconcile_tasks(&[latest]).await {
                        warn!(error = %e, "Reconciliation request failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Reconciliation ping stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RecordingDriver;
    use crate::model::{fixtures, TaskState};

    #[test]
    fn test_liveness_rejects_zero_timeout() {
        assert!(matches!(
            LivenessCheck::new(Duration::ZERO).unwrap_err(),
            MonitorError::NonPositiveTimeout
        ));
    }

    #[test]
    fn test_liveness_ignores_zero_timestamp() {
        let mut check = LivenessCheck::new(Duration::from_secs(10)).unwrap();
        assert_eq!(check.observe(0.0), Liveness::Ignored);
        assert_eq!(check.last_update_ms(), i64::MAX);
    }

    #[test]
    fn test_liveness_first_observation_is_alive() {
        let mut check = LivenessCheck::new(Duration::from_secs(10)).unwrap();
        assert!(matches!(check.observe(1000.0), Liveness::Alive { .. }));
        assert_eq!(check.last_update_ms(), 1_000_000);
    }

    #[test]
    fn test_liveness_within_timeout_advances() {
        let mut check = LivenessCheck::new(Duration::from_secs(10)).unwrap();
        check.observe(1000.0);
        assert_eq!(
            check.observe(1005.0),
            Liveness::Alive {
                since_last_ms: 5000
            }
        );
        assert_eq!(check.last_update_ms(), 1_005_000);
    }

    #[test]
    fn test_liveness_overdue_does_not_advance() {
        let mut check = LivenessCheck::new(Duration::from_secs(10)).unwrap();
        check.observe(1000.0);

        assert_eq!(
            check.observe(1011.0),
            Liveness::Overdue {
                since_last_ms: 11_000
            }
        );
        assert_eq!(check.last_update_ms(), 1_000_000);

        // Still overdue on the next poll
        assert!(matches!(check.observe(1011.0), Liveness::Overdue { .. }));
    }

    #[tokio::test]
    async fn test_tracking_starts_from_zero_timestamp() {
        let (handle, _events) = crate::scheduler::mailbox(4);
        let monitor = ClusterMonitor::new(
            Arc::new(Configuration::default()),
            Arc::new(RecordingDriver::new()),
            handle,
            &[],
        )
        .unwrap();

        let mut task = fixtures::task("task-1", "agent-1");
        task.status.state = TaskState::Running;
        task.status.timestamp = 1000.0;
        assert!(monitor.track(&task));

        let latest = monitor.latest_status(task.task_id()).unwrap();
        assert_eq!(latest.timestamp, 0.0);
        assert_eq!(latest.state, TaskState::Running);
    }
}
