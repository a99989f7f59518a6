//! Scheduler state machine.
//!
//! The scheduler owns its state and processes [`SchedulerEvent`]s one at a
//! time from a bounded mailbox. Orchestrator callbacks and the monitor's
//! synthetic loss events share that mailbox through [`SchedulerHandle`].
//!
//! ## Lifecycle
//!
//! - `Unregistered` until the orchestrator assigns an instance id
//! - `Registered`: the id is persisted, cluster state for that id is bound
//!   (reloaded if it exists), the monitor is seeded with every known task,
//!   a baseline resource request is sent and the reaper starts
//! - `Disconnected` returns to `Unregistered` but keeps the binding, so a
//!   re-registration under the same id resumes where it left off
//!
//! Event handlers never fail the loop: every error is logged.

use std::sync::Arc;

use chrono::Utc;
use esfm_id::{AgentId, ExecutorId, InstanceId, OfferId};
use esfm_store::PersistentStore;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Configuration;
use crate::driver::{DriverError, OrchestratorDriver};
use crate::model::{ClusterTask, ResourceOffer, TaskStatus};
use crate::monitor::{ClusterMonitor, MonitorError};
use crate::offer_strategy::{OfferResult, OfferStrategy};
use crate::reaper::TaskReaper;
use crate::state::{ClusterState, ClusterStateError, FrameworkState, FrameworkStateError};
use crate::task_factory::{TaskFactory, TaskFactoryError};

/// Default mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

/// Errors raised while handling an event.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("cluster state error: {0}")]
    ClusterState(#[from] ClusterStateError),

    #[error("framework state error: {0}")]
    FrameworkState(#[from] FrameworkStateError),

    #[error("task factory error: {0}")]
    TaskFactory(#[from] TaskFactoryError),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("scheduler mailbox full")]
    MailboxFull,

    #[error("scheduler stopped")]
    Stopped,
}

// =============================================================================
// Events
// =============================================================================

/// Inbound orchestrator events.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Registered { instance_id: InstanceId },
    ResourceOffers(Vec<ResourceOffer>),
    StatusUpdate(TaskStatus),
    ExecutorLost { executor_id: ExecutorId, agent_id: AgentId },
    AgentLost { agent_id: AgentId },
    OfferRescinded { offer_id: OfferId },
    Disconnected,
    Error { message: String },
}

impl SchedulerEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::ResourceOffers(_) => "resource_offers",
            Self::StatusUpdate(_) => "status_update",
            Self::ExecutorLost { .. } => "executor_lost",
            Self::AgentLost { .. } => "agent_lost",
            Self::OfferRescinded { .. } => "offer_rescinded",
            Self::Disconnected => "disconnected",
            Self::Error { .. } => "error",
        }
    }
}

/// Sending side of the scheduler mailbox.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    /// Send an event, waiting for mailbox space.
    pub async fn send(&self, event: SchedulerEvent) -> Result<(), SchedulerError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| SchedulerError::Stopped)
    }

    /// Send an event without waiting.
    pub fn try_send(&self, event: SchedulerEvent) -> Result<(), SchedulerError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SchedulerError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => SchedulerError::Stopped,
        })
    }
}

/// Create a scheduler mailbox.
pub fn mailbox(capacity: usize) -> (SchedulerHandle, mpsc::Receiver<SchedulerEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (SchedulerHandle { tx }, rx)
}

// =============================================================================
// Scheduler
// =============================================================================

/// Registration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Unregistered,
    Registered,
}

/// State bound to one instance id.
struct Binding {
    instance_id: InstanceId,
    cluster_state: Arc<ClusterState>,
    monitor: Arc<ClusterMonitor>,
    reaper_shutdown: watch::Sender<bool>,
    reaper: JoinHandle<()>,
}

impl Binding {
    fn stop(self) {
        self.monitor.stop();
        let _ = self.reaper_shutdown.send(true);
        drop(self.reaper);
    }
}

/// Keeps the Elasticsearch fleet at its configured size.
pub struct Scheduler {
    config: Arc<Configuration>,
    store: Arc<dyn PersistentStore>,
    driver: Arc<dyn OrchestratorDriver>,
    handle: SchedulerHandle,
    framework_state: FrameworkState,
    strategy: OfferStrategy,
    factory: TaskFactory,
    registration: Registration,
    binding: Option<Binding>,
}

impl Scheduler {
    pub fn new(
        config: Arc<Configuration>,
        store: Arc<dyn PersistentStore>,
        driver: Arc<dyn OrchestratorDriver>,
        handle: SchedulerHandle,
    ) -> Self {
        let namespace = config.state_namespace();
        Self {
            framework_state: FrameworkState::new(Arc::clone(&store), &namespace),
            strategy: OfferStrategy::new(Arc::clone(&config)),
            factory: TaskFactory::new(Arc::clone(&config)),
            config,
            store,
            driver,
            handle,
            registration: Registration::Unregistered,
            binding: None,
        }
    }

    pub fn registration(&self) -> Registration {
        self.registration
    }

    pub fn instance_id(&self) -> Option<&InstanceId> {
        self.binding.as_ref().map(|b| &b.instance_id)
    }

    pub fn cluster_state(&self) -> Option<Arc<ClusterState>> {
        self.binding.as_ref().map(|b| Arc::clone(&b.cluster_state))
    }

    pub fn monitor(&self) -> Option<Arc<ClusterMonitor>> {
        self.binding.as_ref().map(|b| Arc::clone(&b.monitor))
    }

    /// Process events until shutdown is signalled.
    ///
    /// The scheduler holds a sender for its own health monitor, so the
    /// mailbox stays open for as long as the loop runs.
    #[instrument(skip_all)]
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SchedulerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Scheduler event loop started");
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle(event).await,
                _ = shutdown.changed() => {
                    info!("Scheduler shutting down");
                    break;
                }
            }
        }
        self.stop();
    }

    /// Handle one event. Errors are logged, never returned.
    pub async fn handle(&mut self, event: SchedulerEvent) {
        let kind = event.kind();
        debug!(event = kind, "Handling scheduler event");

        let result = match event {
            SchedulerEvent::Registered { instance_id } => self.registered(instance_id).await,
            SchedulerEvent::ResourceOffers(offers) => self.resource_offers(offers).await,
            SchedulerEvent::StatusUpdate(status) => self.status_update(status),
            SchedulerEvent::ExecutorLost {
                executor_id,
                agent_id,
            } => self.executor_lost(executor_id, agent_id).await,
            SchedulerEvent::AgentLost { agent_id } => self.agent_lost(agent_id).await,
            SchedulerEvent::OfferRescinded { offer_id } => {
                info!(offer_id = %offer_id, "Offer rescinded");
                Ok(())
            }
            SchedulerEvent::Disconnected => {
                warn!("Disconnected from orchestrator");
                self.registration = Registration::Unregistered;
                Ok(())
            }
            SchedulerEvent::Error { message } => {
                error!(message = %message, "Orchestrator reported an error");
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(event = kind, error = %e, "Failed to handle scheduler event");
        }
    }

    /// Cancel health jobs and the reaper. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(binding) = self.binding.take() {
            info!(instance_id = %binding.instance_id, "Stopping scheduler");
            binding.stop();
        }
        self.registration = Registration::Unregistered;
    }

    async fn registered(&mut self, instance_id: InstanceId) -> Result<(), SchedulerError> {
        self.framework_state.set_instance_id(&instance_id)?;

        let rebind = self
            .binding
            .as_ref()
            .is_none_or(|b| b.instance_id != instance_id);

        if rebind {
            if let Some(old) = self.binding.take() {
                info!(
                    old_instance_id = %old.instance_id,
                    instance_id = %instance_id,
                    "Instance id changed, dropping previous binding"
                );
                old.stop();
            }
            self.binding = Some(self.bind(instance_id.clone())?);
        }

        self.registration = Registration::Registered;
        info!(instance_id = %instance_id, rebind, "Framework registered");

        let request = self.config.framework_resources();
        self.driver.request_resources(&request).await?;
        Ok(())
    }

    fn bind(&self, instance_id: InstanceId) -> Result<Binding, SchedulerError> {
        let cluster_state = Arc::new(ClusterState::new(
            Arc::clone(&self.store),
            &self.config.state_namespace(),
            &instance_id,
        ));
        let tasks = cluster_state.get_all()?;
        if !tasks.is_empty() {
            info!(
                instance_id = %instance_id,
                tasks = tasks.len(),
                "Reloaded cluster state"
            );
        }

        let monitor = Arc::new(ClusterMonitor::new(
            Arc::clone(&self.config),
            Arc::clone(&self.driver),
            self.handle.clone(),
            &tasks,
        )?);

        let (reaper_shutdown, reaper_rx) = watch::channel(false);
        let reaper = TaskReaper::new(
            Arc::clone(&self.config),
            Arc::clone(&self.driver),
            Arc::clone(&cluster_state),
        );
        let reaper = tokio::spawn(async move { reaper.run(reaper_rx).await });

        Ok(Binding {
            instance_id,
            cluster_state,
            monitor,
            reaper_shutdown,
            reaper,
        })
    }

    async fn resource_offers(&mut self, offers: Vec<ResourceOffer>) -> Result<(), SchedulerError> {
        let Some(binding) = self.binding.as_ref() else {
            warn!(count = offers.len(), "Offers received before registration, declining");
            for offer in &offers {
                self.decline(&offer.id).await;
            }
            return Ok(());
        };
        let cluster_state = Arc::clone(&binding.cluster_state);
        let monitor = Arc::clone(&binding.monitor);

        for offer in offers {
            match self.launch_offer(&offer, &cluster_state).await {
                Ok(Some(task)) => self.record_launch(task, &cluster_state, &monitor).await,
                Ok(None) => self.decline(&offer.id).await,
                Err(e) => {
                    error!(offer_id = %offer.id, error = %e, "Failed to process offer");
                    self.decline(&offer.id).await;
                }
            }
        }
        Ok(())
    }

    /// Evaluate an offer and launch a task on it if accepted.
    ///
    /// `Ok(None)` and `Err` both mean the offer was not used.
    async fn launch_offer(
        &self,
        offer: &ResourceOffer,
        cluster_state: &ClusterState,
    ) -> Result<Option<ClusterTask>, SchedulerError> {
        let tasks = cluster_state.get_all()?;

        if let OfferResult::Decline(reason) = self.strategy.evaluate(offer, &tasks) {
            debug!(offer_id = %offer.id, reason, "Offer declined");
            return Ok(None);
        }

        let descriptor = self.factory.create_task(offer, &tasks, Utc::now())?;
        self.driver.launch_task(&offer.id, &descriptor).await?;
        info!(
            task_id = %descriptor.task_id,
            hostname = %offer.hostname,
            "Launched Elasticsearch task"
        );
        Ok(Some(ClusterTask::new(descriptor)))
    }

    /// Persist and monitor a launched task.
    ///
    /// A task that cannot be persisted stays monitored and is killed, since
    /// neither the reaper nor the offer rules would ever see it.
    async fn record_launch(
        &self,
        task: ClusterTask,
        cluster_state: &ClusterState,
        monitor: &ClusterMonitor,
    ) {
        monitor.track(&task);

        if let Err(e) = cluster_state.add(task.clone()) {
            error!(
                task_id = %task.task_id(),
                error = %e,
                "Failed to persist launched task, killing it"
            );
            self.kill(&task).await;
        }
    }

    async fn decline(&self, offer_id: &OfferId) {
        if let Err(e) = self.driver.decline_offer(offer_id).await {
            warn!(offer_id = %offer_id, error = %e, "Failed to decline offer");
        }
    }

    fn status_update(&mut self, status: TaskStatus) -> Result<(), SchedulerError> {
        info!(
            task_id = %status.task_id,
            state = %status.state,
            message = %status.message,
            "Status update"
        );

        let Some(binding) = self.binding.as_ref() else {
            warn!(task_id = %status.task_id, "Status update before registration, ignoring");
            return Ok(());
        };

        match binding.cluster_state.update(&status) {
            Ok(_) => {}
            Err(ClusterStateError::UnknownTask(task_id)) => {
                warn!(task_id = %task_id, "Status update for unknown task, ignoring");
                // An unpersisted launch may still be monitored
                binding.monitor.update(&status);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        binding.monitor.update(&status);

        if status.state.is_terminal() {
            binding.cluster_state.remove(&status.task_id)?;
            info!(
                task_id = %status.task_id,
                state = %status.state,
                "Removed terminal task from cluster state"
            );
        }
        Ok(())
    }

    async fn executor_lost(
        &mut self,
        executor_id: ExecutorId,
        agent_id: AgentId,
    ) -> Result<(), SchedulerError> {
        warn!(executor_id = %executor_id, agent_id = %agent_id, "Executor lost");

        let Some(binding) = self.binding.as_ref() else {
            return Ok(());
        };
        let Some(task) = binding.cluster_state.find_by_executor(&executor_id)? else {
            debug!(executor_id = %executor_id, "Lost executor has no task in cluster state");
            return Ok(());
        };

        self.lose_task(task, format!("Executor {executor_id} lost on agent {agent_id}"))
            .await;
        Ok(())
    }

    async fn agent_lost(&mut self, agent_id: AgentId) -> Result<(), SchedulerError> {
        warn!(agent_id = %agent_id, "Agent lost");

        let Some(binding) = self.binding.as_ref() else {
            return Ok(());
        };
        let tasks = binding.cluster_state.find_by_agent(&agent_id)?;

        for task in tasks {
            self.lose_task(task, format!("Agent {agent_id} lost")).await;
        }
        Ok(())
    }

    /// Mark a task LOST through the normal status path, then kill it.
    ///
    /// The kill is issued even when recording the LOST status fails.
    async fn lose_task(&mut self, task: ClusterTask, message: String) {
        let status = TaskStatus::lost(&task.descriptor, message, Utc::now());
        if let Err(e) = self.status_update(status) {
            error!(
                task_id = %task.task_id(),
                error = %e,
                "Failed to record LOST status, killing anyway"
            );
        }
        self.kill(&task).await;
    }

    async fn kill(&self, task: &ClusterTask) {
        if let Err(e) = self.driver.kill_task(task.task_id()).await {
            warn!(task_id = %task.task_id(), error = %e, "Kill request failed");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
