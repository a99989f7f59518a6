//! Orchestrator driver interface and recording implementation.
//!
//! The driver is the outbound half of the orchestrator connection. Calls
//! are fire-and-forget: `Ok` only means the orchestrator took the request,
//! real outcomes arrive later as status updates.
//!
//! [`RecordingDriver`] accepts every call and records it. It backs tests
//! and the dev-mode binary.

use std::sync::Mutex;

use async_trait::async_trait;
use esfm_id::{OfferId, TaskId};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{ResourceRequest, TaskDescriptor, TaskStatus};

/// Errors from driver calls.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("orchestrator rejected {call}: {reason}")]
    Rejected { call: &'static str, reason: String },

    #[error("driver is not connected")]
    Disconnected,
}

/// Outbound orchestrator operations.
#[async_trait]
pub trait OrchestratorDriver: Send + Sync {
    /// Launch `task` using the resources of `offer_id`.
    async fn launch_task(&self, offer_id: &OfferId, task: &TaskDescriptor) -> Result<(), DriverError>;

    /// Return an offer's resources to the orchestrator.
    async fn decline_offer(&self, offer_id: &OfferId) -> Result<(), DriverError>;

    /// Kill a task. Killing a task that is already gone is harmless.
    async fn kill_task(&self, task_id: &TaskId) -> Result<(), DriverError>;

    /// Ask for offers shaped like `request`.
    async fn request_resources(&self, request: &ResourceRequest) -> Result<(), DriverError>;

    /// Ask the orchestrator to re-send the true status of these tasks.
    async fn reconcile_tasks(&self, statuses: &[TaskStatus]) -> Result<(), DriverError>;
}

/// A recorded driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Launch { offer_id: OfferId, task_id: TaskId },
    Decline { offer_id: OfferId },
    Kill { task_id: TaskId },
    RequestResources(ResourceRequest),
    Reconcile { task_ids: Vec<TaskId> },
}

/// Driver that records calls instead of talking to an orchestrator.
#[derive(Debug, Default)]
pub struct RecordingDriver {
    calls: Mutex<Vec<DriverCall>>,
    reject: bool,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A driver that rejects every call.
    pub fn rejecting() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            reject: true,
        }
    }

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn launches(&self) -> Vec<TaskId> {
        self.filter(|call| match call {
            DriverCall::Launch { task_id, .. } => Some(task_id.clone()),
            _ => None,
        })
    }

    pub fn declines(&self) -> Vec<OfferId> {
        self.filter(|call| match call {
            DriverCall::Decline { offer_id } => Some(offer_id.clone()),
            _ => None,
        })
    }

    pub fn kills(&self) -> Vec<TaskId> {
        self.filter(|call| match call {
            DriverCall::Kill { task_id } => Some(task_id.clone()),
            _ => None,
        })
    }

    pub fn reconciles(&self) -> Vec<Vec<TaskId>> {
        self.filter(|call| match call {
            DriverCall::Reconcile { task_ids } => Some(task_ids.clone()),
            _ => None,
        })
    }

    pub fn resource_requests(&self) -> Vec<ResourceRequest> {
        self.filter(|call| match call {
            DriverCall::RequestResources(request) => Some(request.clone()),
            _ => None,
        })
    }

    fn filter<T>(&self, f: impl Fn(&DriverCall) -> Option<T>) -> Vec<T> {
        self.calls().iter().filter_map(f).collect()
    }

    fn record(&self, name: &'static str, call: DriverCall) -> Result<(), DriverError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        if self.reject {
            return Err(DriverError::Rejected {
                call: name,
                reason: "recording driver configured to reject".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OrchestratorDriver for RecordingDriver {
    async fn launch_task(&self, offer_id: &OfferId, task: &TaskDescriptor) -> Result<(), DriverError> {
        info!(
            offer_id = %offer_id,
            task_id = %task.task_id,
            hostname = %task.hostname,
            cpus = task.resources.cpus,
            mem = task.resources.mem,
            "[MOCK] Launching task"
        );
        self.record(
            "launch_task",
            DriverCall::Launch {
                offer_id: offer_id.clone(),
                task_id: task.task_id.clone(),
            },
        )
    }

    async fn decline_offer(&self, offer_id: &OfferId) -> Result<(), DriverError> {
        debug!(offer_id = %offer_id, "[MOCK] Declining offer");
        self.record(
            "decline_offer",
            DriverCall::Decline {
                offer_id: offer_id.clone(),
            },
        )
    }

    async fn kill_task(&self, task_id: &TaskId) -> Result<(), DriverError> {
        info!(task_id = %task_id, "[MOCK] Killing task");
        self.record(
            "kill_task",
            DriverCall::Kill {
                task_id: task_id.clone(),
            },
        )
    }

    async fn request_resources(&self, request: &ResourceRequest) -> Result<(), DriverError> {
        info!(
            cpus = request.cpus,
            mem = request.mem,
            disk = ?request.disk,
            role = %request.role,
            "[MOCK] Requesting resources"
        );
        self.record("request_resources", DriverCall::RequestResources(request.clone()))
    }

    async fn reconcile_tasks(&self, statuses: &[TaskStatus]) -> Result<(), DriverError> {
        debug!(count = statuses.len(), "[MOCK] Reconciling tasks");
        self.record(
            "reconcile_tasks",
            DriverCall::Reconcile {
                task_ids: statuses.iter().map(|s| s.task_id.clone()).collect(),
            },
        )
    }
}
