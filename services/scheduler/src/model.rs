//! Scheduler data model.
//!
//! - [`ResourceOffer`]: resources the orchestrator offers on one agent
//! - [`TaskDescriptor`]: immutable description of a launched task
//! - [`TaskStatus`]: latest-wins lifecycle state of a task
//! - [`ClusterTask`]: the (descriptor, status) pair the scheduler tracks

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use esfm_id::{AgentId, ExecutorId, InstanceId, OfferId, TaskId};
use serde::{Deserialize, Serialize};

use crate::config::Configuration;

// =============================================================================
// Resources
// =============================================================================

/// Inclusive range of ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(begin: u16, end: u16) -> Self {
        Self { begin, end }
    }

    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.begin <= port && port <= self.end
    }
}

/// A resource vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    pub ports: Vec<PortRange>,
}

impl Resources {
    /// Returns true if any range contains `port`.
    pub fn has_port(&self, port: u16) -> bool {
        self.ports.iter().any(|range| range.contains(port))
    }

    /// Pick a client and a transport port from the offered ranges.
    ///
    /// Ranges are scanned in order. Each range contributes its start, and
    /// start + 1 when it spans more than one port, until two are chosen.
    pub fn select_two_ports(&self) -> Option<(u16, u16)> {
        let mut ports: Vec<u16> = Vec::with_capacity(2);
        for range in &self.ports {
            if ports.len() >= 2 {
                break;
            }
            ports.push(range.begin);
            if ports.len() < 2 && range.begin != range.end {
                ports.push(range.begin.saturating_add(1));
            }
        }

        match ports.as_slice() {
            [client, transport] => Some((*client, *transport)),
            _ => None,
        }
    }
}

/// Resources offered by the orchestrator on one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceOffer {
    pub id: OfferId,
    pub hostname: String,
    pub agent_id: AgentId,
    pub resources: Resources,
}

/// Baseline resource request sent on registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpus: f64,
    pub mem: f64,
    /// Omitted when volumes are provisioned externally.
    pub disk: Option<f64>,
    pub role: String,
}

// =============================================================================
// Tasks
// =============================================================================

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Error,
}

impl TaskState {
    /// Returns true if no further transition is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Failed | Self::Killed | Self::Lost | Self::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staging => "STAGING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
            Self::Lost => "LOST",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest observed status of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Seconds since the epoch, fractional. Zero means "never reported".
    pub timestamp: f64,
    pub message: String,
    pub agent_id: Option<AgentId>,
    pub executor_id: Option<ExecutorId>,
}

impl TaskStatus {
    pub const DEFAULT_MESSAGE: &'static str = "Default status. No message set.";

    /// Status assumed for a task the orchestrator has not reported on yet.
    pub fn staging(descriptor: &TaskDescriptor) -> Self {
        Self {
            task_id: descriptor.task_id.clone(),
            state: TaskState::Staging,
            timestamp: 0.0,
            message: Self::DEFAULT_MESSAGE.to_string(),
            agent_id: Some(descriptor.agent_id.clone()),
            executor_id: Some(descriptor.executor.executor_id),
        }
    }

    /// Synthetic LOST status for a task whose executor or agent went away.
    pub fn lost(descriptor: &TaskDescriptor, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: descriptor.task_id.clone(),
            state: TaskState::Lost,
            timestamp: epoch_seconds(now),
            message: message.into(),
            agent_id: Some(descriptor.agent_id.clone()),
            executor_id: Some(descriptor.executor.executor_id),
        }
    }
}

/// Fractional epoch seconds, as the orchestrator reports them.
pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// How to start the executor that runs one Elasticsearch node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorLaunch {
    pub executor_id: ExecutorId,
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Immutable description of a launched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub name: String,
    pub hostname: String,
    pub agent_id: AgentId,
    pub executor: ExecutorLaunch,
    /// Reserved resources; `ports` holds the client and transport ports.
    pub resources: Resources,
    pub client_port: u16,
    pub transport_port: u16,
    /// External-volume node id tag.
    pub node_id: Option<u32>,
    pub started_at: DateTime<Utc>,
}

impl TaskDescriptor {
    pub fn client_address(&self) -> String {
        format!("{}:{}", self.hostname, self.client_port)
    }

    pub fn transport_address(&self) -> String {
        format!("{}:{}", self.hostname, self.transport_port)
    }
}

/// A task tracked by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTask {
    pub descriptor: TaskDescriptor,
    pub status: TaskStatus,
}

impl ClusterTask {
    /// A freshly launched task with the default STAGING status.
    pub fn new(descriptor: TaskDescriptor) -> Self {
        let status = TaskStatus::staging(&descriptor);
        Self { descriptor, status }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.descriptor.task_id
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary::from(self)
    }
}

/// Read-only view of a task for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub hostname: String,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    pub client_address: String,
    pub transport_address: String,
}

impl From<&ClusterTask> for TaskSummary {
    fn from(task: &ClusterTask) -> Self {
        Self {
            task_id: task.descriptor.task_id.clone(),
            hostname: task.descriptor.hostname.clone(),
            state: task.status.state,
            started_at: task.descriptor.started_at,
            client_address: task.descriptor.client_address(),
            transport_address: task.descriptor.transport_address(),
        }
    }
}

// =============================================================================
// Framework
// =============================================================================

/// Identity the scheduler registers with.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameworkInfo {
    pub name: String,
    pub role: String,
    pub failover_timeout_secs: u64,
    pub checkpoint: bool,
    /// Set when re-registering after a restart.
    pub previous_instance_id: Option<InstanceId>,
}

impl FrameworkInfo {
    pub fn from_config(config: &Configuration, previous_instance_id: Option<InstanceId>) -> Self {
        Self {
            name: config.framework_name.clone(),
            role: config.framework_role.clone(),
            failover_timeout_secs: config.framework_failover_timeout_secs,
            checkpoint: true,
            previous_instance_id,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Builders shared by unit tests.

    use super::*;
    use chrono::TimeZone;

    pub fn offer(id: &str, host: &str, agent: &str, ports: Vec<PortRange>) -> ResourceOffer {
        ResourceOffer {
            id: OfferId::parse(id).unwrap(),
            hostname: host.to_string(),
            agent_id: AgentId::parse(agent).unwrap(),
            resources: Resources {
                cpus: 1.0,
                mem: 256.0,
                disk: 1024.0,
                ports,
            },
        }
    }

    pub fn descriptor(task: &str, agent: &str) -> TaskDescriptor {
        TaskDescriptor {
            task_id: TaskId::parse(task).unwrap(),
            name: "esdemo".to_string(),
            hostname: format!("{agent}.local"),
            agent_id: AgentId::parse(agent).unwrap(),
            executor: ExecutorLaunch {
                executor_id: ExecutorId::new(),
                name: "elasticsearch-executor".to_string(),
                image: "mesos/elasticsearch-executor".to_string(),
                args: vec!["--clusterName".to_string(), "mesos-ha".to_string()],
                env: BTreeMap::new(),
            },
            resources: Resources {
                cpus: 1.0,
                mem: 256.0,
                disk: 1024.0,
                ports: vec![PortRange::single(9200), PortRange::single(9300)],
            },
            client_port: 9200,
            transport_port: 9300,
            node_id: None,
            started_at: Utc.with_ymd_and_hms(2015, 9, 21, 12, 0, 0).unwrap(),
        }
    }

    pub fn task(task: &str, agent: &str) -> ClusterTask {
        ClusterTask::new(descriptor(task, agent))
    }

    pub fn tagged_task(task: &str, agent: &str, node_id: u32) -> ClusterTask {
        let mut descriptor = descriptor(task, agent);
        descriptor.node_id = Some(node_id);
        ClusterTask::new(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(ports: Vec<PortRange>) -> Resources {
        Resources {
            ports,
            ..Resources::default()
        }
    }

    #[test]
    fn test_select_ports_two_single_ranges() {
        let r = resources(vec![PortRange::single(9200), PortRange::single(9300)]);
        assert_eq!(r.select_two_ports(), Some((9200, 9300)));
    }

    #[test]
    fn test_select_ports_from_wide_range() {
        let r = resources(vec![PortRange::new(31000, 32000), PortRange::single(9300)]);
        assert_eq!(r.select_two_ports(), Some((31000, 31001)));
    }

    #[test]
    fn test_select_ports_insufficient() {
        assert_eq!(resources(vec![PortRange::single(9200)]).select_two_ports(), None);
        assert_eq!(resources(vec![]).select_two_ports(), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Staging.is_terminal());
        assert!(!TaskState::Starting.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        for state in [
            TaskState::Finished,
            TaskState::Failed,
            TaskState::Killed,
            TaskState::Lost,
            TaskState::Error,
        ] {
            assert!(state.is_terminal(), "{state} should be terminal");
        }
    }

    #[test]
    fn test_new_cluster_task_defaults_to_staging() {
        let task = fixtures::task("task-1", "agent-1");
        assert_eq!(task.status.state, TaskState::Staging);
        assert_eq!(task.status.timestamp, 0.0);
        assert_eq!(task.status.message, TaskStatus::DEFAULT_MESSAGE);
        assert_eq!(task.status.task_id, task.descriptor.task_id);
    }

    #[test]
    fn test_summary() {
        let task = fixtures::task("task-1", "agent-1");
        let summary = task.summary();
        assert_eq!(summary.client_address, "agent-1.local:9200");
        assert_eq!(summary.transport_address, "agent-1.local:9300");
        assert_eq!(summary.state, TaskState::Staging);
    }

    #[test]
    fn test_task_state_serializes_uppercase() {
        let json = serde_json::to_string(&TaskState::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
    }
}
