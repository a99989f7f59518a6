//! Builds task descriptors from accepted offers.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use esfm_id::{ExecutorId, IdError, TaskId};
use thiserror::Error;
use tracing::info;

use crate::config::Configuration;
use crate::model::{
    ClusterTask, ExecutorLaunch, PortRange, ResourceOffer, Resources, TaskDescriptor,
};
use crate::state::next_node_id;

/// Timestamp layout embedded in task ids.
pub const TASK_DATE_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

/// Task name reported to the orchestrator.
pub const TASK_NAME: &str = "esdemo";

pub const ENV_NODE_ID: &str = "ELASTICSEARCH_NODE_ID";
pub const ENV_VOLUME_DRIVER: &str = "ELASTICSEARCH_VOLUME_DRIVER";
pub const ENV_CONFIG_VOLUME: &str = "ELASTICSEARCH_CONFIG_VOLUME";
pub const ENV_DATA_VOLUME: &str = "ELASTICSEARCH_DATA_VOLUME";

/// Errors from building a task.
#[derive(Debug, Error)]
pub enum TaskFactoryError {
    #[error("offer {offer_id} does not contain two usable ports")]
    MissingPorts { offer_id: String },

    #[error("could not build task id: {0}")]
    InvalidTaskId(#[from] IdError),
}

/// Builds [`TaskDescriptor`]s.
#[derive(Debug, Clone)]
pub struct TaskFactory {
    config: Arc<Configuration>,
}

impl TaskFactory {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self { config }
    }

    /// Build a descriptor for a task on `offer`.
    ///
    /// `existing` is the current cluster listing. The first task in it is
    /// the discovery seed for the new node, and in external-volume mode the
    /// new task takes the lowest node id none of them holds.
    pub fn create_task(
        &self,
        offer: &ResourceOffer,
        existing: &[ClusterTask],
        now: DateTime<Utc>,
    ) -> Result<TaskDescriptor, TaskFactoryError> {
        let (client_port, transport_port) = match self.config.pinned_ports() {
            Some(ports) => ports,
            None => offer
                .resources
                .select_two_ports()
                .ok_or_else(|| TaskFactoryError::MissingPorts {
                    offer_id: offer.id.to_string(),
                })?,
        };

        let task_id = task_id(&offer.hostname, now)?;
        let node_id = self
            .config
            .uses_external_volumes()
            .then(|| next_node_id(existing));

        info!(
            task_id = %task_id,
            hostname = %offer.hostname,
            client_port,
            transport_port,
            node_id = ?node_id,
            "Creating Elasticsearch task"
        );

        let executor_id = ExecutorId::new();
        let executor = ExecutorLaunch {
            executor_id,
            name: format!("{}-{}", self.config.executor_name, executor_id),
            image: self.config.executor_image.clone(),
            args: self.executor_args(existing),
            env: self.executor_env(node_id),
        };

        Ok(TaskDescriptor {
            task_id,
            name: TASK_NAME.to_string(),
            hostname: offer.hostname.clone(),
            agent_id: offer.agent_id.clone(),
            executor,
            resources: Resources {
                cpus: self.config.cpus,
                mem: self.config.mem,
                disk: if self.config.uses_external_volumes() {
                    0.0
                } else {
                    self.config.disk
                },
                ports: vec![
                    PortRange::single(client_port),
                    PortRange::single(transport_port),
                ],
            },
            client_port,
            transport_port,
            node_id,
            started_at: now,
        })
    }

    fn executor_args(&self, existing: &[ClusterTask]) -> Vec<String> {
        let mut args = vec![
            "--clusterName".to_string(),
            self.config.cluster_name.clone(),
            "--elasticsearchNodes".to_string(),
            self.config.elasticsearch_nodes.to_string(),
        ];
        if let Some(seed) = existing.first() {
            args.push("--elasticsearchHost".to_string());
            args.push(seed.descriptor.transport_address());
        }
        args
    }

    fn executor_env(&self, node_id: Option<u32>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let (Some(node_id), Some(driver)) = (node_id, &self.config.external_volume_driver) else {
            return env;
        };

        let framework = &self.config.framework_name;
        env.insert(ENV_NODE_ID.to_string(), node_id.to_string());
        env.insert(ENV_VOLUME_DRIVER.to_string(), driver.clone());
        env.insert(
            ENV_CONFIG_VOLUME.to_string(),
            format!("{framework}{node_id}config"),
        );
        env.insert(
            ENV_DATA_VOLUME.to_string(),
            format!("{framework}{node_id}data"),
        );
        env
    }
}

/// `elasticsearch_{hostname}_{yyyyMMddTHHmmss.SSSZ}`
pub fn task_id(hostname: &str, now: DateTime<Utc>) -> Result<TaskId, IdError> {
    TaskId::parse(&format!(
        "elasticsearch_{}_{}",
        hostname,
        now.format(TASK_DATE_FORMAT)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 9, 21, 12, 30, 45).unwrap() + chrono::Duration::milliseconds(123)
    }

    fn offer() -> ResourceOffer {
        fixtures::offer(
            "offer-1",
            "host1",
            "agent-1",
            vec![PortRange::new(31000, 31001), PortRange::single(31500)],
        )
    }

    #[test]
    fn test_task_id_format() {
        let id = task_id("host1", now()).unwrap();
        assert_eq!(id.as_str(), "elasticsearch_host1_20150921T123045.123Z");
    }

    #[test]
    fn test_create_task_uses_scanned_ports() {
        let factory = TaskFactory::new(Arc::new(Configuration::default()));
        let task = factory.create_task(&offer(), &[], now()).unwrap();

        assert_eq!(task.client_port, 31000);
        assert_eq!(task.transport_port, 31001);
        assert_eq!(task.hostname, "host1");
        assert_eq!(task.agent_id.as_str(), "agent-1");
        assert_eq!(task.started_at, now());
        assert_eq!(task.node_id, None);
        assert!(task.executor.env.is_empty());
        assert!(task.executor.name.starts_with("elasticsearch-executor-exec_"));
        assert_eq!(
            task.executor.args,
            vec!["--clusterName", "mesos-ha", "--elasticsearchNodes", "3"]
        );
    }

    #[test]
    fn test_create_task_prefers_pinned_ports() {
        let config = Configuration {
            elasticsearch_ports: vec![9200, 9300],
            ..Configuration::default()
        };
        let factory = TaskFactory::new(Arc::new(config));
        let task = factory.create_task(&offer(), &[], now()).unwrap();

        assert_eq!((task.client_port, task.transport_port), (9200, 9300));
    }

    #[test]
    fn test_create_task_without_ports_fails() {
        let factory = TaskFactory::new(Arc::new(Configuration::default()));
        let mut offer = offer();
        offer.resources.ports = vec![PortRange::single(31000)];

        let err = factory.create_task(&offer, &[], now()).unwrap_err();
        assert!(matches!(err, TaskFactoryError::MissingPorts { .. }));
    }

    #[test]
    fn test_create_task_points_at_seed() {
        let factory = TaskFactory::new(Arc::new(Configuration::default()));
        let existing = vec![fixtures::task("task-0", "agent-0")];
        let task = factory.create_task(&offer(), &existing, now()).unwrap();

        assert_eq!(
            &task.executor.args[4..],
            &["--elasticsearchHost".to_string(), "agent-0.local:9300".to_string()]
        );
    }

    #[test]
    fn test_create_task_external_volumes() {
        let config = Configuration {
            external_volume_driver: Some("rexray".to_string()),
            ..Configuration::default()
        };
        let factory = TaskFactory::new(Arc::new(config));
        let existing = vec![
            fixtures::tagged_task("task-0", "agent-0", 0),
            fixtures::tagged_task("task-2", "agent-2", 2),
        ];
        let task = factory.create_task(&offer(), &existing, now()).unwrap();

        assert_eq!(task.node_id, Some(1));
        assert_eq!(task.resources.disk, 0.0);
        assert_eq!(task.executor.env[ENV_NODE_ID], "1");
        assert_eq!(task.executor.env[ENV_VOLUME_DRIVER], "rexray");
        assert_eq!(task.executor.env[ENV_CONFIG_VOLUME], "elasticsearch1config");
        assert_eq!(task.executor.env[ENV_DATA_VOLUME], "elasticsearch1data");
    }

    #[test]
    fn test_executor_ids_are_unique() {
        let factory = TaskFactory::new(Arc::new(Configuration::default()));
        let a = factory.create_task(&offer(), &[], now()).unwrap();
        let b = factory.create_task(&offer(), &[], now()).unwrap();
        assert_ne!(a.executor.executor_id, b.executor.executor_id);
    }
}
